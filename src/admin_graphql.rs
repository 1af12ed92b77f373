use async_graphql::EmptySubscription;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::admin_mutations::{AdminMutation, AdminQuery};
use crate::trial::FreeTrialService;

pub type AdminSchema = async_graphql::Schema<AdminQuery, AdminMutation, EmptySubscription>;

/// Build the admin GraphQL schema over the trial service
pub fn build_admin_schema(service: Arc<FreeTrialService>) -> AdminSchema {
    async_graphql::Schema::build(AdminQuery, AdminMutation, EmptySubscription)
        .data(service)
        .finish()
}

#[derive(Clone)]
pub struct AdminState {
    pub schema: AdminSchema,
}

async fn graphql_handler(
    State(state): State<Arc<AdminState>>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

/// GraphiQL playground
async fn playground() -> impl IntoResponse {
    axum::response::Html(
        async_graphql::http::GraphiQLSource::build()
            .endpoint("/admin/graphql")
            .finish(),
    )
}

pub fn router(schema: AdminSchema) -> Router {
    let state = Arc::new(AdminState { schema });

    Router::new()
        .route("/admin/graphql", post(graphql_handler))
        .route("/admin/playground", get(playground))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{FraudPolicy, TrialPolicy};
    use crate::storage::{MemoryStore, NewFraudFlag, Severity, TrialStore};

    fn schema() -> (Arc<MemoryStore>, AdminSchema) {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(FreeTrialService::new(
            store.clone(),
            TrialPolicy::default(),
            FraudPolicy::default(),
        ));
        (store, build_admin_schema(service))
    }

    #[tokio::test]
    async fn test_block_device_mutation() {
        let (store, schema) = schema();

        let resp = schema
            .execute(r#"mutation { blockDevice(fingerprintHash: "fp-9", reason: "chargeback") }"#)
            .await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        assert_eq!(
            resp.data.into_json().unwrap(),
            serde_json::json!({ "blockDevice": true })
        );

        let device = store.get_device("fp-9").await.unwrap().unwrap();
        assert!(device.is_blocked);
        assert_eq!(device.trial_count, 0);
    }

    #[tokio::test]
    async fn test_available_jobs_query() {
        let (_store, schema) = schema();

        let resp = schema.execute("{ availableJobs { name schedule } }").await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        let data = resp.data.into_json().unwrap();
        assert_eq!(data["availableJobs"][0]["name"], "expire_lapsed_trials");
        assert_eq!(data["availableJobs"][1]["name"], "cleanup_old_sessions");
    }

    #[tokio::test]
    async fn test_fraud_flags_limit_counts_unresolved_only() {
        let (store, schema) = schema();
        let flags: Vec<NewFraudFlag> = ["a", "b", "c"]
            .iter()
            .map(|t| NewFraudFlag::new(t, Severity::Low, 10, serde_json::json!({})))
            .collect();
        let stored = store.insert_flags("u1", "fp", &flags, 100).await.unwrap();
        store.resolve_flag(stored[2].id, 200).await.unwrap();

        let resp = schema
            .execute("{ fraudFlags(unresolvedOnly: true, limit: 2) { flagType resolved } }")
            .await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        assert_eq!(
            resp.data.into_json().unwrap()["fraudFlags"],
            serde_json::json!([
                { "flagType": "b", "resolved": false },
                { "flagType": "a", "resolved": false },
            ])
        );
    }

    #[tokio::test]
    async fn test_missing_trial_status_is_null() {
        let (_store, schema) = schema();

        let resp = schema
            .execute(r#"{ trialStatus(userId: "nobody") { tokenId } }"#)
            .await;
        assert!(resp.errors.is_empty(), "{:?}", resp.errors);
        assert_eq!(resp.data.into_json().unwrap()["trialStatus"], serde_json::Value::Null);
    }
}
