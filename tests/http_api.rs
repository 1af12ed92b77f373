mod helpers;

use helpers::{memory_store, service, DeviceBuilder, UserBuilder};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use trialguard::fingerprint::fingerprint_hash;
use trialguard::storage::TrialStore;
use trialguard::web::{build_router, AppState};

/// Address the trusted proxy reports for the client in most tests.
const CLIENT_IP: &str = "203.0.113.77";

/// Spin up the public API on an OS-assigned port, returning the base URL.
async fn spawn_server(store: Arc<dyn TrialStore>, trust_forwarded_for: bool) -> String {
    let app = build_router(AppState {
        service: Arc::new(service(store)),
        trust_forwarded_for,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("http://127.0.0.1:{}", port)
}

/// Server that sits behind a trusted reverse proxy.
async fn spawn_test_server(store: Arc<dyn TrialStore>) -> String {
    spawn_server(store, true).await
}

async fn post_json(url: String, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .header("x-forwarded-for", CLIENT_IP)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_carries_security_headers() {
    let base = spawn_test_server(memory_store()).await;
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn activate_consume_and_status() {
    let store = memory_store();
    let user = UserBuilder::new("api@example.com")
        .create(store.as_ref())
        .await;
    let base = spawn_test_server(store).await;

    let resp = post_json(
        format!("{}/api/trial/activate", base),
        json!({
            "user_id": user.user_id,
            "fingerprint_hash": "fp-http",
        }),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let grant: Value = resp.json().await.unwrap();
    assert_eq!(grant["outcome"], "granted");
    assert_eq!(grant["reports_remaining"], 5);
    assert_eq!(grant["fraud_score"], 0);
    let token_id = grant["token_id"].as_str().unwrap().to_string();

    let resp = post_json(
        format!("{}/api/trial/consume", base),
        json!({"token_id": token_id, "report_id": "report-1"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["consumed"], true);

    let resp = reqwest::get(format!("{}/api/trial/status/{}", base, user.user_id))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let token: Value = resp.json().await.unwrap();
    assert_eq!(token["status"], "active");
    assert_eq!(token["reports_remaining"], 4);
}

#[tokio::test]
async fn consume_unknown_token_is_false() {
    let base = spawn_test_server(memory_store()).await;
    let resp = post_json(
        format!("{}/api/trial/consume", base),
        json!({"token_id": "nope", "report_id": "r"}),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["consumed"], false);
}

#[tokio::test]
async fn unknown_user_is_404() {
    let base = spawn_test_server(memory_store()).await;
    let resp = post_json(
        format!("{}/api/trial/activate", base),
        json!({"user_id": "ghost", "fingerprint_hash": "fp"}),
    )
    .await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "user_not_found");
}

#[tokio::test]
async fn blocked_device_is_403() {
    let store = memory_store();
    let user = UserBuilder::new("blocked@example.com")
        .create(store.as_ref())
        .await;
    DeviceBuilder::new("fp-banned")
        .blocked("chargeback")
        .create(store.as_ref())
        .await;
    let base = spawn_test_server(store).await;

    let resp = post_json(
        format!("{}/api/trial/activate", base),
        json!({"user_id": user.user_id, "fingerprint_hash": "fp-banned"}),
    )
    .await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "fraud_denied");
    assert_eq!(body["fraud_score"], 100);
    assert_eq!(body["flags"][0]["flag_type"], "device_blocked");
}

#[tokio::test]
async fn fingerprint_derived_from_device_data() {
    let store = memory_store();
    let user = UserBuilder::new("derived@example.com")
        .create(store.as_ref())
        .await;
    let base = spawn_test_server(store.clone()).await;
    let device_data = json!({"ua": "Safari", "screen": "390x844", "tz": "Europe/Berlin"});

    let resp = post_json(
        format!("{}/api/trial/activate", base),
        json!({"user_id": user.user_id, "device_data": device_data}),
    )
    .await;
    assert_eq!(resp.status(), 201);

    let device = store
        .get_device(&fingerprint_hash(&device_data))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(device.trial_count, 1);
    assert_eq!(device.device_data, Some(device_data));
}

#[tokio::test]
async fn missing_fingerprint_is_400() {
    let store = memory_store();
    let user = UserBuilder::new("nofp@example.com")
        .create(store.as_ref())
        .await;
    let base = spawn_test_server(store).await;

    let resp = post_json(
        format!("{}/api/trial/activate", base),
        json!({"user_id": user.user_id}),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn forwarded_for_address_is_scored() {
    let store = memory_store();
    let user = UserBuilder::new("proxy@example.com")
        .create(store.as_ref())
        .await;
    let base = spawn_test_server(store).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/trial/activate", base))
        .header("x-forwarded-for", "192.168.4.4, 198.51.100.1")
        .json(&json!({"user_id": user.user_id, "fingerprint_hash": "fp-proxy"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["fraud_score"], 20);
    assert_eq!(body["flags"][0]["flag_type"], "suspicious_ip");
    assert_eq!(body["flags"][0]["details"]["ip_address"], "192.168.4.4");
}

#[tokio::test]
async fn client_supplied_address_cannot_mask_peer() {
    let store = memory_store();
    let user = UserBuilder::new("masked@example.com")
        .create(store.as_ref())
        .await;
    // No trusted proxy: neither the header nor the body is believed
    let base = spawn_server(store, false).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/trial/activate", base))
        .header("x-forwarded-for", "203.0.113.9")
        .json(&json!({
            "user_id": user.user_id,
            "fingerprint_hash": "fp-masked",
            "ip_address": "203.0.113.10",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["fraud_score"], 20);
    assert_eq!(body["flags"][0]["flag_type"], "suspicious_ip");
    assert_eq!(body["flags"][0]["details"]["ip_address"], "127.0.0.1");
}

#[tokio::test]
async fn ingestion_endpoints_record_history() {
    let store = memory_store();
    let base = spawn_test_server(store.clone()).await;

    let resp = post_json(
        format!("{}/api/sessions", base),
        json!({"user_id": "u-1", "ip_address": "198.51.100.9", "user_agent": "curl/8"}),
    )
    .await;
    assert_eq!(resp.status(), 204);

    let resp = post_json(
        format!("{}/api/payments/verifications", base),
        json!({"user_id": "u-1", "card_fingerprint": "card-1", "succeeded": true}),
    )
    .await;
    assert_eq!(resp.status(), 204);

    assert_eq!(
        store
            .count_sessions_from_ip_since("198.51.100.9", 0)
            .await
            .unwrap(),
        1
    );
    let payment = store.latest_successful_payment("u-1").await.unwrap().unwrap();
    assert_eq!(payment.card_fingerprint, "card-1");
}

#[tokio::test]
async fn status_for_user_without_trial_is_404() {
    let base = spawn_test_server(memory_store()).await;
    let resp = reqwest::get(format!("{}/api/trial/status/nobody", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
