//! Public JSON API for trial activation and consumption, plus the ingestion
//! endpoints that feed the fraud checks. The admin GraphQL API is served on a
//! separate port (see [`crate::admin_graphql`]).
use crate::errors::TrialError;
use crate::fingerprint::fingerprint_hash;
use crate::settings::Settings;
use crate::trial::{FreeTrialService, TrialActivation, TrialActivationRequest};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, Extensions, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FreeTrialService>,
    /// Honour `X-Forwarded-For`; otherwise only the socket peer is used
    pub trust_forwarded_for: bool,
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    // JSON only, nothing to load
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    response
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/trial/activate", post(activate))
        .route("/api/trial/status/{user_id}", get(trial_status))
        .route("/api/trial/consume", post(consume))
        .route("/api/sessions", post(record_session))
        .route("/api/payments/verifications", post(record_payment))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

pub async fn serve(settings: Settings, service: Arc<FreeTrialService>) -> miette::Result<()> {
    let router = build_router(AppState {
        service: service.clone(),
        trust_forwarded_for: settings.server.trust_forwarded_for,
    });

    let public_addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    // Start admin GraphQL server on separate port
    let admin_addr: SocketAddr = format!("{}:{}", settings.server.host, settings.admin_port())
        .parse()
        .map_err(|e| miette::miette!("bad admin addr: {e}"))?;

    let admin_router =
        crate::admin_graphql::router(crate::admin_graphql::build_admin_schema(service));

    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%admin_addr, "Admin GraphQL API listening");
    tracing::info!(
        "GraphQL Playground available at http://{}/admin/playground",
        admin_addr
    );

    tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_router).await {
            tracing::error!(error = %e, "Admin server failed");
        }
    });

    // Start public server
    tracing::info!(%public_addr, "Public API listening");
    tracing::warn!("Rate limiting should be configured at the reverse proxy level for production");
    let listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .into_diagnostic()?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

fn error_response(e: TrialError) -> Response {
    let (status, code) = match &e {
        TrialError::UserNotFound(_) => (StatusCode::NOT_FOUND, "user_not_found"),
        TrialError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        _ => {
            tracing::error!(error = %e, "Request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    };
    (
        status,
        Json(json!({"error": code, "error_description": e.to_string()})),
    )
        .into_response()
}

/// Client address as seen by the transport: the first `X-Forwarded-For` hop
/// when the proxy is trusted, else the socket peer. Request bodies never
/// supply it.
fn client_ip(
    headers: &HeaderMap,
    extensions: &Extensions,
    trust_forwarded_for: bool,
) -> Option<String> {
    let forwarded = if trust_forwarded_for {
        headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    } else {
        None
    };
    forwarded.or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}

fn header_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    user_id: String,
    fingerprint_hash: Option<String>,
    device_data: Option<Value>,
    user_agent: Option<String>,
}

async fn activate(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(body): Json<ActivateBody>,
) -> impl IntoResponse {
    let fingerprint = match (body.fingerprint_hash, body.device_data.as_ref()) {
        (Some(hash), _) if !hash.trim().is_empty() => hash,
        (_, Some(data)) => fingerprint_hash(data),
        _ => {
            return error_response(TrialError::BadRequest(
                "fingerprint_hash or device_data required".to_string(),
            ))
        }
    };

    let req = TrialActivationRequest {
        user_id: body.user_id,
        fingerprint_hash: fingerprint,
        device_data: body.device_data,
        ip_address: client_ip(&headers, &extensions, state.trust_forwarded_for)
            .unwrap_or_default(),
        user_agent: body.user_agent.or_else(|| header_user_agent(&headers)),
    };

    match state.service.activate_trial(req).await {
        Ok(activation @ TrialActivation::Granted(_)) => {
            (StatusCode::CREATED, Json(activation)).into_response()
        }
        Ok(TrialActivation::Denied(denial)) => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "fraud_denied",
                "error_description": denial.reason,
                "fraud_score": denial.fraud_score,
                "flags": denial.flags,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn trial_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.service.get_trial_status(&user_id).await {
        Ok(Some(token)) => (StatusCode::OK, Json(token)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ConsumeBody {
    token_id: String,
    report_id: String,
}

async fn consume(
    State(state): State<AppState>,
    Json(body): Json<ConsumeBody>,
) -> impl IntoResponse {
    match state
        .service
        .consume_trial_report(&body.token_id, &body.report_id)
        .await
    {
        Ok(consumed) => (StatusCode::OK, Json(json!({"consumed": consumed}))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    user_id: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
}

async fn record_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(body): Json<SessionBody>,
) -> impl IntoResponse {
    let Some(ip) = body
        .ip_address
        .or_else(|| client_ip(&headers, &extensions, state.trust_forwarded_for))
    else {
        return error_response(TrialError::BadRequest(
            "ip_address could not be determined".to_string(),
        ));
    };
    let user_agent = body.user_agent.or_else(|| header_user_agent(&headers));

    match state
        .service
        .record_session(&body.user_id, &ip, user_agent.as_deref())
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    user_id: String,
    card_fingerprint: String,
    succeeded: bool,
}

async fn record_payment(
    State(state): State<AppState>,
    Json(body): Json<PaymentBody>,
) -> impl IntoResponse {
    match state
        .service
        .record_payment_verification(&body.user_id, &body.card_fingerprint, body.succeeded)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}
