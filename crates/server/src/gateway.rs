use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use zaproute_core::config::ServerConfig;
use zaproute_core::context::RequestContext;
use zaproute_core::error::RouteError;
use zaproute_core::metrics::{MetricsSnapshot, MetricsStore};
use zaproute_core::store::CrmStore;
use zaproute_routing::delivery::{DeliveryRouter, SendRequest};
use zaproute_routing::inbound::mark_conversation_read;
use zaproute_routing::pipeline::{ProcessingResult, WebhookPipeline};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn CrmStore>,
    pipeline: Arc<WebhookPipeline>,
    delivery: Arc<DeliveryRouter>,
    metrics: Arc<MetricsStore>,
    config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn CrmStore>,
        pipeline: Arc<WebhookPipeline>,
        delivery: Arc<DeliveryRouter>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            store,
            pipeline,
            delivery,
            metrics,
            config: Arc::new(config),
        }
    }
}

pub struct Gateway {
    state: AppState,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Structured error body of the `/api` endpoints.
struct ApiError(RouteError);

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &RouteError) -> StatusCode {
    match err {
        RouteError::Validation(_) => StatusCode::BAD_REQUEST,
        RouteError::NotFound(_) => StatusCode::NOT_FOUND,
        RouteError::WorkspaceMismatch(_) => StatusCode::FORBIDDEN,
        RouteError::MissingConnection(_) | RouteError::InstanceNotResolved { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RouteError::Dispatch(_) => StatusCode::BAD_GATEWAY,
        RouteError::Database(_) | RouteError::Unexpected(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": { "code": self.0.code(), "message": self.0.to_string() },
        });
        (status_for(&self.0), Json(body)).into_response()
    }
}

impl Gateway {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/monitor/metrics", get(get_metrics))
            .route("/api/messages/send", post(send_message))
            .route("/api/conversations/:conversation_id/read", post(mark_read))
            .layer(DefaultBodyLimit::max(self.state.config.max_body_bytes))
            // Reads its own bounded body so oversized events still get a 200.
            .route("/webhook/evolution", get(webhook_verify).post(webhook_receive))
            .with_state(self.state.clone())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let config = &self.state.config;
        let requested: IpAddr = config
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

        // Security: never expose an unauthenticated API beyond localhost
        let ip = if config.api_token.is_none() && !requested.is_loopback() {
            warn!(host = %config.host, "No API token configured, binding to 127.0.0.1 only");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            requested
        };
        let addr = SocketAddr::new(ip, config.port);

        info!("Gateway listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

type HmacSha256 = Hmac<Sha256>;

/// Compare secrets without leaking the matching prefix length through timing.
fn secrets_match(provided: &str, expected: &str) -> bool {
    let Ok(mut reference) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    reference.update(expected.as_bytes());
    let expected_tag = reference.finalize().into_bytes();

    let Ok(mut candidate) = HmacSha256::new_from_slice(expected.as_bytes()) else {
        return false;
    };
    candidate.update(provided.as_bytes());
    candidate.verify_slice(&expected_tag).is_ok()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Verify the Authorization header against the configured API token.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected_token) = &state.config.api_token else {
        // No auth configured = local-only, all requests allowed
        return Ok(());
    };

    match bearer_token(headers) {
        None => Err(StatusCode::UNAUTHORIZED),
        Some(provided) if secrets_match(provided, expected_token) => Ok(()),
        Some(_) => {
            warn!("Unauthorized API access attempt");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Gateway credential from `Authorization: Bearer`, `apikey` or `?token=`.
fn check_webhook_token(
    state: &AppState,
    headers: &HeaderMap,
    query: &TokenQuery,
) -> Result<(), StatusCode> {
    let Some(expected) = state
        .config
        .webhook_token
        .as_deref()
        .filter(|t| !t.is_empty())
    else {
        return Ok(());
    };

    let provided = bearer_token(headers)
        .or_else(|| header_str(headers, "apikey"))
        .or_else(|| query.token.as_deref().map(str::trim).filter(|t| !t.is_empty()));

    match provided {
        None => {
            warn!("Webhook request without credential");
            Err(StatusCode::UNAUTHORIZED)
        }
        Some(token) if secrets_match(token, expected) => Ok(()),
        Some(_) => {
            warn!("Webhook request with wrong credential");
            Err(StatusCode::FORBIDDEN)
        }
    }
}

fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), StatusCode> {
    let Some(signature) = header_str(headers, "x-hub-signature-256") else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(provided) = signature.strip_prefix("sha256=").and_then(decode_hex) else {
        return Err(StatusCode::FORBIDDEN);
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return Err(StatusCode::FORBIDDEN),
    };
    mac.update(body);

    if mac.verify_slice(&provided).is_ok() {
        Ok(())
    } else {
        warn!("Webhook signature mismatch");
        Err(StatusCode::FORBIDDEN)
    }
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    RequestContext::new()
        .with_correlation_id(header_str(headers, "x-request-id"))
        .with_tenant(header_str(headers, "x-workspace-id"))
        .with_user(header_str(headers, "x-user-id"))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.metrics.snapshot()))
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhook/evolution: subscription handshake
async fn webhook_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<String, StatusCode> {
    let expected = state.config.verify_token.as_deref().unwrap_or_default();
    let provided = query.verify_token.as_deref().unwrap_or_default();

    if query.mode.as_deref() != Some("subscribe") {
        return Err(StatusCode::BAD_REQUEST);
    }
    if expected.is_empty() || provided != expected {
        warn!("Webhook verification with wrong token");
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(query.challenge.unwrap_or_default())
}

/// Acknowledge an authenticated delivery that never reaches the pipeline.
fn reject_webhook(state: &AppState, reason: String) -> Json<ProcessingResult> {
    state.metrics.inc_webhooks_received();
    state.metrics.inc_webhooks_rejected();
    Json(ProcessingResult::rejected(reason))
}

/// POST /webhook/evolution: once authenticated, always answered with 200.
async fn webhook_receive(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ProcessingResult>, StatusCode> {
    check_webhook_token(&state, &headers, &query)?;
    let ctx = request_context(&headers);
    let limit = state.config.max_body_bytes;

    let declared = header_str(&headers, "content-length").and_then(|v| v.parse::<usize>().ok());
    let body = match declared {
        Some(len) if len > limit => None,
        _ => to_bytes(body, limit).await.ok(),
    };
    let Some(body) = body else {
        warn!(
            request_id = %ctx.correlation_id,
            limit,
            declared = ?declared,
            "Webhook body exceeds limit; acknowledged without processing"
        );
        return Ok(reject_webhook(&state, "payload too large".to_string()));
    };

    if let Some(secret) = state.config.app_secret.as_deref().filter(|s| !s.is_empty()) {
        verify_signature(&headers, &body, secret)?;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(request_id = %ctx.correlation_id, error = %e, "Webhook body is not valid JSON");
            return Ok(reject_webhook(&state, format!("invalid JSON: {e}")));
        }
    };

    Ok(Json(state.pipeline.handle(&ctx, &payload).await))
}

/// POST /api/messages/send
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StatusCode> {
    check_auth(&state, &headers)?;
    let ctx = request_context(&headers);

    let request: SendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = RouteError::Validation(format!("invalid request body: {e}"));
            return Ok(ApiError(err).into_response());
        }
    };

    match state.delivery.send(&ctx, request).await {
        Ok(sent) => Ok(Json(json!({ "success": true, "message": sent })).into_response()),
        Err(e) => Ok(ApiError::from(e).into_response()),
    }
}

/// POST /api/conversations/:conversation_id/read
async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    check_auth(&state, &headers)?;
    let ctx = request_context(&headers);

    match mark_conversation_read(state.store.as_ref(), &ctx, &conversation_id).await {
        Ok(marked) => Ok(Json(json!({ "success": true, "marked": marked })).into_response()),
        Err(e) => Ok(ApiError::from(e).into_response()),
    }
}
