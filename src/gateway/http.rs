use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use subtle::ConstantTimeEq;

use super::observability::ObservabilitySnapshot;
use super::pipeline::Gateway;
use super::GatewayError;

pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
    max_body_bytes: usize,
}

impl GatewayHttpState {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Requires `Authorization: Bearer <token>` on `/admin/*`.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    fn admin_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return true;
        };
        let presented = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or_default();
        bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/admin/metrics", get(metrics))
        .fallback(handle_gateway)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Result<Json<ObservabilitySnapshot>, Response> {
    if !state.admin_authorized(&headers) {
        return Err(error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "unauthorized",
            "admin token required",
        ));
    }
    Ok(Json(state.gateway.observability().snapshot()))
}

async fn handle_gateway(
    State(state): State<GatewayHttpState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.gateway.handle(method, uri, headers, body).await
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(
    status: StatusCode,
    kind: &'static str,
    code: &'static str,
    message: impl std::fmt::Display,
) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
        .into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = error_response(self.status(), self.error_type(), self.code(), &self);
        if let GatewayError::RateLimited(decision) = &self {
            response.headers_mut().extend(decision.headers());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    use super::*;
    use crate::gateway::config::GatewayConfig;
    use crate::gateway::pipeline::GatewayParts;
    use crate::gateway::request::AuthError;
    use crate::gateway::store::MemoryStore;
    use crate::gateway::transport::HttpTransport;

    fn app(admin_token: Option<&str>) -> Router {
        let transport = Arc::new(HttpTransport::with_client(reqwest::Client::new()));
        let parts = GatewayParts::in_memory(Arc::new(MemoryStore::new()), transport);
        let gateway = Gateway::new(&GatewayConfig::default(), parts).unwrap();
        let mut state = GatewayHttpState::new(Arc::new(gateway));
        if let Some(token) = admin_token {
            state = state.with_admin_token(token);
        }
        router(state)
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = app(Some("secret"))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_require_the_admin_token_when_configured() {
        let response = app(Some("secret"))
            .oneshot(Request::get("/admin/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(Some("secret"))
            .oneshot(
                Request::get("/admin/metrics")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["requests"], 0);
    }

    #[tokio::test]
    async fn missing_credentials_produce_a_json_error() {
        let response = app(None)
            .oneshot(
                Request::post("/v1/chat/completions")
                    .body(Body::from(r#"{"model":"gpt-4o/openai"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], "missing_credentials");
    }

    #[test]
    fn error_bodies_carry_message_type_and_code() {
        let response = GatewayError::Auth(AuthError::Ambiguous).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
