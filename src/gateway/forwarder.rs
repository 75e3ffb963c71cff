//! Ordered model fallback: try each `<model>/<provider>` candidate until one succeeds.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use super::credentials::{CredentialError, CredentialManager, ProviderCredential, sign};
use super::providers::{AuthStyle, ProviderName, ProviderTable, is_claude_model};
use super::router::{ModelRoute, RouteCandidate, parse_candidate};
use super::transport::{OutboundRequest, Transport, TransportResponse};
use super::translation::{Dialect, DialectRegistry};

const ERROR_BODY_LIMIT: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptErrorKind {
    InvalidFormat,
    MissingProviderKey,
    RequestFailed,
}

impl AttemptErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptErrorKind::InvalidFormat => "invalid_format",
            AttemptErrorKind::MissingProviderKey => "missing_provider_key",
            AttemptErrorKind::RequestFailed => "request_failed",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}: {message}", kind.as_str())]
pub struct AttemptError {
    pub kind: AttemptErrorKind,
    pub message: String,
    pub http_code: u16,
}

impl AttemptError {
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self {
            kind: AttemptErrorKind::InvalidFormat,
            message: message.into(),
            http_code: 400,
        }
    }

    pub fn missing_provider_key(message: impl Into<String>) -> Self {
        Self {
            kind: AttemptErrorKind::MissingProviderKey,
            message: message.into(),
            http_code: 400,
        }
    }

    pub fn request_failed(message: impl Into<String>, http_code: u16) -> Self {
        Self {
            kind: AttemptErrorKind::RequestFailed,
            message: message.into(),
            http_code,
        }
    }
}

/// Everything one forward needs from the inbound request.
#[derive(Clone, Copy, Debug)]
pub struct ForwardRequest<'a> {
    pub organization_id: &'a str,
    pub body: &'a Value,
    /// Caller headers already stripped of gateway credentials.
    pub headers: &'a HeaderMap,
    /// Dialect the caller wrote the body in.
    pub body_dialect: Dialect,
    /// Provider key the caller sent alongside the gateway credential.
    pub caller_provider_key: Option<&'a str>,
    /// Provider key bound to the gateway credential (proxy and customer portal keys). It
    /// wins over stored credentials for its provider.
    pub bound_provider_key: Option<(ProviderName, &'a str)>,
}

#[derive(Debug)]
pub struct GatewayResponse {
    pub response: TransportResponse,
    pub candidate: RouteCandidate,
    /// Zero-based position of the winning candidate in the routing string.
    pub attempt_index: usize,
}

pub struct Forwarder {
    credentials: Arc<CredentialManager>,
    providers: ProviderTable,
    dialects: DialectRegistry,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        credentials: Arc<CredentialManager>,
        providers: ProviderTable,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            providers,
            dialects: DialectRegistry::default(),
            timeout,
        }
    }

    pub fn with_dialects(mut self, dialects: DialectRegistry) -> Self {
        self.dialects = dialects;
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    pub async fn forward(
        &self,
        route: &ModelRoute,
        request: ForwardRequest<'_>,
        transport: &dyn Transport,
    ) -> Result<GatewayResponse, AttemptError> {
        if route.is_empty() {
            return Err(AttemptError::invalid_format("No models provided"));
        }

        let mut last_error = None;
        for (attempt_index, raw) in route.entries().iter().enumerate() {
            match self.attempt(raw, request, transport).await {
                Ok((candidate, response)) => {
                    tracing::debug!(attempt = attempt_index, %candidate, "candidate succeeded");
                    return Ok(GatewayResponse {
                        response,
                        candidate,
                        attempt_index,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        attempt = attempt_index,
                        candidate = %raw,
                        kind = err.kind.as_str(),
                        code = err.http_code,
                        error = %err.message,
                        "candidate failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AttemptError::request_failed("All models failed", 500)))
    }

    async fn attempt(
        &self,
        raw: &str,
        request: ForwardRequest<'_>,
        transport: &dyn Transport,
    ) -> Result<(RouteCandidate, TransportResponse), AttemptError> {
        let candidate =
            parse_candidate(raw).map_err(|err| AttemptError::invalid_format(err.to_string()))?;
        let credential = self
            .resolve_credential(&candidate, request)
            .await?;

        let stream = request
            .body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let body = self.prepare_body(&candidate, request.body, request.body_dialect)?;
        let body = serde_json::to_vec(&body)
            .map_err(|err| AttemptError::invalid_format(err.to_string()))?;

        let url = self
            .providers
            .endpoint(candidate.provider, &candidate.model, stream, &credential)
            .map_err(|err| AttemptError::request_failed(err.to_string(), 500))?;
        let target_base_url = self
            .providers
            .base_url(candidate.provider, &credential)
            .map_err(|err| AttemptError::request_failed(err.to_string(), 500))?;

        let mut headers = request.headers.clone();
        headers.remove("authorization");
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let mut outbound = OutboundRequest {
            method: Method::POST,
            url,
            headers,
            body: Bytes::from(body),
        };
        sign(&mut outbound, &credential)
            .map_err(|err| AttemptError::missing_provider_key(err.to_string()))?;

        let response = match tokio::time::timeout(
            self.timeout,
            transport.forward(&target_base_url, outbound),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(AttemptError::request_failed(err.to_string(), 500)),
            Err(_) => {
                return Err(AttemptError::request_failed(
                    format!("request to {target_base_url} timed out after {:?}", self.timeout),
                    500,
                ));
            }
        };

        if response.status.is_success() {
            return Ok((candidate, response));
        }

        let status = response.status;
        let body = response.body.collect(ERROR_BODY_LIMIT).await;
        let message = upstream_error_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(AttemptError::request_failed(message, status.as_u16()))
    }

    async fn resolve_credential(
        &self,
        candidate: &RouteCandidate,
        request: ForwardRequest<'_>,
    ) -> Result<ProviderCredential, AttemptError> {
        if let Some((_, key)) = request
            .bound_provider_key
            .filter(|(provider, _)| *provider == candidate.provider)
        {
            return Ok(ProviderCredential::caller_supplied(candidate.provider, key));
        }
        match self
            .credentials
            .get_credential(candidate.provider, request.organization_id)
            .await
        {
            Ok(credential) => Ok(credential),
            Err(CredentialError::Missing { .. }) => request
                .caller_provider_key
                .filter(|_| accepts_plain_key(candidate.provider))
                .map(|key| ProviderCredential::caller_supplied(candidate.provider, key))
                .ok_or_else(|| AttemptError::missing_provider_key("Missing/Incorrect provider key")),
            Err(err) => Err(AttemptError::missing_provider_key(err.to_string())),
        }
    }

    fn prepare_body(
        &self,
        candidate: &RouteCandidate,
        body: &Value,
        body_dialect: Dialect,
    ) -> Result<Value, AttemptError> {
        let Value::Object(fields) = body else {
            return Err(AttemptError::invalid_format("request body must be a json object"));
        };
        let mut body = fields.clone();
        body.insert("model".to_string(), Value::String(candidate.model.clone()));

        let anthropic_version = match candidate.provider {
            ProviderName::Bedrock => "bedrock-2023-05-31",
            ProviderName::Vertex => "vertex-2023-10-16",
            _ => {
                let target = candidate.provider.dialect_for(&candidate.model);
                return self
                    .dialects
                    .translate(body_dialect, target, Value::Object(body))
                    .map_err(|err| AttemptError::invalid_format(err.to_string()));
            }
        };
        if !is_claude_model(&candidate.model) {
            return Ok(Value::Object(body));
        }

        let translated = self
            .dialects
            .translate(body_dialect, Dialect::Anthropic, Value::Object(body))
            .map_err(|err| AttemptError::invalid_format(err.to_string()))?;
        let Value::Object(mut translated) = translated else {
            return Err(AttemptError::invalid_format("translated body is not an object"));
        };
        translated.remove("model");
        if candidate.provider == ProviderName::Bedrock {
            // Bedrock selects streaming by endpoint.
            translated.remove("stream");
        }
        translated.insert(
            "anthropic_version".to_string(),
            Value::String(anthropic_version.to_string()),
        );
        Ok(Value::Object(translated))
    }
}

fn accepts_plain_key(provider: ProviderName) -> bool {
    matches!(provider.auth_style(), AuthStyle::Bearer | AuthStyle::Header(_))
}

/// `message`, then `error.message`, then the raw body text.
pub fn upstream_error_message(body: &[u8]) -> Option<String> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/error/message").and_then(Value::as_str));
        if let Some(message) = message {
            return Some(message.to_string());
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::gateway::credentials::CredentialSecret;
    use crate::gateway::kv::MemoryKvStore;
    use crate::gateway::store::MemoryStore;
    use crate::gateway::transport::{ResponseBody, TransportError};

    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<OutboundRequest>>,
        status: Option<StatusCode>,
        body: &'static str,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn forward(
            &self,
            _target_base_url: &str,
            request: OutboundRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            Ok(TransportResponse {
                status: self.status.unwrap_or(StatusCode::OK),
                headers: HeaderMap::new(),
                body: ResponseBody::Full(Bytes::from_static(self.body.as_bytes())),
            })
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn forward(
            &self,
            target_base_url: &str,
            _request: OutboundRequest,
        ) -> Result<TransportResponse, TransportError> {
            Err(TransportError::Request {
                target: target_base_url.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn api_key(provider: ProviderName, key: &str) -> ProviderCredential {
        ProviderCredential {
            key_id: format!("{provider}-key"),
            provider,
            secret: CredentialSecret::ApiKey {
                key: key.to_string(),
            },
            region: None,
            settings: BTreeMap::new(),
        }
    }

    async fn forwarder(credentials: Vec<ProviderCredential>) -> Forwarder {
        let store = Arc::new(MemoryStore::new());
        for credential in credentials {
            store.upsert_credential("org-1", credential).await;
        }
        let manager = CredentialManager::new(
            store,
            Arc::new(MemoryKvStore::default()),
            Duration::from_secs(1),
        );
        Forwarder::new(
            Arc::new(manager),
            ProviderTable::default(),
            Duration::from_secs(5),
        )
    }

    fn request<'a>(body: &'a Value, headers: &'a HeaderMap) -> ForwardRequest<'a> {
        ForwardRequest {
            organization_id: "org-1",
            body,
            headers,
            body_dialect: Dialect::OpenAi,
            caller_provider_key: None,
            bound_provider_key: None,
        }
    }

    #[tokio::test]
    async fn falls_back_past_an_unknown_provider() {
        let forwarder = forwarder(vec![api_key(ProviderName::OpenAi, "sk-openai")]).await;
        let transport = RecordingTransport {
            body: r#"{"id":"chatcmpl-1"}"#,
            ..Default::default()
        };
        let body = json!({"model": "ignored", "messages": [{"role": "user", "content": "hi"}]});
        let headers = HeaderMap::new();

        let response = forwarder
            .forward(
                &ModelRoute::parse("a/unknownprovider,b/openai"),
                request(&body, &headers),
                &transport,
            )
            .await
            .unwrap();
        assert_eq!(response.attempt_index, 1);
        assert_eq!(response.candidate.provider, ProviderName::OpenAi);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url.as_str(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(seen[0].headers.get("authorization").unwrap(), "Bearer sk-openai");
        let sent: Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(sent["model"], "b");
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let forwarder = forwarder(vec![api_key(ProviderName::OpenAi, "sk-openai")]).await;
        let body = json!({"messages": []});
        let headers = HeaderMap::new();

        let err = forwarder
            .forward(
                &ModelRoute::parse("gpt-4o/openai,claude-3-haiku/anthropic"),
                request(&body, &headers),
                &FailingTransport,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, AttemptErrorKind::MissingProviderKey);
        assert_eq!(err.http_code, 400);

        let err = forwarder
            .forward(&ModelRoute::parse(""), request(&body, &headers), &FailingTransport)
            .await
            .unwrap_err();
        assert_eq!(err, AttemptError::invalid_format("No models provided"));

        let err = forwarder
            .forward(
                &ModelRoute::parse("gpt-4o/openai"),
                request(&body, &headers),
                &FailingTransport,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, AttemptErrorKind::RequestFailed);
        assert_eq!(err.http_code, 500);
    }

    #[tokio::test]
    async fn upstream_status_and_message_are_preserved() {
        let forwarder = forwarder(vec![api_key(ProviderName::OpenAi, "sk-openai")]).await;
        let transport = RecordingTransport {
            status: Some(StatusCode::TOO_MANY_REQUESTS),
            body: r#"{"error":{"message":"slow down","type":"rate_limit"}}"#,
            ..Default::default()
        };
        let body = json!({"messages": []});
        let headers = HeaderMap::new();

        let err = forwarder
            .forward(
                &ModelRoute::parse("gpt-4o/openai"),
                request(&body, &headers),
                &transport,
            )
            .await
            .unwrap_err();
        assert_eq!(err, AttemptError::request_failed("slow down", 429));
    }

    #[tokio::test]
    async fn caller_key_is_used_when_no_credential_is_stored() {
        let forwarder = forwarder(Vec::new()).await;
        let transport = RecordingTransport {
            body: "{}",
            ..Default::default()
        };
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let headers = HeaderMap::new();
        let mut req = request(&body, &headers);
        req.caller_provider_key = Some("sk-caller");

        forwarder
            .forward(&ModelRoute::parse("claude-3-haiku/anthropic"), req, &transport)
            .await
            .unwrap();
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].headers.get("x-api-key").unwrap(), "sk-caller");
        let sent: Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(sent["max_tokens"], 4096);
        assert_eq!(sent["model"], "claude-3-haiku");
    }

    #[tokio::test]
    async fn bound_key_wins_over_stored_credential_for_its_provider() {
        let forwarder = forwarder(vec![api_key(ProviderName::OpenAi, "sk-stored")]).await;
        let transport = RecordingTransport {
            body: "{}",
            ..Default::default()
        };
        let body = json!({"messages": []});
        let headers = HeaderMap::new();
        let mut req = request(&body, &headers);
        req.bound_provider_key = Some((ProviderName::Anthropic, "sk-bound"));

        forwarder
            .forward(&ModelRoute::parse("gpt-4o/openai"), req, &transport)
            .await
            .unwrap();
        req.bound_provider_key = Some((ProviderName::OpenAi, "sk-bound"));
        forwarder
            .forward(&ModelRoute::parse("gpt-4o/openai"), req, &transport)
            .await
            .unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].headers.get("authorization").unwrap(), "Bearer sk-stored");
        assert_eq!(seen[1].headers.get("authorization").unwrap(), "Bearer sk-bound");
    }

    #[tokio::test]
    async fn bedrock_claude_body_is_translated_and_path_addressed() {
        let credential = ProviderCredential {
            key_id: "aws".to_string(),
            provider: ProviderName::Bedrock,
            secret: CredentialSecret::AccessKeys {
                access_key: "AKIDEXAMPLE".to_string(),
                secret_key: "secret".to_string(),
                session_token: None,
            },
            region: Some("us-east-1".to_string()),
            settings: BTreeMap::new(),
        };
        let forwarder = forwarder(vec![credential]).await;
        let transport = RecordingTransport {
            body: "{}",
            ..Default::default()
        };
        let body = json!({
            "stream": false,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        });
        let headers = HeaderMap::new();

        forwarder
            .forward(
                &ModelRoute::parse("anthropic.claude-3-haiku-20240307-v1:0/bedrock"),
                request(&body, &headers),
                &transport,
            )
            .await
            .unwrap();

        let seen = transport.seen.lock().unwrap();
        assert!(seen[0].url.path().ends_with("/invoke"));
        let sent: Value = serde_json::from_slice(&seen[0].body).unwrap();
        assert_eq!(sent["anthropic_version"], "bedrock-2023-05-31");
        assert_eq!(sent["system"], "be brief");
        assert!(sent.get("model").is_none());
        assert!(sent.get("stream").is_none());
        assert!(
            seen[0]
                .headers
                .get("authorization")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("AWS4-HMAC-SHA256")
        );
    }

    #[test]
    fn error_message_prefers_top_level_message() {
        assert_eq!(
            upstream_error_message(br#"{"message":"top","error":{"message":"nested"}}"#),
            Some("top".to_string())
        );
        assert_eq!(
            upstream_error_message(br#"{"error":{"message":"nested"}}"#),
            Some("nested".to_string())
        );
        assert_eq!(upstream_error_message(b" bad gateway "), Some("bad gateway".to_string()));
        assert_eq!(upstream_error_message(b""), None);
    }
}
