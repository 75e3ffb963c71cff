//! Inbound request normalization: credential extraction, side-channel headers, lazy body.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use super::identity::AuthIdentity;
use super::ids::generate_uuid;

pub const GATEWAY_KEY_PREFIXES: [&str; 2] = ["sk-helicone-", "pk-helicone-"];
pub const DEFAULT_MAX_LOOP_DEPTH: u32 = 3;

const REQUEST_ID_HEADER: &str = "helicone-request-id";
const LOOP_DEPTH_HEADER: &str = "helicone-loop-depth";
const PROPERTY_PREFIX: &str = "helicone-property-";
const MAX_REQUEST_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("ambiguous credentials: combined Authorization header together with Helicone-Auth")]
    Ambiguous,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("missing gateway credential")]
    Missing,
    #[error("invalid gateway credential")]
    Invalid,
    #[error("proxy key verification failed")]
    ProxyKeyMismatch,
    #[error("usage limit exceeded for key {key_id}")]
    UsageLimitExceeded { key_id: String },
    #[error("identity store unavailable: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("forwarding loop detected: depth {depth} exceeds {max}")]
    LoopDetected { depth: u32, max: u32 },
    #[error("request body was already read; it can no longer be overridden")]
    BodyAlreadyRead,
    #[error("request body was already overridden")]
    BodyAlreadyOverridden,
}

#[derive(Clone, Copy, Debug)]
pub struct NormalizeConfig {
    pub max_loop_depth: u32,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_loop_depth: DEFAULT_MAX_LOOP_DEPTH,
        }
    }
}

/// Raw body with a lazily parsed view. An override is merged in at first read.
struct LazyBody {
    raw: Bytes,
    patch: Option<Map<String, Value>>,
    json: OnceLock<Option<Value>>,
    text: OnceLock<String>,
}

impl LazyBody {
    fn new(raw: Bytes) -> Self {
        Self {
            raw,
            patch: None,
            json: OnceLock::new(),
            text: OnceLock::new(),
        }
    }

    fn is_read(&self) -> bool {
        self.json.get().is_some() || self.text.get().is_some()
    }

    fn json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| {
                let mut value = serde_json::from_slice::<Value>(&self.raw).ok()?;
                if let (Some(patch), Value::Object(fields)) = (&self.patch, &mut value) {
                    for (key, field) in patch {
                        fields.insert(key.clone(), field.clone());
                    }
                }
                Some(value)
            })
            .as_ref()
    }

    fn text(&self) -> &str {
        self.text.get_or_init(|| {
            if self.patch.is_some() {
                if let Some(value) = self.json() {
                    return value.to_string();
                }
            }
            String::from_utf8_lossy(&self.raw).into_owned()
        })
    }
}

pub struct InboundRequest {
    method: Method,
    host: String,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: LazyBody,
    request_id: String,
    gateway_key: Option<String>,
    provider_key: Option<String>,
    loop_depth: u32,
    properties: BTreeMap<String, String>,
    prompt_id: Option<String>,
    user_id: Option<String>,
    identity: Option<AuthIdentity>,
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("request_id", &self.request_id)
            .field("gateway_key", &self.gateway_key.as_ref().map(|_| "<redacted>"))
            .field("provider_key", &self.provider_key.as_ref().map(|_| "<redacted>"))
            .field("loop_depth", &self.loop_depth)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl InboundRequest {
    pub fn normalize(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
        config: &NormalizeConfig,
    ) -> Result<Self, RequestError> {
        let mut headers = headers;
        let (mut gateway_key, provider_key) = split_credentials(&headers)?;

        let mut path = uri.path().to_string();
        if gateway_key.is_none() {
            if let Some((key, rest)) = take_key_segment(&path) {
                gateway_key = Some(key);
                path = rest;
            }
        }

        let loop_depth = header_str(&headers, LOOP_DEPTH_HEADER)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .unwrap_or(0)
            .saturating_add(1);
        if loop_depth > config.max_loop_depth {
            return Err(RequestError::LoopDetected {
                depth: loop_depth,
                max: config.max_loop_depth,
            });
        }
        headers.insert(LOOP_DEPTH_HEADER, HeaderValue::from(loop_depth));

        let request_id = header_str(&headers, REQUEST_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
            .map(str::to_string)
            .unwrap_or_else(generate_uuid);

        let properties = headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(PROPERTY_PREFIX)?;
                Some((key.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let prompt_id = header_str(&headers, "helicone-prompt-id").map(str::to_string);
        let user_id = header_str(&headers, "helicone-user-id").map(str::to_string);
        let host = header_str(&headers, "host")
            .unwrap_or("localhost")
            .to_string();

        Ok(Self {
            method,
            host,
            path,
            query: uri.query().map(str::to_string),
            headers,
            body: LazyBody::new(body),
            request_id,
            gateway_key,
            provider_key,
            loop_depth,
            properties,
            prompt_id,
            user_id,
            identity: None,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Absolute URL as the caller addressed it, minus any credential path segment.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("https://{}{}?{query}", self.host, self.path),
            None => format!("https://{}{}", self.host, self.path),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(header = name, "dropping invalid header");
            return;
        };
        self.headers.insert(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Caller headers safe to send upstream: gateway credentials and gateway-only headers
    /// removed. The loop depth travels along so chained gateways can detect cycles.
    pub fn forwardable_headers(&self) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in &self.headers {
            let lower = name.as_str();
            let gateway_only = lower.starts_with("helicone-") && lower != LOOP_DEPTH_HEADER;
            if gateway_only
                || matches!(lower, "authorization" | "host" | "content-length" | "x-api-key")
            {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
        out
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn gateway_key(&self) -> Option<&str> {
        self.gateway_key.as_deref()
    }

    pub fn provider_key(&self) -> Option<&str> {
        self.provider_key.as_deref()
    }

    pub fn loop_depth(&self) -> u32 {
        self.loop_depth
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.prompt_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn identity(&self) -> Option<&AuthIdentity> {
        self.identity.as_ref()
    }

    /// Records the resolved identity and publishes the organization id for later phases.
    pub fn set_identity(&mut self, identity: AuthIdentity) {
        let organization_id = identity.organization_id().to_string();
        self.set_header("helicone-organization-id", &organization_id);
        self.identity = Some(identity);
    }

    pub fn raw_body(&self) -> &Bytes {
        &self.body.raw
    }

    /// Parsed JSON body, or `None` when the body is not JSON.
    pub fn safe_json(&self) -> Option<&Value> {
        self.body.json()
    }

    /// Body text with any override applied.
    pub fn unsafe_text(&self) -> &str {
        self.body.text()
    }

    /// Replaces top-level body fields. Allowed once and only before the body is read.
    pub fn override_body(&mut self, patch: Map<String, Value>) -> Result<(), RequestError> {
        if self.body.is_read() {
            return Err(RequestError::BodyAlreadyRead);
        }
        if self.body.patch.is_some() {
            return Err(RequestError::BodyAlreadyOverridden);
        }
        self.body.patch = Some(patch);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.safe_json()
            .and_then(|body| body.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
        _ => raw,
    }
}

pub fn is_gateway_key(raw: &str) -> bool {
    GATEWAY_KEY_PREFIXES
        .iter()
        .any(|prefix| raw.starts_with(prefix))
}

/// Splits `Authorization` / `Helicone-Auth` into (gateway key, provider key).
fn split_credentials(
    headers: &HeaderMap,
) -> Result<(Option<String>, Option<String>), AuthError> {
    let authorization = header_str(headers, "authorization").map(str::trim);
    let helicone_auth = header_str(headers, "helicone-auth")
        .map(strip_bearer)
        .filter(|key| !key.is_empty());

    if let Some(combined) = authorization.filter(|value| value.contains(',')) {
        if helicone_auth.is_some() {
            return Err(AuthError::Ambiguous);
        }
        let parts = combined
            .split(',')
            .map(strip_bearer)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>();
        let [first, second] = parts.as_slice() else {
            return Err(AuthError::Malformed);
        };
        return match (is_gateway_key(first), is_gateway_key(second)) {
            (false, true) => Ok((Some(second.to_string()), Some(first.to_string()))),
            (true, false) => Ok((Some(first.to_string()), Some(second.to_string()))),
            _ => Err(AuthError::Malformed),
        };
    }

    let bearer = authorization
        .map(strip_bearer)
        .filter(|key| !key.is_empty());
    match (helicone_auth, bearer) {
        (Some(gateway), provider) => Ok((Some(gateway.to_string()), provider.map(str::to_string))),
        (None, Some(key)) if is_gateway_key(key) => Ok((Some(key.to_string()), None)),
        (None, provider) => Ok((None, provider.map(str::to_string))),
    }
}

/// Finds a path segment carrying a gateway key and returns it with the remaining path.
fn take_key_segment(path: &str) -> Option<(String, String)> {
    let segments = path.split('/').collect::<Vec<_>>();
    let index = segments.iter().position(|segment| is_gateway_key(segment))?;
    let key = segments[index].to_string();
    let rest = segments
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, segment)| *segment)
        .collect::<Vec<_>>()
        .join("/");
    let rest = if rest.is_empty() { "/".to_string() } else { rest };
    Some((key, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GATEWAY_KEY: &str = "sk-helicone-aaaaaaa-bbbbbbb-ccccccc-ddddddd";

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    fn normalize(path: &str, pairs: &[(&str, &str)], body: &'static str) -> Result<InboundRequest, RequestError> {
        InboundRequest::normalize(
            Method::POST,
            &path.parse::<Uri>().unwrap(),
            headers(pairs),
            Bytes::from_static(body.as_bytes()),
            &NormalizeConfig::default(),
        )
    }

    #[test]
    fn combined_authorization_splits_provider_and_gateway_keys() {
        let combined = format!("Bearer sk-prov, Bearer {GATEWAY_KEY}");
        let request = normalize("/v1/chat/completions", &[("authorization", &combined)], "{}").unwrap();
        assert_eq!(request.provider_key(), Some("sk-prov"));
        assert_eq!(request.gateway_key(), Some(GATEWAY_KEY));

        let err = normalize(
            "/v1/chat/completions",
            &[("authorization", &combined), ("helicone-auth", "Bearer sk-helicone-x")],
            "{}",
        )
        .unwrap_err();
        assert!(matches!(err, RequestError::Auth(AuthError::Ambiguous)));
    }

    #[test]
    fn helicone_auth_leaves_authorization_as_provider_key() {
        let request = normalize(
            "/v1/chat/completions",
            &[
                ("authorization", "Bearer sk-openai"),
                ("helicone-auth", &format!("Bearer {GATEWAY_KEY}")),
            ],
            "{}",
        )
        .unwrap();
        assert_eq!(request.gateway_key(), Some(GATEWAY_KEY));
        assert_eq!(request.provider_key(), Some("sk-openai"));
    }

    #[test]
    fn key_in_path_is_extracted_and_removed() {
        let request = normalize(
            &format!("/{GATEWAY_KEY}/v1/chat/completions?x=1"),
            &[("host", "gateway.local")],
            "{}",
        )
        .unwrap();
        assert_eq!(request.gateway_key(), Some(GATEWAY_KEY));
        assert_eq!(request.path(), "/v1/chat/completions");
        assert_eq!(request.url(), "https://gateway.local/v1/chat/completions?x=1");
    }

    #[test]
    fn loop_depth_is_incremented_and_bounded() {
        let request = normalize("/", &[("helicone-loop-depth", "2")], "{}").unwrap();
        assert_eq!(request.loop_depth(), 3);
        assert_eq!(request.forwardable_headers().get("helicone-loop-depth").unwrap(), "3");

        let err = normalize("/", &[("helicone-loop-depth", "3")], "{}").unwrap_err();
        assert!(matches!(err, RequestError::LoopDetected { depth: 4, max: 3 }));
    }

    #[test]
    fn request_id_and_properties_come_from_headers() {
        let request = normalize(
            "/",
            &[
                ("helicone-request-id", "req-123"),
                ("helicone-property-session", "abc"),
                ("helicone-user-id", "user-9"),
            ],
            "{}",
        )
        .unwrap();
        assert_eq!(request.request_id(), "req-123");
        assert_eq!(request.properties().get("session").map(String::as_str), Some("abc"));
        assert_eq!(request.user_id(), Some("user-9"));

        let generated = normalize("/", &[], "{}").unwrap();
        assert!(crate::gateway::ids::is_uuid(generated.request_id()));
    }

    #[test]
    fn forwardable_headers_drop_gateway_credentials() {
        let request = normalize(
            "/",
            &[
                ("authorization", "Bearer sk-openai"),
                ("helicone-auth", GATEWAY_KEY),
                ("helicone-cache-enabled", "true"),
                ("openai-organization", "org-x"),
            ],
            "{}",
        )
        .unwrap();
        let forwarded = request.forwardable_headers();
        assert!(forwarded.get("authorization").is_none());
        assert!(forwarded.get("helicone-auth").is_none());
        assert!(forwarded.get("helicone-cache-enabled").is_none());
        assert_eq!(forwarded.get("openai-organization").unwrap(), "org-x");
    }

    #[test]
    fn body_override_applies_once_before_first_read() {
        let mut request = normalize("/", &[], r#"{"model":"a","stream":true}"#).unwrap();
        let mut patch = Map::new();
        patch.insert("model".to_string(), json!("b"));
        request.override_body(patch.clone()).unwrap();
        assert!(matches!(
            request.override_body(patch.clone()),
            Err(RequestError::BodyAlreadyOverridden)
        ));

        assert_eq!(request.safe_json().unwrap()["model"], "b");
        assert!(request.is_streaming());
        let text: Value = serde_json::from_str(request.unsafe_text()).unwrap();
        assert_eq!(text["model"], "b");

        let mut read = normalize("/", &[], "not json").unwrap();
        assert_eq!(read.unsafe_text(), "not json");
        assert!(read.safe_json().is_none());
        assert!(matches!(read.override_body(patch), Err(RequestError::BodyAlreadyRead)));
    }
}
