//! The request pipeline: normalize, authenticate, cache, rate limit, bill, forward, log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::Instrument;

use super::billing::{BillingController, BillingError, MemoryWallets, Reservation, WalletActor};
use super::body::{StreamEnd, StreamSummary, observe_stream};
use super::cache::{
    CACHE_STATUS_HEADER, CacheError, CacheKey, CachePolicy, CachedResponse, ResponseCache,
};
use super::config::{ConfigError, GatewayConfig};
use super::credentials::CredentialManager;
use super::dispatch::{
    LogBackend, LogClients, LogDispatcher, LogKind, LogMessage, LogMeta, RequestLog, ResponseLog,
    build_log_backend,
};
use super::fetch_cache::CacheOrFetch;
use super::forwarder::{ForwardRequest, Forwarder, GatewayResponse};
use super::identity::{AuthIdentity, Authenticator};
use super::kv::{KvStore, MemoryKvStore};
use super::limits::{MemoryRateLimitCounter, RateLimitCounter, RateLimiter};
use super::observability::Observability;
use super::request::{InboundRequest, NormalizeConfig};
use super::router::ModelRoute;
use super::store::{CredentialStore, IdentityStore, MemoryStore, OrganizationRecord, OrganizationStore};
use super::tasks::BackgroundTasks;
use super::translation::Dialect;
use super::transport::{ResponseBody, Transport};
use super::{Clock, GatewayError, SystemClock};

pub const ORGANIZATION_CACHE_TTL_SECS: u64 = 5 * 60;
/// Response bytes kept for the request log.
pub const LOG_BODY_LIMIT: usize = 1024 * 1024;

const REQUEST_ID_HEADER: &str = "helicone-request-id";
const FALLBACK_INDEX_HEADER: &str = "helicone-fallback-index";

/// Collaborators the gateway is assembled from. Every backend is a trait object so the
/// in-memory and Redis implementations are interchangeable.
pub struct GatewayParts {
    pub identity: Arc<dyn IdentityStore>,
    pub organizations: Arc<dyn OrganizationStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub kv: Arc<dyn KvStore>,
    pub rate_counter: Arc<dyn RateLimitCounter>,
    pub wallets: Arc<dyn WalletActor>,
    pub transport: Arc<dyn Transport>,
    pub log_clients: LogClients,
    /// Replaces the backend built from `queue_mode` and `log_clients`.
    pub log_backend: Option<Arc<dyn LogBackend>>,
    pub http: reqwest::Client,
    pub clock: Arc<dyn Clock>,
}

impl GatewayParts {
    pub fn in_memory(store: Arc<MemoryStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity: store.clone(),
            organizations: store.clone(),
            credentials: store,
            kv: Arc::new(MemoryKvStore::default()),
            rate_counter: Arc::new(MemoryRateLimitCounter::default()),
            wallets: Arc::new(MemoryWallets::default()),
            transport,
            log_clients: LogClients::default(),
            log_backend: None,
            http: reqwest::Client::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Gateway {
    normalize: NormalizeConfig,
    authenticator: Authenticator,
    identity: Arc<dyn IdentityStore>,
    organization_store: Arc<dyn OrganizationStore>,
    organizations: CacheOrFetch<str, OrganizationRecord>,
    store_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
    rate_limiter: RateLimiter,
    billing: BillingController,
    forwarder: Forwarder,
    transport: Arc<dyn Transport>,
    dispatcher: LogDispatcher,
    observability: Arc<Observability>,
    tasks: BackgroundTasks,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, parts: GatewayParts) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeouts = &config.timeouts;
        let tasks = BackgroundTasks::new();
        let observability = Arc::new(Observability::default());

        let backend = match parts.log_backend {
            Some(backend) => backend,
            None => build_log_backend(
                config.queue_mode,
                &config.logging,
                parts.log_clients,
                parts.http,
            ),
        };
        let dispatcher = LogDispatcher::new(
            backend,
            tasks.clone(),
            observability.clone(),
            timeouts.dispatch(),
        );

        let credentials = Arc::new(CredentialManager::new(
            parts.credentials,
            parts.kv.clone(),
            timeouts.store(),
        ));
        let forwarder = Forwarder::new(credentials, config.provider_table()?, timeouts.forward());

        let cache = config.cache.enabled.then(|| {
            Arc::new(
                ResponseCache::new(parts.kv.clone(), timeouts.kv())
                    .with_prefix(config.cache.prefix.clone()),
            )
        });

        Ok(Self {
            normalize: config.normalize_config(),
            authenticator: Authenticator::new(
                parts.identity.clone(),
                parts.kv.clone(),
                timeouts.store(),
            ),
            identity: parts.identity,
            organization_store: parts.organizations,
            organizations: CacheOrFetch::new(
                parts.kv,
                "organization",
                ORGANIZATION_CACHE_TTL_SECS,
            ),
            store_timeout: timeouts.store(),
            cache,
            rate_limiter: RateLimiter::new(
                parts.rate_counter,
                config.rate_limits.tiers.clone(),
                config.rate_limits.failure_mode,
                parts.clock.clone(),
                timeouts.rate_limit(),
            ),
            billing: BillingController::new(
                parts.wallets,
                config.cloud_billing_enabled,
                tasks.clone(),
                timeouts.wallet(),
            ),
            forwarder,
            transport: parts.transport,
            dispatcher,
            observability,
            tasks,
            clock: parts.clock,
        })
    }

    pub fn observability(&self) -> &Arc<Observability> {
        &self.observability
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn billing(&self) -> &BillingController {
        &self.billing
    }

    /// Runs one request through every phase. Errors become JSON error responses.
    pub async fn handle(&self, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
        let started = Instant::now();
        let created_at_ms = self.clock.now_millis();
        self.observability.record_request();

        let span = tracing::info_span!(
            "gateway_request",
            request_id = tracing::field::Empty,
            method = %method,
            path = uri.path(),
            cache = tracing::field::Empty,
            status = tracing::field::Empty,
        );
        async move {
            let response = match self
                .run(method, &uri, headers, body, started, created_at_ms)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::info!(error = %err, status = err.status().as_u16(), "request rejected");
                    err.into_response()
                }
            };
            tracing::Span::current().record("status", response.status().as_u16());
            response
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
        started: Instant,
        created_at_ms: u64,
    ) -> Result<Response, GatewayError> {
        let mut request = InboundRequest::normalize(method, uri, headers, body, &self.normalize)?;
        let span = tracing::Span::current();
        span.record("request_id", request.request_id());

        let identity = self.authenticator.resolve(&mut request).await?;
        let mut log = self.log_message(&request, &identity, created_at_ms);

        let policy = match self.cache {
            Some(_) => CachePolicy::from_headers(request.headers(), request.is_streaming())?,
            None => CachePolicy::disabled(),
        };
        if let Some(cache) = self.cache.as_ref().filter(|_| policy.should_read) {
            match cache.lookup(&request, &policy).await {
                Some(hit) => {
                    self.observability.record_cache_hit();
                    span.record("cache", "HIT");
                    let mut headers = hit.headers();
                    insert_header(&mut headers, REQUEST_ID_HEADER, request.request_id());
                    log.response = ResponseLog {
                        status: hit.response.status,
                        body_size: hit.response.body.len(),
                        cached: true,
                        created_at_ms: self.clock.now_millis(),
                        delay_ms: elapsed_ms(started),
                        body: (!log.meta.omit_response_log).then(|| hit.response.body.clone()),
                        ..ResponseLog::default()
                    };
                    self.dispatcher.dispatch(log);
                    return Ok((hit.response.status(), headers, hit.response.body).into_response());
                }
                None => {
                    self.observability.record_cache_miss();
                    span.record("cache", "MISS");
                }
            }
        }

        let organization = self.organization(identity.organization_id()).await?;

        let decision = self
            .rate_limiter
            .check(&organization.id, &organization.tier)
            .await?;
        if decision.is_rate_limited {
            self.observability.record_rate_limited();
            if decision.should_log_in_db {
                log.response = ResponseLog {
                    status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                    created_at_ms: self.clock.now_millis(),
                    delay_ms: elapsed_ms(started),
                    error: Some("rate limited".to_string()),
                    ..ResponseLog::default()
                };
                self.dispatcher.dispatch(log);
            }
            return Err(GatewayError::RateLimited(decision));
        }

        let Some(body) = request.safe_json().filter(|body| body.is_object()) else {
            return Err(GatewayError::InvalidBody);
        };

        let admission = match self.billing.check_and_reserve(&organization).await {
            Ok(admission) => admission,
            Err(err) => {
                if matches!(err, BillingError::Denied(_)) {
                    self.observability.record_billing_denied();
                }
                return Err(err.into());
            }
        };

        let route = ModelRoute::parse(body.get("model").and_then(Value::as_str).unwrap_or_default());
        let body_dialect = if request.path().ends_with("/v1/messages") {
            Dialect::Anthropic
        } else {
            Dialect::OpenAi
        };
        let forward_headers = request.forwardable_headers();
        let forward = ForwardRequest {
            organization_id: &organization.id,
            body,
            headers: &forward_headers,
            body_dialect,
            caller_provider_key: request.provider_key(),
            bound_provider_key: identity.provider_override(),
        };

        let completion = Completion {
            log,
            reservation: admission.into_reservation(),
            proxy_key_id: match &identity {
                AuthIdentity::ProxyKey { proxy_key_id, .. } => Some(proxy_key_id.clone()),
                _ => None,
            },
            identity: self.identity.clone(),
            dispatcher: self.dispatcher.clone(),
            clock: self.clock.clone(),
            started,
        };

        let GatewayResponse {
            response,
            candidate,
            attempt_index,
        } = match self
            .forwarder
            .forward(&route, forward, self.transport.as_ref())
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.observability.record_forward(route.len() as u64, false);
                self.observability.record_backend_failure();
                let response = ResponseLog {
                    status: err.http_code,
                    error: Some(err.message.clone()),
                    ..ResponseLog::default()
                };
                completion.finish(response).await;
                return Err(err.into());
            }
        };
        self.observability
            .record_forward(attempt_index as u64 + 1, attempt_index > 0);
        tracing::info!(
            provider = %candidate.provider,
            model = %candidate.model,
            attempt = attempt_index,
            status = response.status.as_u16(),
            "request forwarded"
        );

        let mut completion = completion;
        completion.log.request.provider = Some(candidate.provider.to_string());
        completion.log.request.model = Some(candidate.model.clone());

        let status = response.status;
        let upstream_headers = response.headers;
        let mut headers = upstream_headers.clone();
        insert_header(&mut headers, REQUEST_ID_HEADER, request.request_id());
        headers.insert(FALLBACK_INDEX_HEADER, HeaderValue::from(attempt_index));
        headers.extend(decision.headers());
        if policy.should_read {
            headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
        }

        let body = match response.body {
            ResponseBody::Full(bytes) => {
                if policy.should_write && status.is_success() {
                    self.store_in_background(&request, &policy, status, &upstream_headers, &bytes);
                }
                let response_log = ResponseLog {
                    status: status.as_u16(),
                    body_size: bytes.len(),
                    fallback_index: Some(attempt_index),
                    body: (!completion.log.meta.omit_response_log)
                        .then(|| String::from_utf8_lossy(&bytes[..bytes.len().min(LOG_BODY_LIMIT)]).into_owned()),
                    ..ResponseLog::default()
                };
                self.tasks
                    .spawn("request_complete", completion.finish(response_log));
                Body::from(bytes)
            }
            ResponseBody::Stream(upstream) => {
                let finalizer = Box::new(move |summary: StreamSummary| {
                    let response_log = ResponseLog {
                        status: status.as_u16(),
                        body_size: summary.bytes_sent as usize,
                        fallback_index: Some(attempt_index),
                        time_to_first_token_ms: summary.time_to_first_chunk_ms,
                        error: stream_error(summary.end),
                        body: (!completion.log.meta.omit_response_log)
                            .then(|| String::from_utf8_lossy(&summary.captured).into_owned()),
                        ..ResponseLog::default()
                    };
                    completion.finish(response_log).boxed()
                });
                Body::from_stream(observe_stream(
                    upstream,
                    started,
                    LOG_BODY_LIMIT,
                    self.tasks.clone(),
                    finalizer,
                ))
            }
        };

        Ok((status, headers, body).into_response())
    }

    async fn organization(&self, organization_id: &str) -> Result<OrganizationRecord, GatewayError> {
        let store = &self.organization_store;
        let fetched = tokio::time::timeout(
            self.store_timeout,
            self.organizations
                .get_or_fetch(organization_id, || store.organization(organization_id)),
        )
        .await
        .map_err(|_| GatewayError::Timeout {
            operation: "organization lookup",
            timeout: self.store_timeout,
        })??;
        Ok(fetched.unwrap_or_else(|| {
            tracing::warn!(organization_id, "organization not found; applying free tier defaults");
            OrganizationRecord::new(organization_id)
        }))
    }

    fn store_in_background(
        &self,
        request: &InboundRequest,
        policy: &CachePolicy,
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
    ) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let entry = match CachedResponse::from_parts(status, headers, body) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "response not cacheable");
                return;
            }
        };
        let key = CacheKey::for_request(request);
        let policy = policy.clone();
        let observability = self.observability.clone();
        self.tasks.spawn("cache_store", async move {
            match cache.store_keyed(&key, &entry, &policy).await {
                Ok(_) => {}
                Err(err @ CacheError::Overflow { .. }) => {
                    observability.record_cache_overflow();
                    tracing::warn!(error = %err, "response not cached");
                }
                Err(err) => tracing::warn!(error = %err, "cache write failed"),
            }
        });
    }

    fn log_message(&self, request: &InboundRequest, identity: &AuthIdentity, created_at_ms: u64) -> LogMessage {
        let resolved = identity.resolved();
        let meta = LogMeta {
            model_override: request.header("helicone-model-override").map(str::to_string),
            omit_request_log: header_flag(request, "helicone-omit-request"),
            omit_response_log: header_flag(request, "helicone-omit-response"),
            webhook_enabled: header_flag(request, "helicone-webhook-enabled"),
        };
        let body = request.safe_json();
        let (api_key_id, proxy_key_id) = match identity {
            AuthIdentity::ApiKey { key_id, .. } => (Some(key_id.clone()), None),
            AuthIdentity::ProxyKey { proxy_key_id, .. } => (None, Some(proxy_key_id.clone())),
            AuthIdentity::CustomerPortalKey { .. } | AuthIdentity::Session { .. } => (None, None),
        };
        LogMessage {
            id: request.request_id().to_string(),
            kind: LogKind::RequestResponse,
            authorization: request
                .gateway_key()
                .map(|key| format!("Bearer {key}"))
                .unwrap_or_default(),
            request: RequestLog {
                id: request.request_id().to_string(),
                organization_id: resolved.organization_id,
                user_id: request.user_id().map(str::to_string).or(resolved.user_id),
                prompt_id: request.prompt_id().map(str::to_string),
                properties: request.properties().clone(),
                api_key_id,
                proxy_key_id,
                target_url: request.url(),
                provider: None,
                model: body
                    .and_then(|body| body.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                path: request.path().to_string(),
                body_size: request.raw_body().len(),
                is_stream: request.is_streaming(),
                created_at_ms,
                body: if meta.omit_request_log { None } else { body.cloned() },
            },
            meta,
            response: ResponseLog::default(),
        }
    }
}

/// What is still owed once the response body has been delivered: the wallet reservation,
/// proxy-key usage, and the request log.
struct Completion {
    log: LogMessage,
    reservation: Option<Reservation>,
    proxy_key_id: Option<String>,
    identity: Arc<dyn IdentityStore>,
    dispatcher: LogDispatcher,
    clock: Arc<dyn Clock>,
    started: Instant,
}

impl Completion {
    async fn finish(self, mut response: ResponseLog) {
        let Completion {
            mut log,
            reservation,
            proxy_key_id,
            identity,
            dispatcher,
            clock,
            started,
        } = self;

        // Cost is reconciled out of band; the in-flight slot is freed now.
        if let Some(reservation) = reservation {
            reservation.release().await;
        }
        let now_ms = clock.now_millis();
        if let Some(proxy_key_id) = proxy_key_id {
            if let Err(err) = identity.record_proxy_key_usage(&proxy_key_id, now_ms, 0.0).await {
                tracing::warn!(%proxy_key_id, error = %err, "proxy key usage not recorded");
            }
        }

        response.created_at_ms = now_ms;
        response.delay_ms = elapsed_ms(started);
        log.response = response;
        dispatcher.dispatch(log);
    }
}

fn stream_error(end: StreamEnd) -> Option<String> {
    match end {
        StreamEnd::Completed => None,
        StreamEnd::Error => Some("upstream stream failed".to_string()),
        StreamEnd::Aborted => Some("client disconnected before the stream finished".to_string()),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn header_flag(request: &InboundRequest, name: &str) -> bool {
    request
        .header(name)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
