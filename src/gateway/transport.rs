//! Network transport used by the forwarder.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Url;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum ResponseBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl ResponseBody {
    pub fn is_stream(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }

    /// Buffers a streamed body, keeping at most `limit` bytes.
    pub async fn collect(self, limit: usize) -> Bytes {
        match self {
            ResponseBody::Full(bytes) => bytes,
            ResponseBody::Stream(mut stream) => {
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let Ok(chunk) = chunk else {
                        break;
                    };
                    let room = limit.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if buf.len() >= limit {
                        break;
                    }
                }
                Bytes::from(buf)
            }
        }
    }
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {target} failed: {message}")]
    Request { target: String, message: String },
    #[error("request to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn forward(
        &self,
        target_base_url: &str,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError>;
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// reqwest-backed transport. Event-stream responses are passed through unbuffered.
///
/// The client carries no total deadline: the caller bounds the header phase, and a streamed
/// body only fails when one read stalls past `read_timeout`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|err| TransportError::Request {
                target: "client".to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn forward(
        &self,
        target_base_url: &str,
        request: OutboundRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut headers = request.headers;
        headers.remove("host");
        let response = self
            .client
            .request(request.method, request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|err| TransportError::Request {
                target: target_base_url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(*name);
        }

        let is_event_stream = headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));

        let body = if is_event_stream && status.is_success() {
            ResponseBody::Stream(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other))
                    .boxed(),
            )
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| TransportError::Request {
                    target: target_base_url.to_string(),
                    message: err.to_string(),
                })?;
            ResponseBody::Full(bytes)
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
