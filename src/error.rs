//! Error types for the gateway and REST pipelines.

use crate::events::RateLimitInfo;
use std::time::Duration;

/// Errors surfaced by a gateway shard.
///
/// Most shard trouble is reported through events and absorbed by the
/// reconnect loop; these variants are for failures the caller has to see,
/// such as a `connect()` that never reached a session.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid gateway url: {0}")]
    Url(#[from] url::ParseError),

    #[error("failed to decode gateway frame: {0}")]
    FrameDecode(#[from] serde_json::Error),

    #[error("zlib stream corrupted: {0}")]
    Compression(String),

    #[error("outbound frame is {len} bytes, above the {max} byte cap")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("no HELLO within {0:?} of socket open")]
    HelloTimeout(Duration),

    #[error("gateway closed the connection: code {code} ({reason})")]
    Closed { code: u16, reason: String },

    #[error("session invalidated before the connection was established")]
    SessionInvalidated,

    #[error("shard destroyed")]
    Destroyed,

    #[error("shard command channel closed")]
    ChannelClosed,
}

/// A structured error payload returned by the API with a 4xx status.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// Service-specific error code, when the body carried one.
    pub code: Option<u64>,
    pub message: String,
    pub status: u16,
    pub method: String,
    pub path: String,
    /// The raw error body, for callers that need field-level details.
    pub body: serde_json::Value,
}

impl ApiError {
    pub fn from_body(
        body: serde_json::Value,
        status: u16,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        let code = body.get("code").and_then(|c| c.as_u64());
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown API error")
            .to_owned();
        Self { code, message, status, method: method.into(), path: path.into(), body }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(
                f,
                "API error {code} on {} {}: {} (status {})",
                self.method, self.path, self.message, self.status
            ),
            None => write!(
                f,
                "API error on {} {}: {} (status {})",
                self.method, self.path, self.message, self.status
            ),
        }
    }
}

impl std::error::Error for ApiError {}

/// A request that kept failing at the transport or 5xx level after the
/// retry budget ran out.
#[derive(thiserror::Error, Debug)]
#[error("{method} {path} failed with status {status:?}: {message}")]
pub struct HttpFailure {
    pub status: Option<u16>,
    pub message: String,
    pub method: String,
    pub path: String,
    #[source]
    pub source: Option<reqwest::Error>,
}

/// Errors surfaced by the REST pipeline.
#[derive(thiserror::Error, Debug)]
pub enum RestError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Http(#[from] HttpFailure),

    #[error("rejected by rate-limit policy: {} {} for {}ms (global={})",
        .0.method, .0.route, .0.timeout_ms, .0.global)]
    RateLimited(RateLimitInfo),

    #[error("request queue closed")]
    QueueClosed,
}
