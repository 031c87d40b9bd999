//! Structured events emitted by the gateway and REST pipelines.
//!
//! Lifecycle events ([`ShardEvent`]) reach the caller over the shard's
//! event channel. Diagnostics ([`DiagnosticEvent`]) ride a multi-subscriber
//! [`EventBus`]; emitters cheap-check [`EventBus::has_subscribers`] before
//! building anything expensive, so an unobserved bus costs one atomic load.

use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::broadcast;

/// Details of an active rate limit, reported before a request waits and
/// carried by rejection errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// How long the request would have to wait, in milliseconds.
    pub timeout_ms: u64,
    /// The bucket's request allowance.
    pub limit: u32,
    /// Upper-cased HTTP method.
    pub method: String,
    /// Concrete request path.
    pub path: String,
    /// Bucket route the limit applies to.
    pub route: String,
    /// Whether the wait is on the global window rather than the bucket.
    pub global: bool,
}

/// A terminal websocket close, observed or synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    /// False when the close was synthesized (zombie connection, missing
    /// close frame after a shutdown).
    pub was_clean: bool,
}

impl fmt::Display for CloseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close {} ({}), clean={}", self.code, self.reason, self.was_clean)
    }
}

/// Lifecycle events delivered to the shard's consumer.
#[derive(Debug, Clone)]
pub enum ShardEvent {
    /// Session established; guild payloads may still be pending.
    Ready {
        shard_id: u16,
        session_id: String,
        /// Guilds announced in the session-start payload.
        guild_count: usize,
    },
    /// A previous session was resumed with no replay gap.
    Resumed { shard_id: u16 },
    /// Every expected guild arrived, or the ready timeout fired.
    ///
    /// `pending` holds the guilds that never arrived, if any.
    AllReady {
        shard_id: u16,
        pending: Option<BTreeSet<String>>,
    },
    /// A dispatch frame, in receive order.
    Dispatch {
        shard_id: u16,
        event: String,
        data: serde_json::Value,
        sequence: i64,
    },
    /// The server invalidated the session.
    InvalidSession { shard_id: u16, resumable: bool },
    /// The connection closed; the shard will reconnect unless destroyed.
    Close { shard_id: u16, event: CloseEvent },
    /// The shard was torn down by the caller.
    Destroyed { shard_id: u16 },
    /// A non-fatal shard error (transport, codec, oversized payload).
    Error { shard_id: u16, message: String },
}

/// Informational events for observers.
#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    Debug {
        shard_id: Option<u16>,
        message: String,
    },
    /// A raw inbound gateway frame, post-inflation.
    Raw { shard_id: u16, payload: String },
    ApiRequest {
        method: String,
        path: String,
        route: String,
        retries: u32,
    },
    ApiResponse {
        method: String,
        path: String,
        route: String,
        status: u16,
    },
    /// A request is waiting on an active rate limit.
    RateLimited(RateLimitInfo),
    /// The invalid-request counter crossed a warning interval.
    InvalidRequestWarning { count: u32, remaining_ms: u64 },
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug { shard_id, message } => match shard_id {
                Some(id) => write!(f, "[shard {id}] {message}"),
                None => write!(f, "{message}"),
            },
            Self::Raw { shard_id, payload } => {
                write!(f, "[shard {shard_id}] raw {} bytes", payload.len())
            }
            Self::ApiRequest { method, path, retries, .. } => {
                write!(f, "{method} {path} (retries={retries})")
            }
            Self::ApiResponse { method, path, status, .. } => {
                write!(f, "{method} {path} -> {status}")
            }
            Self::RateLimited(info) => {
                write!(
                    f,
                    "rate limited on {} {} for {}ms (global={})",
                    info.method, info.route, info.timeout_ms, info.global
                )
            }
            Self::InvalidRequestWarning { count, remaining_ms } => {
                write!(f, "{count} invalid requests, window resets in {remaining_ms}ms")
            }
        }
    }
}

/// Multi-subscriber diagnostic channel.
///
/// Cheap to clone; every emitter in the client shares one bus. Slow
/// subscribers lose old events rather than applying backpressure.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    /// Emit an already-built event. Dropped when nobody is listening.
    pub fn emit(&self, event: DiagnosticEvent) {
        if self.has_subscribers() {
            let _ = self.tx.send(event);
        }
    }

    /// Build the event only if someone is listening.
    pub fn emit_with(&self, build: impl FnOnce() -> DiagnosticEvent) {
        if self.has_subscribers() {
            let _ = self.tx.send(build());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_reports_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers());

        let rx = bus.subscribe();
        assert!(bus.has_subscribers());

        drop(rx);
        assert!(!bus.has_subscribers());
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(DiagnosticEvent::Debug { shard_id: Some(0), message: "hello".into() });

        match rx.recv().await.expect("event delivered") {
            DiagnosticEvent::Debug { shard_id, message } => {
                assert_eq!(shard_id, Some(0));
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_with_skips_building_without_subscribers() {
        let bus = EventBus::new();
        let mut built = false;
        bus.emit_with(|| {
            built = true;
            DiagnosticEvent::Debug { shard_id: None, message: "expensive".into() }
        });
        assert!(!built);

        let _rx = bus.subscribe();
        let mut built = false;
        bus.emit_with(|| {
            built = true;
            DiagnosticEvent::Debug { shard_id: None, message: "expensive".into() }
        });
        assert!(built);
    }

    #[test]
    fn display_formats_are_stable() {
        let info = RateLimitInfo {
            timeout_ms: 2_000,
            limit: 5,
            method: "GET".into(),
            path: "/channels/1/messages".into(),
            route: "/channels/1/messages".into(),
            global: true,
        };
        let text = DiagnosticEvent::RateLimited(info).to_string();
        assert!(text.contains("2000ms"));
        assert!(text.contains("global=true"));

        let close = CloseEvent { code: 4009, reason: "zombie".into(), was_clean: false };
        assert!(close.to_string().contains("4009"));
    }
}
