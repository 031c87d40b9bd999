#![forbid(unsafe_code)]

//! # Alleycat 🐈
//!
//! Durable client substrate for chat-service backends: a gateway shard
//! that keeps coming back, and a REST pipeline that never trips the rate
//! limiter it can see coming.
//!
//! ## Features
//!
//! - **Gateway shards** with hello/identify/resume handshakes, jittered
//!   heartbeats, zombie detection, and automatic reconnect
//! - **Priority send scheduling** (token bucket + two-class priority) for
//!   outbound gateway frames
//! - **Rate-limit-aware REST** with per-bucket FIFO queues, online bucket
//!   discovery, global-window coalescing, and an invalid-request circuit
//!   breaker
//! - **Captcha and second-factor retry loops** driven by caller-supplied
//!   solvers
//! - **Deterministic tests** via pluggable clocks and sleepers
//!
//! ## Quick Start
//!
//! ```no_run
//! use alleycat::{EventBus, GatewayConfig, HttpOptions, RequestOptions, Rest, Route, Shard};
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let token = std::env::var("CHAT_TOKEN")?;
//! let bus = EventBus::new();
//!
//! // REST: routes carry their own rate-limit bucket keys.
//! let rest = Rest::new(HttpOptions::new(token.clone()))?;
//! let me = rest
//!     .get(Route::from_segments(["users", "@me"]), RequestOptions::default())
//!     .await?;
//! println!("logged in as {:?}", me.into_json());
//!
//! // Gateway: connect resolves once the session is live.
//! let (shard, mut events) = Shard::connect(GatewayConfig::new(token), bus).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! shard.destroy();
//! # Ok(()) }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod jitter;
pub mod rest;
pub mod ring;
pub mod scheduler;
pub mod sleeper;

// Re-exports
pub use backoff::RetryBackoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClientProperties, GatewayConfig, HttpOptions, ProxySpec, RejectPolicy, SchedulerOptions,
};
pub use error::{ApiError, GatewayError, HttpFailure, RestError};
pub use events::{CloseEvent, DiagnosticEvent, EventBus, RateLimitInfo, ShardEvent};
pub use gateway::{ConnectionState, Shard};
pub use jitter::Jitter;
pub use rest::{
    CaptchaChallenge, CaptchaSolver, RequestOptions, ResponseBody, Rest, Route,
};
pub use ring::RingQueue;
pub use scheduler::{SendPoll, SendScheduler};
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};

pub mod prelude;
