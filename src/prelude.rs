//! Convenient re-exports for common Alleycat types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::{
        ClientProperties, GatewayConfig, HttpOptions, ProxySpec, RejectPolicy, SchedulerOptions,
    },
    error::{ApiError, GatewayError, HttpFailure, RestError},
    events::{CloseEvent, DiagnosticEvent, EventBus, RateLimitInfo, ShardEvent},
    gateway::{ConnectionState, Shard},
    rest::{
        CaptchaChallenge, CaptchaSolution, CaptchaSolver, FileAttachment, QueryValue,
        RequestOptions, ResponseBody, Rest, Route,
    },
    scheduler::{SendPoll, SendScheduler},
    sleeper::{RecordingSleeper, Sleeper, TokioSleeper},
};
