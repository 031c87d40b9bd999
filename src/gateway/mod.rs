//! Gateway (websocket) surface: shard lifecycle, framing, and session
//! bookkeeping.

pub mod inflater;
pub mod payload;
pub mod session;
pub mod shard;
pub mod subscriptions;

pub use inflater::Inflater;
pub use payload::{GatewayFrame, OpCode};
pub use session::Session;
pub use shard::{ConnectionState, Shard};
