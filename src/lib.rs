//! Async client for a Discord-style bot platform: a gateway session with resume, heartbeats and
//! reconnects, plus a REST client that keeps to the platform's rate limits.

pub mod client;
pub mod emitter;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod model;

pub mod prelude {
    pub use crate::client::{Client, ClientBuilder, Context};
    pub use crate::emitter::{Emitter, Listener, Priority};
    pub use crate::error::ClientError;
    pub use crate::event::EventHandler;
    pub use crate::gateway::{GatewayConfig, Opcode, Shard};
    pub use crate::http::Http;
    pub use crate::model::*;
}
