//! Live server events
//!
//! - [`EventSource`]: opens one push connection ([`WebSocketSource`] in
//!   production)
//! - [`EventChannel`]: keeps a connection alive with capped exponential
//!   backoff
//! - [`EventRegistry`]: typed and catch-all subscriptions

mod channel;
mod event;
mod registry;
mod source;

pub use channel::{ChannelSettings, ConnectionState, EventChannel, TokenProvider};
pub use event::ServerEvent;
pub use registry::{EventRegistry, Subscription};
pub use source::{EventSource, EventStream, WebSocketSource};

/// Event channel failures; never surfaced to subscribers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection error: {0}")]
    Stream(String),
    #[error("malformed event: {0}")]
    Decode(String),
}
