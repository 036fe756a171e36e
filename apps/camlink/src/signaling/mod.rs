//! Connection to the signaling relay.
//!
//! The session only sees opaque text frames and lifecycle events; framing,
//! TLS and reconnection policy (there is none) live behind these traits.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, RelayHandle};
pub use websocket::WebSocketConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling tls setup failed: {0}")]
    Tls(String),
    #[error("signaling channel closed abnormally: {0}")]
    Abnormal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    MessageReceived(String),
    Closed,
    Error(String),
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SignalingChannel>, TransportError>;
}

#[async_trait]
pub trait SignalingChannel: Send {
    /// Queues a text frame. Silently dropped once the channel is no longer open.
    fn send(&mut self, text: String);

    /// Next inbound event. After `Closed` or `Error` this keeps returning `Closed`.
    async fn next_event(&mut self) -> ChannelEvent;

    fn is_open(&self) -> bool;

    async fn close(&mut self);
}
