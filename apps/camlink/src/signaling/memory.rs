//! In-process relay used by tests and local demos.

use super::{ChannelEvent, SignalingChannel, SignalingConnector, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use url::Url;

/// Hands out a single in-memory channel whose far end is a [`RelayHandle`].
pub struct MemoryConnector {
    pending: Mutex<Option<MemoryChannel>>,
    refusal: Option<String>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, RelayHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let channel = MemoryChannel {
            inbound: inbound_rx,
            outbound: Some(outbound_tx),
            closed: Arc::clone(&closed),
        };
        let handle = RelayHandle {
            inbound: inbound_tx,
            outbound: outbound_rx,
            closed,
        };
        (
            Self {
                pending: Mutex::new(Some(channel)),
                refusal: None,
            },
            handle,
        )
    }

    /// A connector whose every attempt fails, as when the relay is unreachable.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            pending: Mutex::new(None),
            refusal: Some(reason.into()),
        }
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SignalingChannel>, TransportError> {
        if let Some(reason) = &self.refusal {
            return Err(TransportError::Connect(format!("{url}: {reason}")));
        }
        let channel = self.pending.lock().take();
        match channel {
            Some(channel) => Ok(Box::new(channel)),
            None => Err(TransportError::Connect(format!(
                "{url}: memory relay already connected"
            ))),
        }
    }
}

pub struct MemoryChannel {
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn send(&mut self, text: String) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(text);
        }
    }

    async fn next_event(&mut self) -> ChannelEvent {
        let event = self.inbound.recv().await.unwrap_or(ChannelEvent::Closed);
        if matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_)) {
            self.outbound = None;
        }
        event
    }

    fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// The relay's side of a [`MemoryChannel`].
pub struct RelayHandle {
    inbound: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl RelayHandle {
    pub fn deliver(&self, text: impl Into<String>) {
        let _ = self
            .inbound
            .send(ChannelEvent::MessageReceived(text.into()));
    }

    pub fn hang_up(&self) {
        let _ = self.inbound.send(ChannelEvent::Closed);
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(ChannelEvent::Error(reason.into()));
    }

    /// Waits for the next frame the session sent; `None` once the session side is gone.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Frames sent so far that have not been read yet.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            frames.push(text);
        }
        frames
    }

    /// True once the session closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_url() -> Url {
        Url::parse("ws://relay.test/").unwrap()
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut relay) = MemoryConnector::pair();
        let mut channel = connector.connect(&relay_url()).await.unwrap();
        assert!(channel.is_open());

        channel.send("out".into());
        relay.deliver("in");
        assert_eq!(relay.next_sent().await.as_deref(), Some("out"));
        assert_eq!(
            channel.next_event().await,
            ChannelEvent::MessageReceived("in".into())
        );
    }

    #[tokio::test]
    async fn send_after_hang_up_is_dropped() {
        let (connector, mut relay) = MemoryConnector::pair();
        let mut channel = connector.connect(&relay_url()).await.unwrap();
        relay.hang_up();
        assert_eq!(channel.next_event().await, ChannelEvent::Closed);
        assert!(!channel.is_open());

        channel.send("late".into());
        assert!(relay.drain_sent().is_empty());
    }

    #[tokio::test]
    async fn second_connect_and_refusal_fail() {
        let (connector, _relay) = MemoryConnector::pair();
        assert!(connector.connect(&relay_url()).await.is_ok());
        assert!(matches!(
            connector.connect(&relay_url()).await,
            Err(TransportError::Connect(_))
        ));

        let refusing = MemoryConnector::refusing("connection refused");
        match refusing.connect(&relay_url()).await {
            Err(TransportError::Connect(reason)) => assert!(reason.contains("refused")),
            _ => panic!("expected refusal"),
        }
    }

    #[tokio::test]
    async fn close_marks_relay_side() {
        let (connector, relay) = MemoryConnector::pair();
        let mut channel = connector.connect(&relay_url()).await.unwrap();
        channel.close().await;
        assert!(relay.is_closed());
        assert!(!channel.is_open());
        assert_eq!(channel.next_event().await, ChannelEvent::Closed);
    }
}
