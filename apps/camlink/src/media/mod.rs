//! The media engine seen from the session: a handful of asynchronous
//! operations plus an event stream. The production engine is built on
//! webrtc-rs ([`rtc`]); tests substitute their own.

use crate::session::{
    CapabilityDescriptor, IceCandidate, PadId, ReceiveFragment, Role, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod fragment;
pub mod rtc;
pub mod source;

pub use rtc::RtcLauncher;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("{op} rejected: {reason}")]
    Rejected { op: &'static str, reason: String },
    #[error("no incoming stream named {0}")]
    UnknownPad(PadId),
    #[error("link failed: {0}")]
    Link(String),
    #[error("media engine setup failed: {0}")]
    Setup(String),
    #[error("media engine already shut down")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The engine wants an offer produced (offerer only).
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    /// A negotiated incoming stream became available (answerer only).
    IncomingPad {
        pad: PadId,
        caps: CapabilityDescriptor,
    },
    /// The engine cannot continue, e.g. the peer connection failed.
    Fatal(String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Attaches a receive fragment behind an announced incoming stream.
    async fn splice_fragment(&self, pad: &PadId, fragment: &ReceiveFragment) -> Result<(), MediaError>;

    /// Stops all media work. Safe to call more than once.
    async fn shutdown(&self);
}

/// Builds the engine once signaling is open; events flow back through `events`.
#[async_trait]
pub trait MediaLauncher: Send + Sync {
    async fn launch(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError>;
}
