use crate::config::ConfigError;
use crate::signaling::TransportError;
use thiserror::Error;

/// Failures surfaced by a session, grouped by how they are handled.
///
/// `Transport`, `NegotiationRejected` and `MediaEngine` end the session.
/// `MalformedSignalingMessage` and `PipelineLinkFailure` are logged and the
/// session carries on. `Configuration` happens before any session exists.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed signaling message: {0}")]
    MalformedSignalingMessage(String),
    #[error("negotiation rejected: {0}")]
    NegotiationRejected(String),
    #[error("receive pipeline link failed: {0}")]
    PipelineLinkFailure(String),
    #[error("media engine failure: {0}")]
    MediaEngine(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl SessionError {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SessionError::MalformedSignalingMessage(_) | SessionError::PipelineLinkFailure(_)
        )
    }
}
