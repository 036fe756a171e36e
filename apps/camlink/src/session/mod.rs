//! Negotiation and signaling state for one peer connection.
//!
//! [`Session`] is a plain state machine: every input (a signaling frame, a
//! media engine event, the completion of a media operation) is a method call,
//! and every effect is a [`Command`] queued for the driver to execute. It never
//! awaits and holds no locks; [`driver::SessionDriver`] owns it and feeds it
//! from a single task, so handlers never run concurrently.

use crate::error::SessionError;
use crate::media::{MediaError, MediaEvent};

pub mod driver;
mod ice;
mod lifecycle;
mod negotiation;
pub mod receive;

pub use negotiation::NegotiationError;
pub use receive::{CapabilityDescriptor, PadId, ReceiveFragment, ReceiveProfile};
pub use signal_proto::{SdpKind, SignalingMessage};

use ice::IceExchange;
use negotiation::Negotiation;
use receive::ReceiveChain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The sender: publishes the video track and produces the offer.
    Offerer,
    /// The receiver: answers and builds the receive chain.
    Answerer,
}

impl Role {
    pub fn local_kind(self) -> SdpKind {
        match self {
            Role::Offerer => SdpKind::Offer,
            Role::Answerer => SdpKind::Answer,
        }
    }

    pub fn remote_kind(self) -> SdpKind {
        match self {
            Role::Offerer => SdpKind::Answer,
            Role::Answerer => SdpKind::Offer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    SignalingOpen,
    Negotiating,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mline_index: u32,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mline_index: u32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
        }
    }
}

/// A request to the media engine. Executed strictly in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    SpliceFragment {
        pad: PadId,
        fragment: ReceiveFragment,
    },
}

impl MediaOp {
    pub fn name(&self) -> &'static str {
        match self {
            MediaOp::CreateOffer => "create-offer",
            MediaOp::CreateAnswer => "create-answer",
            MediaOp::SetLocalDescription(_) => "set-local-description",
            MediaOp::SetRemoteDescription(_) => "set-remote-description",
            MediaOp::AddRemoteCandidate(_) => "add-ice-candidate",
            MediaOp::SpliceFragment { .. } => "splice-fragment",
        }
    }
}

/// The deferred result of a [`MediaOp`].
#[derive(Debug)]
pub enum Completion {
    OfferCreated(Result<SessionDescription, MediaError>),
    AnswerCreated(Result<SessionDescription, MediaError>),
    LocalDescriptionSet(Result<(), MediaError>),
    RemoteDescriptionSet(Result<(), MediaError>),
    CandidateAdded {
        candidate: IceCandidate,
        result: Result<(), MediaError>,
    },
    FragmentSpliced {
        pad: PadId,
        result: Result<(), MediaError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(SignalingMessage),
    Media(MediaOp),
}

#[derive(Debug)]
pub struct Session {
    role: Role,
    state: SessionState,
    negotiation: Negotiation,
    ice: IceExchange,
    receive: ReceiveChain,
    outbox: Vec<Command>,
    close_reason: Option<SessionError>,
    reached_streaming: bool,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::Idle,
            negotiation: Negotiation::default(),
            ice: IceExchange::default(),
            receive: ReceiveChain::default(),
            outbox: Vec::new(),
            close_reason: None,
            reached_streaming: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.negotiation.local.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.negotiation.remote.as_ref()
    }

    pub fn receive_chain_built(&self) -> bool {
        self.receive.is_built()
    }

    pub fn reached_streaming(&self) -> bool {
        self.reached_streaming
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.ice.pending_remote.len()
    }

    pub fn close_reason(&self) -> Option<&SessionError> {
        self.close_reason.as_ref()
    }

    pub fn take_close_reason(&mut self) -> Option<SessionError> {
        self.close_reason.take()
    }

    /// Commands produced since the last call, in the order they were issued.
    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbox)
    }

    /// Handles one inbound signaling frame. Malformed input is logged and dropped.
    pub fn on_signaling_text(&mut self, text: &str) {
        if self.is_winding_down() {
            return;
        }
        match signal_proto::decode(text) {
            Ok(SignalingMessage::Sdp { kind, sdp }) => {
                if let Err(err) = self.on_remote_sdp(SessionDescription { kind, sdp }) {
                    tracing::warn!(target: "camlink::negotiation", role = self.role.as_str(), "{err}");
                }
            }
            Ok(SignalingMessage::Ice {
                candidate,
                sdp_mline_index,
            }) => self.on_remote_candidate(IceCandidate {
                candidate,
                sdp_mline_index,
            }),
            Err(err) => {
                let err = SessionError::MalformedSignalingMessage(err.to_string());
                tracing::warn!(
                    target: "camlink::session",
                    keys = ?signal_proto::top_level_keys(text),
                    len = text.len(),
                    "dropping signaling frame: {err}"
                );
            }
        }
    }

    pub fn on_media_event(&mut self, event: MediaEvent) {
        if self.is_winding_down() {
            tracing::trace!(target: "camlink::session", ?event, "ignoring media event while closing");
            return;
        }
        match event {
            MediaEvent::NegotiationNeeded => {
                if let Err(err) = self.on_negotiation_needed() {
                    match err {
                        NegotiationError::OfferInFlight => {
                            tracing::error!(target: "camlink::negotiation", "{err}")
                        }
                        NegotiationError::RenegotiationUnsupported => {
                            tracing::warn!(target: "camlink::negotiation", "{err}")
                        }
                    }
                }
            }
            MediaEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            MediaEvent::IncomingPad { pad, caps } => self.on_incoming_pad(pad, &caps),
            MediaEvent::Fatal(reason) => self.on_media_fatal(reason),
        }
    }

    pub fn on_completion(&mut self, completion: Completion) {
        if self.is_winding_down() {
            tracing::debug!(target: "camlink::session", ?completion, "discarding media completion while closing");
            return;
        }
        match completion {
            Completion::OfferCreated(result) => self.on_offer_created(result),
            Completion::AnswerCreated(result) => self.on_answer_created(result),
            Completion::LocalDescriptionSet(result) => self.on_local_description_set(result),
            Completion::RemoteDescriptionSet(result) => self.on_remote_description_set(result),
            Completion::CandidateAdded { candidate, result } => {
                self.on_candidate_added(candidate, result)
            }
            Completion::FragmentSpliced { pad, result } => self.on_fragment_spliced(pad, result),
        }
    }

    fn send(&mut self, message: SignalingMessage) {
        self.outbox.push(Command::Send(message));
    }

    fn issue(&mut self, op: MediaOp) {
        self.outbox.push(Command::Media(op));
    }
}
