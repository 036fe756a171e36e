use super::{MediaOp, Role, Session, SessionDescription, SessionState, SignalingMessage};
use crate::error::SessionError;
use crate::media::MediaError;
use thiserror::Error;

/// Description state for the single offer/answer round.
#[derive(Debug, Default)]
pub(super) struct Negotiation {
    pub(super) local: Option<SessionDescription>,
    pub(super) remote: Option<SessionDescription>,
    pub(super) local_applied: bool,
    pub(super) remote_applied: bool,
    /// A create-offer or create-answer has been issued and not completed.
    pub(super) creating: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation-needed raised while an offer is still being created")]
    OfferInFlight,
    #[error("negotiation-needed after the offer was produced; renegotiation is not supported")]
    RenegotiationUnsupported,
}

impl Session {
    /// Starts the offer for this round. Only meaningful for the offerer; the
    /// answerer ignores the trigger.
    pub fn on_negotiation_needed(&mut self) -> Result<(), NegotiationError> {
        if self.role != Role::Offerer {
            tracing::debug!(target: "camlink::negotiation", "answerer ignores negotiation-needed");
            return Ok(());
        }
        if self.negotiation.creating {
            return Err(NegotiationError::OfferInFlight);
        }
        if self.negotiation.local.is_some() {
            return Err(NegotiationError::RenegotiationUnsupported);
        }
        tracing::debug!(target: "camlink::negotiation", "creating offer");
        self.negotiation.creating = true;
        self.issue(MediaOp::CreateOffer);
        Ok(())
    }

    /// Accepts the peer's description. Anything other than the single
    /// description this role expects is malformed peer input and is dropped.
    pub fn on_remote_sdp(&mut self, description: SessionDescription) -> Result<(), SessionError> {
        if self.is_winding_down() {
            return Ok(());
        }
        let expected = self.role.remote_kind();
        if description.kind != expected {
            return Err(SessionError::MalformedSignalingMessage(format!(
                "{} received an {} description; expected {expected}",
                self.role.as_str(),
                description.kind
            )));
        }
        if self.negotiation.remote.is_some() {
            return Err(SessionError::MalformedSignalingMessage(format!(
                "duplicate remote {} ignored; renegotiation is not supported",
                description.kind
            )));
        }
        if self.role == Role::Offerer && self.negotiation.local.is_none() {
            return Err(SessionError::MalformedSignalingMessage(
                "answer received before an offer was sent".into(),
            ));
        }

        tracing::info!(
            target: "camlink::negotiation",
            kind = %description.kind,
            len = description.sdp.len(),
            "received remote description"
        );
        tracing::trace!(target: "camlink::negotiation", sdp = %description.sdp);
        self.negotiation.remote = Some(description.clone());
        self.enter_negotiating();
        self.issue(MediaOp::SetRemoteDescription(description));
        Ok(())
    }

    pub(super) fn on_offer_created(&mut self, result: Result<SessionDescription, MediaError>) {
        self.negotiation.creating = false;
        self.adopt_created(result, "create offer");
    }

    pub(super) fn on_answer_created(&mut self, result: Result<SessionDescription, MediaError>) {
        self.negotiation.creating = false;
        self.adopt_created(result, "create answer");
    }

    /// Records the freshly created local description, asks the engine to adopt
    /// it and sends it to the peer.
    fn adopt_created(&mut self, result: Result<SessionDescription, MediaError>, op: &str) {
        let description = match result {
            Ok(description) => description,
            Err(err) => {
                self.begin_close(Some(SessionError::NegotiationRejected(format!("{op}: {err}"))));
                return;
            }
        };
        if description.kind != self.role.local_kind() {
            self.begin_close(Some(SessionError::NegotiationRejected(format!(
                "{op} produced an {} description",
                description.kind
            ))));
            return;
        }
        if self.negotiation.local.is_some() {
            tracing::warn!(target: "camlink::negotiation", "{op} completed twice; keeping the first description");
            return;
        }

        tracing::info!(
            target: "camlink::negotiation",
            kind = %description.kind,
            len = description.sdp.len(),
            "sending local description"
        );
        self.negotiation.local = Some(description.clone());
        self.issue(MediaOp::SetLocalDescription(description.clone()));
        self.send(SignalingMessage::Sdp {
            kind: description.kind,
            sdp: description.sdp,
        });
        self.enter_negotiating();
    }

    pub(super) fn on_local_description_set(&mut self, result: Result<(), MediaError>) {
        if let Err(err) = result {
            self.begin_close(Some(SessionError::NegotiationRejected(format!(
                "set local description: {err}"
            ))));
            return;
        }
        tracing::debug!(target: "camlink::negotiation", "local description adopted");
        self.negotiation.local_applied = true;
        self.maybe_streaming();
    }

    pub(super) fn on_remote_description_set(&mut self, result: Result<(), MediaError>) {
        if let Err(err) = result {
            self.begin_close(Some(SessionError::NegotiationRejected(format!(
                "set remote description: {err}"
            ))));
            return;
        }
        tracing::debug!(target: "camlink::negotiation", "remote description adopted");
        self.negotiation.remote_applied = true;
        self.flush_remote_candidates();

        if self.role == Role::Answerer && self.negotiation.local.is_none() {
            tracing::debug!(target: "camlink::negotiation", "creating answer");
            self.negotiation.creating = true;
            self.issue(MediaOp::CreateAnswer);
        }
        self.maybe_streaming();
    }

    pub(super) fn descriptions_applied(&self) -> bool {
        self.negotiation.local_applied && self.negotiation.remote_applied
    }

    fn enter_negotiating(&mut self) {
        if self.state == SessionState::SignalingOpen {
            self.transition(SessionState::Negotiating);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{answer, media_ops, offer, open_session, sent};
    use super::*;
    use crate::session::{Command, Completion, SdpKind};

    #[test]
    fn offerer_sends_one_offer_per_trigger() {
        let mut session = open_session(Role::Offerer);
        session.on_negotiation_needed().unwrap();
        assert_eq!(session.take_commands(), vec![Command::Media(MediaOp::CreateOffer)]);

        assert_eq!(
            session.on_negotiation_needed(),
            Err(NegotiationError::OfferInFlight)
        );
        assert!(session.take_commands().is_empty());

        session.on_completion(Completion::OfferCreated(Ok(offer())));
        let commands = session.take_commands();
        assert_eq!(
            media_ops(&commands),
            vec![MediaOp::SetLocalDescription(offer())]
        );
        assert_eq!(
            sent(&commands),
            vec![SignalingMessage::Sdp {
                kind: SdpKind::Offer,
                sdp: offer().sdp
            }]
        );
        assert_eq!(session.state(), SessionState::Negotiating);

        assert_eq!(
            session.on_negotiation_needed(),
            Err(NegotiationError::RenegotiationUnsupported)
        );
        assert!(session.take_commands().is_empty());
    }

    #[test]
    fn offerer_applies_answer_without_replying() {
        let mut session = open_session(Role::Offerer);
        session.on_negotiation_needed().unwrap();
        session.on_completion(Completion::OfferCreated(Ok(offer())));
        session.on_completion(Completion::LocalDescriptionSet(Ok(())));
        session.take_commands();

        session.on_remote_sdp(answer()).unwrap();
        let commands = session.take_commands();
        assert_eq!(commands, vec![Command::Media(MediaOp::SetRemoteDescription(answer()))]);

        session.on_completion(Completion::RemoteDescriptionSet(Ok(())));
        assert!(session.take_commands().is_empty());
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn offerer_rejects_offers_and_early_answers() {
        let mut session = open_session(Role::Offerer);
        assert!(matches!(
            session.on_remote_sdp(answer()),
            Err(SessionError::MalformedSignalingMessage(_))
        ));

        session.on_negotiation_needed().unwrap();
        session.on_completion(Completion::OfferCreated(Ok(offer())));
        session.take_commands();
        assert!(matches!(
            session.on_remote_sdp(offer()),
            Err(SessionError::MalformedSignalingMessage(_))
        ));
        assert!(session.remote_description().is_none());
        assert!(session.take_commands().is_empty());
    }

    #[test]
    fn answerer_answers_each_accepted_offer_once() {
        let mut session = open_session(Role::Answerer);
        session.on_remote_sdp(offer()).unwrap();
        assert_eq!(
            session.take_commands(),
            vec![Command::Media(MediaOp::SetRemoteDescription(offer()))]
        );

        session.on_completion(Completion::RemoteDescriptionSet(Ok(())));
        assert_eq!(session.take_commands(), vec![Command::Media(MediaOp::CreateAnswer)]);

        session.on_completion(Completion::AnswerCreated(Ok(answer())));
        let commands = session.take_commands();
        assert_eq!(
            commands,
            vec![
                Command::Media(MediaOp::SetLocalDescription(answer())),
                Command::Send(SignalingMessage::Sdp {
                    kind: SdpKind::Answer,
                    sdp: answer().sdp
                }),
            ]
        );

        assert!(session.on_remote_sdp(offer()).is_err());
        assert!(session.take_commands().is_empty());
    }

    #[test]
    fn answerer_drops_answers_and_ignores_trigger() {
        let mut session = open_session(Role::Answerer);
        assert!(session.on_remote_sdp(answer()).is_err());
        assert_eq!(session.on_negotiation_needed(), Ok(()));
        assert!(session.take_commands().is_empty());
        assert_eq!(session.state(), SessionState::SignalingOpen);
    }

    #[test]
    fn failed_description_closes_session() {
        let mut session = open_session(Role::Answerer);
        session.on_remote_sdp(offer()).unwrap();
        session.take_commands();
        session.on_completion(Completion::RemoteDescriptionSet(Err(MediaError::Rejected {
            op: "set-remote-description",
            reason: "bad fingerprint".into(),
        })));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(
            session.close_reason(),
            Some(SessionError::NegotiationRejected(_))
        ));
        assert!(session.take_commands().is_empty());
    }

    #[test]
    fn failed_offer_creation_closes_session() {
        let mut session = open_session(Role::Offerer);
        session.on_negotiation_needed().unwrap();
        session.take_commands();
        session.on_completion(Completion::OfferCreated(Err(MediaError::ShutDown)));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.take_commands().is_empty());
    }

    #[test]
    fn created_description_of_wrong_kind_is_rejected() {
        let mut session = open_session(Role::Offerer);
        session.on_negotiation_needed().unwrap();
        session.take_commands();
        session.on_completion(Completion::OfferCreated(Ok(answer())));
        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.local_description().is_none());
    }
}
