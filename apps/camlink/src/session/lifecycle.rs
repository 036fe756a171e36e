use super::receive::ReceiveChain;
use super::{Role, Session, SessionState};
use crate::error::SessionError;
use crate::signaling::TransportError;

impl Session {
    pub fn begin_connect(&mut self) {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Connecting);
        }
    }

    pub fn on_channel_opened(&mut self) {
        if self.state != SessionState::Connecting {
            tracing::warn!(target: "camlink::session", state = ?self.state, "channel opened outside of connecting");
            return;
        }
        self.transition(SessionState::SignalingOpen);
        self.flush_local_candidates();
    }

    /// The relay could not be reached. Terminal: there is nothing to wind down.
    pub fn on_connect_failed(&mut self, err: TransportError) {
        if self.state != SessionState::Connecting {
            return;
        }
        tracing::error!(target: "camlink::session", "{err}");
        self.close_reason = Some(SessionError::Transport(err));
        self.outbox.clear();
        self.transition(SessionState::Closed);
    }

    pub fn on_channel_closed(&mut self) {
        tracing::info!(target: "camlink::session", "signaling channel closed by peer");
        self.begin_close(None);
    }

    pub fn on_channel_error(&mut self, reason: String) {
        self.begin_close(Some(SessionError::Transport(TransportError::Abnormal(reason))));
    }

    pub fn on_media_fatal(&mut self, reason: String) {
        self.begin_close(Some(SessionError::MediaEngine(reason)));
    }

    /// External shutdown, e.g. Ctrl-C.
    pub fn request_shutdown(&mut self) {
        tracing::info!(target: "camlink::session", "shutdown requested");
        self.begin_close(None);
    }

    /// Releases were done by the owner; nothing may happen after this.
    pub fn mark_closed(&mut self) {
        if self.state != SessionState::Closed {
            self.transition(SessionState::Closed);
        }
    }

    /// True in `Closing` and `Closed`, where inputs are ignored and nothing is sent.
    pub fn is_winding_down(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    pub(super) fn begin_close(&mut self, reason: Option<SessionError>) {
        if self.is_winding_down() {
            return;
        }
        if let Some(reason) = reason {
            tracing::error!(target: "camlink::session", "{reason}");
            if self.close_reason.is_none() {
                self.close_reason = Some(reason);
            }
        }
        self.outbox.clear();
        self.ice.pending_local.clear();
        self.ice.pending_remote.clear();
        self.transition(SessionState::Closing);
    }

    pub(super) fn maybe_streaming(&mut self) {
        if self.state != SessionState::Negotiating || !self.descriptions_applied() {
            return;
        }
        let ready = match self.role {
            Role::Offerer => true,
            Role::Answerer => matches!(self.receive, ReceiveChain::Built(_)),
        };
        if ready {
            self.reached_streaming = true;
            self.transition(SessionState::Streaming);
        }
    }

    pub(super) fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            target: "camlink::session",
            role = self.role.as_str(),
            from = ?self.state,
            to = ?next,
            "session state change"
        );
        self.state = next;
    }
}
