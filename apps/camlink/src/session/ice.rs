use super::{IceCandidate, MediaOp, Session, SessionState, SignalingMessage};
use crate::media::MediaError;
use std::collections::VecDeque;

/// Remote candidates held before the remote description is adopted. A peer
/// gathers a handful per interface; anything past this is discarded.
pub(super) const MAX_PENDING_REMOTE_CANDIDATES: usize = 64;

/// Trickle ICE buffers.
///
/// Local candidates are held only until the signaling channel opens. Remote
/// candidates are held until the engine has adopted the remote description,
/// then applied in arrival order since the peer sends them by priority.
#[derive(Debug, Default)]
pub(super) struct IceExchange {
    pub(super) pending_local: Vec<IceCandidate>,
    pub(super) pending_remote: VecDeque<IceCandidate>,
    pub(super) discarded_remote: u64,
}

impl Session {
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) {
        match self.state {
            SessionState::Idle | SessionState::Connecting => {
                tracing::debug!(target: "camlink::ice", "holding local candidate until signaling opens");
                self.ice.pending_local.push(candidate);
            }
            SessionState::SignalingOpen | SessionState::Negotiating | SessionState::Streaming => {
                self.send_local_candidate(candidate)
            }
            SessionState::Closing | SessionState::Closed => {
                tracing::trace!(target: "camlink::ice", "dropping local candidate while closing");
            }
        }
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.is_winding_down() {
            return;
        }
        if self.negotiation.remote_applied {
            self.issue(MediaOp::AddRemoteCandidate(candidate));
        } else if self.ice.pending_remote.len() >= MAX_PENDING_REMOTE_CANDIDATES {
            // earlier candidates carry the higher priorities; keep those
            self.ice.discarded_remote += 1;
            if self.ice.discarded_remote == 1 {
                tracing::warn!(
                    target: "camlink::ice",
                    limit = MAX_PENDING_REMOTE_CANDIDATES,
                    "too many remote candidates before the remote description; discarding extras"
                );
            } else {
                tracing::debug!(target: "camlink::ice", discarded = self.ice.discarded_remote, "remote candidate discarded");
            }
        } else {
            tracing::debug!(
                target: "camlink::ice",
                buffered = self.ice.pending_remote.len() + 1,
                "remote description not adopted yet; buffering candidate"
            );
            self.ice.pending_remote.push_back(candidate);
        }
    }

    pub(super) fn flush_local_candidates(&mut self) {
        let pending = std::mem::take(&mut self.ice.pending_local);
        for candidate in pending {
            self.send_local_candidate(candidate);
        }
    }

    pub(super) fn flush_remote_candidates(&mut self) {
        if !self.ice.pending_remote.is_empty() {
            tracing::debug!(
                target: "camlink::ice",
                count = self.ice.pending_remote.len(),
                "applying buffered remote candidates"
            );
        }
        while let Some(candidate) = self.ice.pending_remote.pop_front() {
            self.issue(MediaOp::AddRemoteCandidate(candidate));
        }
    }

    pub(super) fn on_candidate_added(&mut self, candidate: IceCandidate, result: Result<(), MediaError>) {
        match result {
            Ok(()) => tracing::trace!(target: "camlink::ice", candidate = %candidate.candidate, "remote candidate added"),
            Err(err) => tracing::warn!(
                target: "camlink::ice",
                candidate = %candidate.candidate,
                line = candidate.sdp_mline_index,
                "failed to add remote candidate: {err}"
            ),
        }
    }

    fn send_local_candidate(&mut self, candidate: IceCandidate) {
        tracing::trace!(target: "camlink::ice", candidate = %candidate.candidate, "sending local candidate");
        self.send(SignalingMessage::Ice {
            candidate: candidate.candidate,
            sdp_mline_index: candidate.sdp_mline_index,
        });
    }
}
