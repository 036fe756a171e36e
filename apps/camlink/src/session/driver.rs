//! Runs a [`Session`] against a real signaling channel and media engine.
//!
//! One task owns the session and multiplexes four inputs: the signaling
//! channel, media engine events, media operation completions and the shutdown
//! signal. Media operations run one at a time, in issue order, on a separate
//! worker so a slow engine call never blocks signaling.

use super::{Command, Completion, MediaOp, Role, Session, SessionState};
use crate::error::SessionError;
use crate::media::{MediaEngine, MediaLauncher};
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingConnector};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub role: Role,
    pub final_state: SessionState,
    pub reached_streaming: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug, Default)]
struct Traffic {
    sent: u64,
    received: u64,
}

pub struct SessionDriver {
    session: Session,
    traffic: Traffic,
}

impl SessionDriver {
    pub fn new(role: Role) -> Self {
        Self {
            session: Session::new(role),
            traffic: Traffic::default(),
        }
    }

    /// Connects, negotiates and streams until the peer leaves, a fatal error
    /// occurs or `shutdown` resolves.
    ///
    /// A clean end (shutdown or the relay closing the channel) is `Ok`; any
    /// terminal failure is returned as the error.
    pub async fn run<F>(
        mut self,
        url: &Url,
        connector: &dyn SignalingConnector,
        launcher: &dyn MediaLauncher,
        shutdown: F,
    ) -> Result<SessionReport, SessionError>
    where
        F: Future<Output = ()>,
    {
        let role = self.session.role();
        tokio::pin!(shutdown);

        self.session.begin_connect();
        tracing::info!(target: "camlink::signaling", %url, role = role.as_str(), "connecting to signaling server");
        let connected = tokio::select! {
            result = connector.connect(url) => result,
            _ = &mut shutdown => {
                self.session.request_shutdown();
                self.session.mark_closed();
                return self.finish();
            }
        };
        let mut channel = match connected {
            Ok(channel) => channel,
            Err(err) => {
                self.session.on_connect_failed(err);
                return self.finish();
            }
        };
        tracing::info!(target: "camlink::signaling", "signaling channel open");
        self.session.on_channel_opened();

        let (media_tx, mut media_rx) = mpsc::unbounded_channel();
        let engine = tokio::select! {
            launched = launcher.launch(role, media_tx) => match launched {
                Ok(engine) => Some(engine),
                Err(err) => {
                    self.session.on_media_fatal(err.to_string());
                    None
                }
            },
            _ = &mut shutdown => {
                self.session.request_shutdown();
                None
            }
        };

        let mut worker = None;
        if let Some(engine) = &engine {
            let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
            let ops = OpWorker::spawn(Arc::clone(engine), completion_tx);
            self.dispatch(channel.as_mut(), &ops);

            while !self.session.is_winding_down() {
                tokio::select! {
                    _ = &mut shutdown => self.session.request_shutdown(),
                    event = channel.next_event() => match event {
                        ChannelEvent::MessageReceived(text) => {
                            self.traffic.received += 1;
                            tracing::trace!(target: "camlink::signaling", len = text.len(), "frame received");
                            self.session.on_signaling_text(&text);
                        }
                        ChannelEvent::Closed => self.session.on_channel_closed(),
                        ChannelEvent::Error(reason) => self.session.on_channel_error(reason),
                    },
                    Some(event) = media_rx.recv() => self.session.on_media_event(event),
                    Some(completion) = completion_rx.recv() => self.session.on_completion(completion),
                }
                self.dispatch(channel.as_mut(), &ops);
            }
            worker = Some(ops);
        }

        // Teardown order: stop issuing engine work, release signaling, then media.
        if let Some(worker) = worker {
            worker.stop();
        }
        channel.close().await;
        if let Some(engine) = engine {
            engine.shutdown().await;
        }
        self.session.mark_closed();
        self.finish()
    }

    fn dispatch(&mut self, channel: &mut dyn SignalingChannel, worker: &OpWorker) {
        for command in self.session.take_commands() {
            match command {
                Command::Send(message) => {
                    tracing::debug!(target: "camlink::signaling", kind = message.label(), "sending");
                    channel.send(signal_proto::encode(&message));
                    self.traffic.sent += 1;
                }
                Command::Media(op) => worker.submit(op),
            }
        }
    }

    fn finish(mut self) -> Result<SessionReport, SessionError> {
        let report = SessionReport {
            role: self.session.role(),
            final_state: self.session.state(),
            reached_streaming: self.session.reached_streaming(),
            messages_sent: self.traffic.sent,
            messages_received: self.traffic.received,
        };
        tracing::info!(
            target: "camlink::session",
            role = report.role.as_str(),
            streamed = report.reached_streaming,
            sent = report.messages_sent,
            received = report.messages_received,
            "session closed"
        );
        match self.session.take_close_reason() {
            Some(err) if err.is_terminal() => Err(err),
            _ => Ok(report),
        }
    }
}

/// Executes media operations serially and reports each completion.
struct OpWorker {
    ops: mpsc::UnboundedSender<MediaOp>,
    task: JoinHandle<()>,
}

impl OpWorker {
    fn spawn(engine: Arc<dyn MediaEngine>, completions: mpsc::UnboundedSender<Completion>) -> Self {
        let (ops, mut queue) = mpsc::unbounded_channel::<MediaOp>();
        let task = tokio::spawn(async move {
            while let Some(op) = queue.recv().await {
                tracing::trace!(target: "camlink::session", op = op.name(), "executing media op");
                let completion = execute(engine.as_ref(), op).await;
                if completions.send(completion).is_err() {
                    break;
                }
            }
        });
        Self { ops, task }
    }

    fn submit(&self, op: MediaOp) {
        if let Err(err) = self.ops.send(op) {
            tracing::warn!(target: "camlink::session", op = err.0.name(), "media worker gone; op dropped");
        }
    }

    /// Abandons in-flight and queued operations.
    fn stop(self) {
        self.task.abort();
    }
}

async fn execute(engine: &dyn MediaEngine, op: MediaOp) -> Completion {
    match op {
        MediaOp::CreateOffer => Completion::OfferCreated(engine.create_offer().await),
        MediaOp::CreateAnswer => Completion::AnswerCreated(engine.create_answer().await),
        MediaOp::SetLocalDescription(description) => {
            Completion::LocalDescriptionSet(engine.set_local_description(&description).await)
        }
        MediaOp::SetRemoteDescription(description) => {
            Completion::RemoteDescriptionSet(engine.set_remote_description(&description).await)
        }
        MediaOp::AddRemoteCandidate(candidate) => {
            let result = engine.add_remote_candidate(&candidate).await;
            Completion::CandidateAdded { candidate, result }
        }
        MediaOp::SpliceFragment { pad, fragment } => {
            let result = engine.splice_fragment(&pad, &fragment).await;
            Completion::FragmentSpliced { pad, result }
        }
    }
}
