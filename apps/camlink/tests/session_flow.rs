use async_trait::async_trait;
use camlink_core::error::SessionError;
use camlink_core::media::{MediaEngine, MediaError, MediaEvent, MediaLauncher};
use camlink_core::session::driver::{SessionDriver, SessionReport};
use camlink_core::session::receive::{Encoding, MediaKind};
use camlink_core::session::{
    CapabilityDescriptor, IceCandidate, PadId, ReceiveFragment, Role, SdpKind, SessionDescription,
    SessionState, SignalingMessage,
};
use camlink_core::signaling::{MemoryConnector, RelayHandle, TransportError};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use test_timeout::tokio_timeout_test;
use tokio::sync::{Notify, mpsc, oneshot};
use url::Url;

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

#[derive(Default)]
struct Behaviour {
    fail_create_offer: bool,
    hold_set_remote: bool,
    refuse_launch: bool,
}

/// Records every call and answers with canned descriptions.
#[derive(Default)]
struct FakeEngine {
    behaviour: Behaviour,
    calls: Mutex<Vec<String>>,
    released: Notify,
    shutdowns: AtomicUsize,
}

impl FakeEngine {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create-offer");
        if self.behaviour.fail_create_offer {
            return Err(MediaError::Rejected {
                op: "create-offer",
                reason: "no codecs".into(),
            });
        }
        Ok(SessionDescription::new(SdpKind::Offer, OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create-answer");
        Ok(SessionDescription::new(SdpKind::Answer, ANSWER_SDP))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set-local:{}", description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set-remote:{}", description.kind));
        if self.behaviour.hold_set_remote {
            self.released.notified().await;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(format!("add-candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn splice_fragment(&self, pad: &PadId, fragment: &ReceiveFragment) -> Result<(), MediaError> {
        assert_eq!(*fragment, ReceiveFragment::low_latency_h264());
        self.record(format!("splice:{pad}"));
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeLauncher {
    engine: Arc<FakeEngine>,
    events: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            engine: Arc::new(FakeEngine {
                behaviour,
                ..Default::default()
            }),
            events: Mutex::new(None),
            launches: AtomicUsize::new(0),
        }
    }

    fn emit(&self, event: MediaEvent) {
        let events = self.events.lock();
        let sender = events.as_ref().expect("engine not launched");
        sender.send(event).expect("driver gone");
    }
}

#[async_trait]
impl MediaLauncher for FakeLauncher {
    async fn launch(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.engine.behaviour.refuse_launch {
            return Err(MediaError::Setup("no camera".into()));
        }
        if role == Role::Offerer {
            events.send(MediaEvent::NegotiationNeeded).unwrap();
        }
        *self.events.lock() = Some(events);
        Ok(self.engine.clone() as Arc<dyn MediaEngine>)
    }
}

fn relay_url() -> Url {
    Url::parse("ws://127.0.0.1:8080/signal").unwrap()
}

fn h264_pad(name: &str) -> MediaEvent {
    MediaEvent::IncomingPad {
        pad: PadId(name.into()),
        caps: CapabilityDescriptor {
            kind: MediaKind::Video,
            encoding: Encoding::H264,
            clock_rate: 90_000,
            payload_type: 96,
        },
    }
}

fn sdp_frame(kind: SdpKind, sdp: &str) -> String {
    signal_proto::encode(&SignalingMessage::Sdp {
        kind,
        sdp: sdp.into(),
    })
}

fn ice_frame(candidate: &str) -> String {
    signal_proto::encode(&SignalingMessage::Ice {
        candidate: candidate.into(),
        sdp_mline_index: 0,
    })
}

fn decoded(relay: &mut RelayHandle) -> Vec<SignalingMessage> {
    relay
        .drain_sent()
        .iter()
        .map(|text| signal_proto::decode(text).unwrap())
        .collect()
}

/// Lets every runnable task finish. Test time is paused, so the clock only
/// moves once the runtime is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A shutdown future and the trigger that resolves it. Dropping the trigger
/// also resolves it, so tests keep it bound until the session is done.
fn shutdown_trigger() -> (oneshot::Sender<()>, impl Future<Output = ()>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    (stop_tx, async move {
        let _ = stop_rx.await;
    })
}

async fn run_session(
    role: Role,
    connector: &MemoryConnector,
    launcher: &FakeLauncher,
    shutdown: impl Future<Output = ()>,
) -> Result<SessionReport, SessionError> {
    SessionDriver::new(role)
        .run(&relay_url(), connector, launcher, shutdown)
        .await
}

#[tokio_timeout_test(secs = 10, paused)]
async fn offerer_sends_one_offer_and_streams_after_answer() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());
    let engine = launcher.engine.clone();

    let (_stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Offerer, &connector, &launcher, shutdown), async {
        let offer = relay.next_sent().await.unwrap();
        assert_eq!(
            signal_proto::decode(&offer).unwrap(),
            SignalingMessage::Sdp {
                kind: SdpKind::Offer,
                sdp: OFFER_SDP.into()
            }
        );
        relay.deliver(sdp_frame(SdpKind::Answer, ANSWER_SDP));
        settle().await;
        assert!(decoded(&mut relay).is_empty());
        relay.hang_up();
    });
    let report = result.unwrap();

    assert_eq!(
        engine.calls(),
        vec!["create-offer", "set-local:offer", "set-remote:answer"]
    );
    assert_eq!(report.final_state, SessionState::Closed);
    assert!(report.reached_streaming);
    assert_eq!(report.messages_sent, 1);
    assert_eq!(report.messages_received, 1);
    assert!(relay.is_closed());
    assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn answerer_buffers_early_candidates_and_applies_them_in_order() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());
    let engine = launcher.engine.clone();

    let (stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Answerer, &connector, &launcher, shutdown), async {
        for candidate in ["candidate:1", "candidate:2", "candidate:3"] {
            relay.deliver(ice_frame(candidate));
        }
        settle().await;
        assert!(engine.calls().is_empty());

        relay.deliver(sdp_frame(SdpKind::Offer, OFFER_SDP));
        settle().await;
        assert_eq!(
            decoded(&mut relay),
            vec![SignalingMessage::Sdp {
                kind: SdpKind::Answer,
                sdp: ANSWER_SDP.into()
            }]
        );

        launcher.emit(MediaEvent::LocalCandidate(IceCandidate::new("candidate:local", 0)));
        launcher.emit(h264_pad("video-1"));
        settle().await;
        assert_eq!(
            decoded(&mut relay),
            vec![SignalingMessage::Ice {
                candidate: "candidate:local".into(),
                sdp_mline_index: 0
            }]
        );
        let _ = stop.send(());
    });
    let report = result.unwrap();

    assert_eq!(
        engine.calls(),
        vec![
            "set-remote:offer",
            "add-candidate:candidate:1",
            "add-candidate:candidate:2",
            "add-candidate:candidate:3",
            "create-answer",
            "set-local:answer",
            "splice:video-1",
        ]
    );
    assert!(report.reached_streaming);
    assert_eq!(report.messages_sent, 2);
    assert_eq!(report.messages_received, 4);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn close_during_negotiation_abandons_pending_work() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour {
        hold_set_remote: true,
        ..Default::default()
    });
    let engine = launcher.engine.clone();

    let (_stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Answerer, &connector, &launcher, shutdown), async {
        relay.deliver(sdp_frame(SdpKind::Offer, OFFER_SDP));
        relay.deliver(ice_frame("candidate:1"));
        settle().await;
        relay.hang_up();
    });
    let report = result.unwrap();

    assert_eq!(engine.calls(), vec!["set-remote:offer"]);
    assert!(decoded(&mut relay).is_empty());
    assert!(!report.reached_streaming);
    assert_eq!(report.final_state, SessionState::Closed);
    assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn second_matching_pad_is_not_spliced() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());
    let engine = launcher.engine.clone();

    let (stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Answerer, &connector, &launcher, shutdown), async {
        relay.deliver(sdp_frame(SdpKind::Offer, OFFER_SDP));
        settle().await;
        launcher.emit(h264_pad("video-1"));
        launcher.emit(h264_pad("video-2"));
        settle().await;
        let _ = stop.send(());
    });
    assert!(result.unwrap().reached_streaming);
    assert_eq!(decoded(&mut relay).len(), 1);

    let splices: Vec<String> = engine
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("splice:"))
        .collect();
    assert_eq!(splices, vec!["splice:video-1"]);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn malformed_frames_do_not_disturb_negotiation() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());

    let (stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Answerer, &connector, &launcher, shutdown), async {
        relay.deliver("HELLO 42");
        relay.deliver(r#"{"sdp":{"type":"answer","sdp":"v=0"}}"#);
        relay.deliver(r#"{"ice":{"candidate":"c"}}"#);
        relay.deliver(sdp_frame(SdpKind::Offer, OFFER_SDP));
        settle().await;
        assert_eq!(decoded(&mut relay).len(), 1);
        let _ = stop.send(());
    });
    let report = result.unwrap();

    assert_eq!(report.messages_received, 4);
    assert_eq!(report.messages_sent, 1);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn unreachable_relay_fails_without_launching_media() {
    let connector = MemoryConnector::refusing("connection refused");
    let launcher = FakeLauncher::new(Behaviour::default());

    let (_stop, shutdown) = shutdown_trigger();
    let result = run_session(Role::Offerer, &connector, &launcher, shutdown).await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::Connect(_)))
    ));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio_timeout_test(secs = 10, paused)]
async fn failed_offer_creation_is_reported() {
    let (connector, mut relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour {
        fail_create_offer: true,
        ..Default::default()
    });

    let (_stop, shutdown) = shutdown_trigger();
    let result = run_session(Role::Offerer, &connector, &launcher, shutdown).await;
    assert!(matches!(result, Err(SessionError::NegotiationRejected(_))));
    assert!(decoded(&mut relay).is_empty());
    assert!(relay.is_closed());
}

#[tokio_timeout_test(secs = 10, paused)]
async fn media_launch_failure_closes_the_channel() {
    let (connector, relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour {
        refuse_launch: true,
        ..Default::default()
    });

    let (_stop, shutdown) = shutdown_trigger();
    let result = run_session(Role::Answerer, &connector, &launcher, shutdown).await;
    assert!(matches!(result, Err(SessionError::MediaEngine(_))));
    assert!(relay.is_closed());
}

#[tokio_timeout_test(secs = 10, paused)]
async fn peer_connection_failure_is_fatal() {
    let (connector, _relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());

    let (_stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Offerer, &connector, &launcher, shutdown), async {
        settle().await;
        launcher.emit(MediaEvent::Fatal("peer connection failed".into()));
    });
    assert!(matches!(result, Err(SessionError::MediaEngine(reason)) if reason.contains("failed")));
}

#[tokio_timeout_test(secs = 10, paused)]
async fn abnormal_channel_close_is_a_transport_error() {
    let (connector, relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());

    let (_stop, shutdown) = shutdown_trigger();
    relay.fail("connection reset");
    let result = run_session(Role::Answerer, &connector, &launcher, shutdown).await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(TransportError::Abnormal(_)))
    ));
}

#[tokio_timeout_test(secs = 10, paused)]
async fn shutdown_ends_the_session_cleanly() {
    let (connector, relay) = MemoryConnector::pair();
    let launcher = FakeLauncher::new(Behaviour::default());
    let engine = launcher.engine.clone();

    let (stop, shutdown) = shutdown_trigger();
    let (result, ()) = tokio::join!(run_session(Role::Answerer, &connector, &launcher, shutdown), async {
        settle().await;
        let _ = stop.send(());
    });
    let report = result.unwrap();

    assert_eq!(report.final_state, SessionState::Closed);
    assert!(!report.reached_streaming);
    assert!(relay.is_closed());
    assert_eq!(engine.shutdowns.load(Ordering::SeqCst), 1);
}
