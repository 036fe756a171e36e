//! [`MediaEngine`] backed by a webrtc-rs peer connection.

use super::fragment::{
    AnnexBFileSink, FrameSink, KeyframeRequester, ReceivePipeline, RtpSource, StatsSink,
};
use super::source::FileSource;
use super::{MediaEngine, MediaError, MediaEvent, MediaLauncher};
use crate::config::{Config, VideoSourceConfig};
use crate::session::receive::{Encoding, MediaKind};
use crate::session::{
    CapabilityDescriptor, IceCandidate, PadId, ReceiveFragment, Role, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine as CodecRegistry};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub const H264_PAYLOAD_TYPE: u8 = 96;
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const TRACK_ID: &str = "video";
const STREAM_ID: &str = "camlink";
const RTCP_READ_BUFFER: usize = 1500;

pub fn h264_capability() -> RTCRtpCodecCapability {
    let feedback = |typ: &str, parameter: &str| RTCPFeedback {
        typ: typ.to_owned(),
        parameter: parameter.to_owned(),
    };
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_H264.to_owned(),
        clock_rate: 90_000,
        channels: 0,
        sdp_fmtp_line: H264_FMTP.to_owned(),
        rtcp_feedback: vec![
            feedback("goog-remb", ""),
            feedback("ccm", "fir"),
            feedback("nack", ""),
            feedback("nack", "pli"),
        ],
    }
}

fn build_api() -> Result<API, MediaError> {
    let mut codecs = CodecRegistry::default();
    codecs
        .register_codec(
            RTCRtpCodecParameters {
                capability: h264_capability(),
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|err| MediaError::Setup(format!("register H264: {err}")))?;
    let registry = register_default_interceptors(Registry::new(), &mut codecs)
        .map_err(|err| MediaError::Setup(format!("register interceptors: {err}")))?;
    Ok(APIBuilder::new()
        .with_media_engine(codecs)
        .with_interceptor_registry(registry)
        .build())
}

fn rejected(op: &'static str) -> impl FnOnce(webrtc::Error) -> MediaError {
    move |err| MediaError::Rejected {
        op,
        reason: err.to_string(),
    }
}

pub struct RtcLauncher {
    ice_servers: Vec<String>,
    video: Option<VideoSourceConfig>,
    output: Option<PathBuf>,
}

impl RtcLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            video: config.video.clone(),
            output: config.output.clone(),
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaLauncher for RtcLauncher {
    async fn launch(
        &self,
        role: Role,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Arc<dyn MediaEngine>, MediaError> {
        let api = build_api()?;
        let pc = api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|err| MediaError::Setup(format!("create peer connection: {err}")))?;
        tracing::debug!(
            target: "camlink::ice",
            role = role.as_str(),
            ice_servers = ?self.ice_servers,
            "peer connection created"
        );

        let engine = Arc::new(RtcEngine::new(Arc::new(pc), self.output.clone()));
        engine.install_callbacks(events);
        let prepared = match role {
            Role::Offerer => engine.add_video_track(self.video.as_ref()).await,
            Role::Answerer => engine.add_receive_transceiver().await,
        };
        if let Err(err) = prepared {
            engine.shutdown().await;
            return Err(err);
        }
        Ok(engine)
    }
}

pub struct RtcEngine {
    pc: Arc<RTCPeerConnection>,
    pads: Arc<Mutex<HashMap<PadId, Arc<TrackRemote>>>>,
    pipelines: Mutex<Vec<ReceivePipeline>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: Arc<watch::Sender<bool>>,
    output: Option<PathBuf>,
    shut_down: AtomicBool,
}

impl RtcEngine {
    fn new(pc: Arc<RTCPeerConnection>, output: Option<PathBuf>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            pc,
            pads: Arc::new(Mutex::new(HashMap::new())),
            pipelines: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            connected: Arc::new(connected),
            output,
            shut_down: AtomicBool::new(false),
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    fn ensure_running(&self) -> Result<(), MediaError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(MediaError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn install_callbacks(&self, events: mpsc::UnboundedSender<MediaEvent>) {
        let tx = events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(MediaEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // None marks the end of gathering
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let index = u32::from(init.sdp_mline_index.unwrap_or(0));
                            let _ = tx.send(MediaEvent::LocalCandidate(IceCandidate::new(
                                init.candidate,
                                index,
                            )));
                        }
                        Err(err) => {
                            tracing::warn!(target: "camlink::ice", "unserializable local candidate: {err}")
                        }
                    }
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        let pads = Arc::clone(&self.pads);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                announce_track(track, &pads, &tx);
                Box::pin(async {})
            },
        ));

        let tx = events;
        let connected = Arc::clone(&self.connected);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::info!(target: "camlink::ice", %state, "peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => {
                        connected.send_replace(true);
                    }
                    RTCPeerConnectionState::Failed => {
                        connected.send_replace(false);
                        let _ = tx.send(MediaEvent::Fatal("peer connection failed".into()));
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        connected.send_replace(false);
                    }
                    _ => {}
                }
                Box::pin(async {})
            }));
    }

    async fn add_video_track(&self, video: Option<&VideoSourceConfig>) -> Result<(), MediaError> {
        let source = match video {
            Some(video) => Some(FileSource::open(video).await?),
            None => None,
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            h264_capability(),
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|err| MediaError::Setup(format!("add video track: {err}")))?;

        // Interceptors (NACK, receiver reports) only run while RTCP is read.
        self.spawn(async move {
            let mut buf = vec![0u8; RTCP_READ_BUFFER];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let Some(source) = source else {
            tracing::warn!(target: "camlink::session", "no video file given; the track will stay silent");
            return Ok(());
        };
        let mut connected = self.connected.subscribe();
        self.spawn(async move {
            while !*connected.borrow_and_update() {
                if connected.changed().await.is_err() {
                    return;
                }
            }
            tracing::info!(target: "camlink::session", "peer connected; streaming video");
            if let Err(err) = source.run(track).await {
                tracing::warn!(target: "camlink::session", "video source stopped: {err}");
            }
        });
        Ok(())
    }

    async fn add_receive_transceiver(&self) -> Result<(), MediaError> {
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|err| MediaError::Setup(format!("add receive transceiver: {err}")))?;
        Ok(())
    }

    fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, webrtc::Error> {
        match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
    }

    async fn frame_sink(&self) -> Result<Box<dyn FrameSink>, MediaError> {
        match &self.output {
            Some(path) => {
                let sink = AnnexBFileSink::create(path)
                    .await
                    .map_err(|err| MediaError::Link(err.to_string()))?;
                Ok(Box::new(sink))
            }
            None => Ok(Box::new(StatsSink::new())),
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_running()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(rejected("create-offer"))?;
        Ok(SessionDescription::new(SdpKind::Offer, offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_running()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(rejected("create-answer"))?;
        Ok(SessionDescription::new(SdpKind::Answer, answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), MediaError> {
        self.ensure_running()?;
        let description = Self::to_rtc(description).map_err(rejected("set-local-description"))?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(rejected("set-local-description"))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), MediaError> {
        self.ensure_running()?;
        let description = Self::to_rtc(description).map_err(rejected("set-remote-description"))?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(rejected("set-remote-description"))
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.ensure_running()?;
        let sdp_mline_index = u16::try_from(candidate.sdp_mline_index).map_err(|_| {
            MediaError::Rejected {
                op: "add-ice-candidate",
                reason: format!("m-line index {} out of range", candidate.sdp_mline_index),
            }
        })?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: None,
                sdp_mline_index: Some(sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(rejected("add-ice-candidate"))
    }

    async fn splice_fragment(&self, pad: &PadId, fragment: &ReceiveFragment) -> Result<(), MediaError> {
        self.ensure_running()?;
        let track = self
            .pads
            .lock()
            .get(pad)
            .cloned()
            .ok_or_else(|| MediaError::UnknownPad(pad.clone()))?;
        let sink = self.frame_sink().await?;
        let pipeline = ReceivePipeline::spawn(
            Arc::new(TrackSource(track)),
            *fragment,
            Arc::new(PliRequester(Arc::downgrade(&self.pc))),
            sink,
        );
        self.pipelines.lock().push(pipeline);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for pipeline in self.pipelines.lock().drain(..) {
            pipeline.stop();
        }
        self.pads.lock().clear();
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target: "camlink::session", "peer connection did not close cleanly: {err}");
        }
    }
}

/// Registers an incoming track as a pad and tells the session about it.
fn announce_track(
    track: Arc<TrackRemote>,
    pads: &Mutex<HashMap<PadId, Arc<TrackRemote>>>,
    events: &mpsc::UnboundedSender<MediaEvent>,
) {
    let kind = match track.kind() {
        RTPCodecType::Video => MediaKind::Video,
        RTPCodecType::Audio => MediaKind::Audio,
        RTPCodecType::Unspecified => {
            tracing::debug!(target: "camlink::receive", ssrc = track.ssrc(), "track of unspecified kind");
            return;
        }
    };
    let codec = track.codec();
    let caps = CapabilityDescriptor {
        kind,
        encoding: Encoding::from_name(&codec.capability.mime_type),
        clock_rate: codec.capability.clock_rate,
        payload_type: codec.payload_type,
    };
    let pad = PadId(format!("{}-{}", track.kind(), track.ssrc()));
    tracing::info!(
        target: "camlink::receive",
        %pad,
        mime = %codec.capability.mime_type,
        "incoming track"
    );
    pads.lock().insert(pad.clone(), track);
    let _ = events.send(MediaEvent::IncomingPad { pad, caps });
}

struct TrackSource(Arc<TrackRemote>);

#[async_trait]
impl RtpSource for TrackSource {
    fn ssrc(&self) -> u32 {
        self.0.ssrc()
    }

    async fn next_packet(&self) -> Option<RtpPacket> {
        match self.0.read_rtp().await {
            Ok((packet, _)) => Some(packet),
            Err(err) => {
                tracing::debug!(target: "camlink::receive", ssrc = self.0.ssrc(), "track ended: {err}");
                None
            }
        }
    }
}

/// Sends RTCP picture loss indications over the owning peer connection.
struct PliRequester(Weak<RTCPeerConnection>);

#[async_trait]
impl KeyframeRequester for PliRequester {
    async fn request_keyframe(&self, media_ssrc: u32) {
        let Some(pc) = self.0.upgrade() else {
            return;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        match pc.write_rtcp(&[Box::new(pli)]).await {
            Ok(_) => tracing::debug!(target: "camlink::receive", media_ssrc, "requested keyframe"),
            Err(err) => tracing::debug!(target: "camlink::receive", "keyframe request failed: {err}"),
        }
    }
}
