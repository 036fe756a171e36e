//! Receive-side media: which incoming streams we accept and the processing
//! fragment spliced behind the first one that matches.

use super::{MediaOp, Role, Session};
use crate::error::SessionError;
use crate::media::MediaError;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadId(pub String);

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoding {
    H264,
    Vp8,
    Vp9,
    Av1,
    Opus,
    Other(String),
}

impl Encoding {
    /// Maps an RTP encoding name or mime type (`H264`, `video/H264`) to an encoding.
    pub fn from_name(name: &str) -> Self {
        let codec = name.rsplit('/').next().unwrap_or(name);
        match codec.to_ascii_uppercase().as_str() {
            "H264" => Encoding::H264,
            "VP8" => Encoding::Vp8,
            "VP9" => Encoding::Vp9,
            "AV1" => Encoding::Av1,
            "OPUS" => Encoding::Opus,
            _ => Encoding::Other(codec.to_string()),
        }
    }
}

/// Negotiated capabilities of an incoming stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub kind: MediaKind,
    pub encoding: Encoding,
    pub clock_rate: u32,
    pub payload_type: u8,
}

/// The one stream shape the receiver knows how to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveProfile {
    pub kind: MediaKind,
    pub encoding: Encoding,
    pub clock_rate: u32,
}

impl ReceiveProfile {
    pub fn h264_video() -> Self {
        Self {
            kind: MediaKind::Video,
            encoding: Encoding::H264,
            clock_rate: 90_000,
        }
    }

    pub fn matches(&self, caps: &CapabilityDescriptor) -> bool {
        caps.kind == self.kind && caps.encoding == self.encoding && caps.clock_rate == self.clock_rate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueLeak {
    /// Discard the oldest queued packet to make room.
    DropOldest,
    /// Block the producer until there is room.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub capacity: usize,
    pub leak: QueueLeak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepayloaderSpec {
    /// Ask the sender for a keyframe as soon as the stream starts and after loss.
    pub request_keyframe: bool,
    /// Hold back output until the first keyframe arrives.
    pub wait_for_keyframe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserSpec {
    /// Re-insert cached SPS/PPS in front of every keyframe.
    pub parameter_sets_on_keyframe: bool,
}

/// Entry to the decoder. Pixel decoding happens in whatever consumes the
/// sink; this stage only admits units a decoder can be configured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderSpec {
    /// Hold back units until both SPS and PPS have been seen.
    pub require_parameter_sets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteStreamFormat {
    /// Start-code delimited NAL units.
    AnnexB,
    /// NAL units prefixed with a four-byte big-endian length.
    Avc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSpec {
    pub format: ByteStreamFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSpec {
    /// Present frames against the stream clock instead of as they arrive.
    pub sync: bool,
    /// Drop frames later than `max_lateness`.
    pub qos: bool,
    pub max_lateness: Duration,
}

/// Queue, depayloader, parser, decoder, converter and sink, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveFragment {
    pub queue: QueueSpec,
    pub depayloader: DepayloaderSpec,
    pub parser: ParserSpec,
    pub decoder: DecoderSpec,
    pub convert: ConvertSpec,
    pub sink: SinkSpec,
}

impl ReceiveFragment {
    /// Tuned for liveness: a short leaky queue, eager keyframe recovery and a
    /// sink that renders whatever arrives.
    pub fn low_latency_h264() -> Self {
        Self {
            queue: QueueSpec {
                capacity: 10,
                leak: QueueLeak::DropOldest,
            },
            depayloader: DepayloaderSpec {
                request_keyframe: true,
                wait_for_keyframe: false,
            },
            parser: ParserSpec {
                parameter_sets_on_keyframe: true,
            },
            decoder: DecoderSpec {
                require_parameter_sets: true,
            },
            convert: ConvertSpec {
                format: ByteStreamFormat::AnnexB,
            },
            sink: SinkSpec {
                sync: false,
                qos: false,
                max_lateness: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(super) enum ReceiveChain {
    #[default]
    NotBuilt,
    Splicing(PadId),
    Built(PadId),
}

impl ReceiveChain {
    pub(super) fn is_built(&self) -> bool {
        matches!(self, ReceiveChain::Built(_))
    }
}

impl Session {
    /// Builds the receive chain behind the first matching pad. Later pads are
    /// ignored, whether or not they match.
    pub fn on_incoming_pad(&mut self, pad: PadId, caps: &CapabilityDescriptor) {
        if self.role != Role::Answerer || self.is_winding_down() {
            tracing::debug!(target: "camlink::receive", %pad, "ignoring incoming pad");
            return;
        }
        match &self.receive {
            ReceiveChain::Built(existing) | ReceiveChain::Splicing(existing) => {
                tracing::info!(
                    target: "camlink::receive",
                    %pad,
                    %existing,
                    "receive chain already present; ignoring additional pad"
                );
                return;
            }
            ReceiveChain::NotBuilt => {}
        }
        let profile = ReceiveProfile::h264_video();
        if !profile.matches(caps) {
            tracing::info!(target: "camlink::receive", %pad, ?caps, "ignoring pad with unsupported caps");
            return;
        }

        tracing::info!(target: "camlink::receive", %pad, payload_type = caps.payload_type, "splicing receive chain");
        self.receive = ReceiveChain::Splicing(pad.clone());
        self.issue(MediaOp::SpliceFragment {
            pad,
            fragment: ReceiveFragment::low_latency_h264(),
        });
    }

    pub(super) fn on_fragment_spliced(&mut self, pad: PadId, result: Result<(), MediaError>) {
        match result {
            Ok(()) => {
                tracing::info!(target: "camlink::receive", %pad, "receive chain linked");
                self.receive = ReceiveChain::Built(pad);
                self.maybe_streaming();
            }
            Err(err) => {
                // Only this stream is lost; a later pad may still be linked.
                let err = SessionError::PipelineLinkFailure(format!("{pad}: {err}"));
                tracing::error!(target: "camlink::receive", "{err}");
                self.receive = ReceiveChain::NotBuilt;
            }
        }
    }
}
