//! Wire envelope exchanged with the signaling relay.
//! Kept in its own crate so relay tooling and tests can speak the protocol
//! without pulling in the media stack.
//!
//! Every frame is a JSON object with exactly one recognized top-level key:
//!
//! ```json
//! {"sdp": {"type": "offer", "sdp": "v=0..."}}
//! {"ice": {"candidate": "candidate:1 1 UDP ...", "sdpMLineIndex": 0}}
//! ```

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SDP_KEY: &str = "sdp";
const ICE_KEY: &str = "ice";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpKind {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "offer" => Ok(SdpKind::Offer),
            "answer" => Ok(SdpKind::Answer),
            other => Err(DecodeError::UnknownSdpType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Sdp { kind: SdpKind, sdp: String },
    Ice { candidate: String, sdp_mline_index: u32 },
}

impl SignalingMessage {
    pub fn label(&self) -> &'static str {
        match self {
            SignalingMessage::Sdp { kind, .. } => kind.as_str(),
            SignalingMessage::Ice { .. } => "ice",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("signaling frame is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("signaling frame is not a json object")]
    NotAnObject,
    #[error("signaling frame has no recognized top-level key")]
    NoRecognizedKey,
    #[error("signaling frame carries both sdp and ice payloads")]
    AmbiguousKeys,
    #[error("invalid {key} payload: {source}")]
    Payload {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown sdp type '{0}'")]
    UnknownSdpType(String),
}

#[derive(Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

#[derive(Deserialize)]
struct IcePayload {
    candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: u32,
}

pub fn encode(message: &SignalingMessage) -> String {
    let value = match message {
        SignalingMessage::Sdp { kind, sdp } => json!({
            "sdp": { "type": kind.as_str(), "sdp": sdp }
        }),
        SignalingMessage::Ice {
            candidate,
            sdp_mline_index,
        } => json!({
            "ice": { "candidate": candidate, "sdpMLineIndex": sdp_mline_index }
        }),
    };
    value.to_string()
}

pub fn decode(text: &str) -> Result<SignalingMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };
    match (object.remove(SDP_KEY), object.remove(ICE_KEY)) {
        (Some(payload), None) => decode_sdp(payload),
        (None, Some(payload)) => decode_ice(payload),
        (Some(_), Some(_)) => Err(DecodeError::AmbiguousKeys),
        (None, None) => Err(DecodeError::NoRecognizedKey),
    }
}

fn decode_sdp(payload: Value) -> Result<SignalingMessage, DecodeError> {
    let payload: SdpPayload = serde_json::from_value(payload).map_err(|source| {
        DecodeError::Payload {
            key: SDP_KEY,
            source,
        }
    })?;
    Ok(SignalingMessage::Sdp {
        kind: payload.kind.parse()?,
        sdp: payload.sdp,
    })
}

fn decode_ice(payload: Value) -> Result<SignalingMessage, DecodeError> {
    let payload: IcePayload = serde_json::from_value(payload).map_err(|source| {
        DecodeError::Payload {
            key: ICE_KEY,
            source,
        }
    })?;
    Ok(SignalingMessage::Ice {
        candidate: payload.candidate,
        sdp_mline_index: payload.sdp_mline_index,
    })
}

/// Top-level keys of a frame, for diagnostics on frames that failed to decode.
pub fn top_level_keys(text: &str) -> Vec<String> {
    match serde_json::from_str::<Map<String, Value>>(text) {
        Ok(object) => object.keys().cloned().collect(),
        Err(_) => Vec::new(),
    }
}
