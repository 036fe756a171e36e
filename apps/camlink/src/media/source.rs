//! Loops an H.264 Annex-B file into the outgoing track at a fixed frame rate.

use super::MediaError;
use crate::config::VideoSourceConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use webrtc::media::Sample;
use webrtc::media::io::h264_reader::H264Reader;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const READER_CAPACITY: usize = 1_048_576;

#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError>;
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        TrackLocalStaticSample::write_sample(self, sample)
            .await
            .map_err(|err| MediaError::Rejected {
                op: "write-sample",
                reason: err.to_string(),
            })
    }
}

pub struct FileSource {
    data: Bytes,
    frame_duration: Duration,
}

impl FileSource {
    pub async fn open(config: &VideoSourceConfig) -> Result<Self, MediaError> {
        let data = tokio::fs::read(&config.path).await.map_err(|err| {
            MediaError::Setup(format!("failed to read {}: {err}", config.path.display()))
        })?;
        Ok(Self::from_bytes(Bytes::from(data), config.fps))
    }

    pub fn from_bytes(data: Bytes, fps: u32) -> Self {
        Self {
            data,
            frame_duration: Duration::from_secs(1) / fps.max(1),
        }
    }

    /// Writes NAL units forever, pacing one slice per frame interval.
    /// Parameter sets and SEI go out immediately with zero duration.
    pub async fn run(self, sink: Arc<dyn SampleSink>) -> Result<(), MediaError> {
        let mut ticker = tokio::time::interval(self.frame_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes: u64 = 0;
        loop {
            let mut reader = H264Reader::new(Cursor::new(self.data.clone()), READER_CAPACITY);
            let mut nal_count = 0usize;
            while let Ok(nal) = reader.next_nal() {
                let data = nal.data.freeze();
                let Some(header) = data.first() else {
                    continue;
                };
                let duration = if is_vcl(header & 0x1f) {
                    ticker.tick().await;
                    self.frame_duration
                } else {
                    Duration::ZERO
                };
                nal_count += 1;
                sink.write_sample(&Sample {
                    data,
                    duration,
                    ..Default::default()
                })
                .await?;
            }
            if nal_count == 0 {
                return Err(MediaError::Setup(
                    "video file contains no H.264 NAL units".into(),
                ));
            }
            passes += 1;
            tracing::debug!(target: "camlink::session", passes, nal_count, "video file looped");
        }
    }
}

/// Coded slice NAL types (non-IDR slice through IDR slice).
fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}
