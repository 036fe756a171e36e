//! The H.264 receive chain spliced behind an incoming track: leaky queue,
//! RTP depayloader, access-unit parser, decode gate, byte-stream converter
//! and a frame sink.
//!
//! The decode gate admits only units a decoder can be configured from; pixel
//! decoding and display belong to whatever consumes the sink's output.

use crate::session::receive::{
    ByteStreamFormat, ConvertSpec, DecoderSpec, DepayloaderSpec, ParserSpec, QueueLeak, QueueSpec,
    ReceiveFragment, SinkSpec,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp::packetizer::Depacketizer;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const VIDEO_CLOCK_HZ: u64 = 90_000;
const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded FIFO between the network reader and the processing task.
pub struct LeakyQueue<T> {
    state: Mutex<QueueState<T>>,
    items_ready: Notify,
    space_ready: Notify,
    capacity: usize,
    leak: QueueLeak,
}

struct QueueState<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

impl<T> LeakyQueue<T> {
    pub fn new(spec: QueueSpec) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(spec.capacity),
                dropped: 0,
                closed: false,
            }),
            items_ready: Notify::new(),
            space_ready: Notify::new(),
            capacity: spec.capacity.max(1),
            leak: spec.leak,
        }
    }

    /// Enqueues `item`. A full leaky queue discards its oldest entry; a
    /// non-leaky one waits for room. Returns false once the queue is closed.
    pub async fn push(&self, item: T) -> bool {
        let mut item = Some(item);
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return false;
                }
                if state.items.len() >= self.capacity {
                    match self.leak {
                        QueueLeak::DropOldest => {
                            state.items.pop_front();
                            state.dropped += 1;
                        }
                        QueueLeak::None => {}
                    }
                }
                if state.items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    drop(state);
                    self.items_ready.notify_one();
                    return true;
                }
            }
            self.space_ready.notified().await;
        }
    }

    /// Next item, or `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.items_ready.notified().await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.items_ready.notify_one();
        self.space_ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Depayloaded {
    /// Completed access units in Annex-B form with their RTP timestamps,
    /// oldest first. A packet can close at most two: the unit its timestamp
    /// change ends and, with the marker bit, its own.
    pub units: Vec<(u32, Bytes)>,
    /// A sequence gap was seen before this packet.
    pub loss: bool,
}

/// Reassembles RTP payloads into Annex-B access units.
pub struct H264Depayloader {
    packet: H264Packet,
    pending: BytesMut,
    pending_timestamp: Option<u32>,
    last_sequence: Option<u16>,
}

impl H264Depayloader {
    pub fn new() -> Self {
        Self {
            packet: H264Packet::default(),
            pending: BytesMut::new(),
            pending_timestamp: None,
            last_sequence: None,
        }
    }

    pub fn push(&mut self, rtp: &RtpPacket) -> Depayloaded {
        let mut out = Depayloaded::default();
        let sequence = rtp.header.sequence_number;
        if let Some(last) = self.last_sequence {
            if sequence != last.wrapping_add(1) {
                out.loss = true;
                // fragments of the damaged unit would splice into the next one
                self.packet = H264Packet::default();
                self.pending.clear();
                self.pending_timestamp = None;
            }
        }
        self.last_sequence = Some(sequence);

        let timestamp = rtp.header.timestamp;
        if self.pending_timestamp.is_some_and(|ts| ts != timestamp) {
            out.units.extend(self.take_pending());
        }

        match self.packet.depacketize(&rtp.payload) {
            Ok(nalus) if !nalus.is_empty() => {
                self.pending.extend_from_slice(&nalus);
                self.pending_timestamp = Some(timestamp);
            }
            Ok(_) => {
                self.pending_timestamp.get_or_insert(timestamp);
            }
            Err(err) => {
                tracing::trace!(target: "camlink::receive", sequence, "undecodable rtp payload: {err}");
            }
        }

        if rtp.header.marker {
            out.units.extend(self.take_pending());
        }
        out
    }

    fn take_pending(&mut self) -> Option<(u32, Bytes)> {
        let timestamp = self.pending_timestamp.take()?;
        if self.pending.is_empty() {
            return None;
        }
        Some((timestamp, self.pending.split().freeze()))
    }
}

impl Default for H264Depayloader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub timestamp: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Tracks SPS/PPS and makes every keyframe independently decodable.
pub struct AccessUnitParser {
    spec: ParserSpec,
    wait_for_keyframe: bool,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    seen_keyframe: bool,
}

impl AccessUnitParser {
    pub fn new(spec: ParserSpec, depayloader: DepayloaderSpec) -> Self {
        Self {
            spec,
            wait_for_keyframe: depayloader.wait_for_keyframe,
            sps: None,
            pps: None,
            seen_keyframe: false,
        }
    }

    pub fn parse(&mut self, timestamp: u32, annexb: &[u8]) -> Option<AccessUnit> {
        let nalus = split_annexb(annexb);
        let mut keyframe = false;
        let mut has_sps = false;
        let mut has_pps = false;
        for nalu in &nalus {
            match nalu_type(nalu) {
                NAL_SPS => {
                    has_sps = true;
                    self.sps = Some(Bytes::copy_from_slice(nalu));
                }
                NAL_PPS => {
                    has_pps = true;
                    self.pps = Some(Bytes::copy_from_slice(nalu));
                }
                NAL_IDR => keyframe = true,
                _ => {}
            }
        }
        if nalus.is_empty() {
            return None;
        }
        if keyframe {
            self.seen_keyframe = true;
        } else if self.wait_for_keyframe && !self.seen_keyframe {
            return None;
        }

        let mut data = BytesMut::with_capacity(annexb.len() + 64);
        if keyframe && self.spec.parameter_sets_on_keyframe {
            if let (false, Some(sps)) = (has_sps, &self.sps) {
                put_nalu(&mut data, sps);
            }
            if let (false, Some(pps)) = (has_pps, &self.pps) {
                put_nalu(&mut data, pps);
            }
        }
        for nalu in &nalus {
            put_nalu(&mut data, nalu);
        }
        Some(AccessUnit {
            timestamp,
            keyframe,
            data: data.freeze(),
        })
    }
}

impl AccessUnitParser {
    /// Both parameter sets have been seen, so a decoder can be configured.
    pub fn configured(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }
}

/// Front of the decoder: drops units it could not be configured from.
pub struct DecodeGate {
    spec: DecoderSpec,
    discarded: u64,
}

impl DecodeGate {
    pub fn new(spec: DecoderSpec) -> Self {
        Self { spec, discarded: 0 }
    }

    pub fn admit(&mut self, unit: &AccessUnit, configured: bool) -> bool {
        if configured || !self.spec.require_parameter_sets {
            return true;
        }
        self.discarded += 1;
        if self.discarded == 1 {
            tracing::debug!(
                target: "camlink::receive",
                timestamp = unit.timestamp,
                "discarding frames until SPS and PPS arrive"
            );
        }
        false
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

/// Rewrites an access unit into the byte-stream format the sink expects.
pub fn convert(unit: AccessUnit, spec: ConvertSpec) -> AccessUnit {
    match spec.format {
        ByteStreamFormat::AnnexB => unit,
        ByteStreamFormat::Avc => {
            let mut data = BytesMut::with_capacity(unit.data.len());
            for nalu in split_annexb(&unit.data) {
                data.put_u32(nalu.len() as u32);
                data.put_slice(nalu);
            }
            AccessUnit {
                data: data.freeze(),
                ..unit
            }
        }
    }
}

fn put_nalu(out: &mut BytesMut, nalu: &[u8]) {
    out.put_slice(&START_CODE);
    out.put_slice(nalu);
}

fn nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |header| header & 0x1f)
}

/// Splits an Annex-B byte stream into NAL units without their start codes.
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    let mut nalus = Vec::with_capacity(starts.len());
    for (index, &(_, payload_start)) in starts.iter().enumerate() {
        let mut end = starts
            .get(index + 1)
            .map_or(data.len(), |&(next_code, _)| next_code);
        // a four-byte start code leaves a zero behind the previous unit
        while end > payload_start && data[end - 1] == 0 && index + 1 < starts.len() {
            end -= 1;
        }
        if end > payload_start {
            nalus.push(&data[payload_start..end]);
        }
    }
    nalus
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Now,
    After(Duration),
    Drop { late_by: Duration },
}

/// Applies the sink's clock policy to each access unit.
pub struct Presenter {
    spec: SinkSpec,
    anchor: Option<(u32, Instant)>,
}

impl Presenter {
    pub fn new(spec: SinkSpec) -> Self {
        Self { spec, anchor: None }
    }

    pub fn schedule(&mut self, timestamp: u32, now: Instant) -> Schedule {
        if !self.spec.sync {
            return Schedule::Now;
        }
        let (anchor_ts, anchor_at) = *self.anchor.get_or_insert((timestamp, now));
        let ticks = timestamp.wrapping_sub(anchor_ts) as i32;
        let offset = Duration::from_micros((ticks.max(0) as u64) * 1_000_000 / VIDEO_CLOCK_HZ);
        let due = anchor_at + offset;
        if due > now {
            return Schedule::After(due - now);
        }
        let late_by = now - due;
        if self.spec.qos && late_by > self.spec.max_lateness {
            Schedule::Drop { late_by }
        } else {
            Schedule::Now
        }
    }
}

/// Rate limit for keyframe requests.
pub struct KeyframePacer {
    interval: Duration,
    last: Option<Instant>,
}

impl KeyframePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
pub trait KeyframeRequester: Send + Sync {
    async fn request_keyframe(&self, media_ssrc: u32);
}

#[async_trait]
pub trait RtpSource: Send + Sync {
    fn ssrc(&self) -> u32;

    /// Next packet from the network; `None` when the stream ended.
    async fn next_packet(&self) -> Option<RtpPacket>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write frame: {0}")]
    Write(#[from] std::io::Error),
}

/// Final stage: consumes parsed access units.
#[async_trait]
pub trait FrameSink: Send {
    async fn render(&mut self, unit: &AccessUnit) -> Result<(), SinkError>;

    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes the elementary stream to a file for an external decoder or player.
pub struct AnnexBFileSink {
    file: tokio::fs::File,
    frames: u64,
}

impl AnnexBFileSink {
    pub async fn create(path: &Path) -> Result<Self, SinkError> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|source| SinkError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(target: "camlink::receive", path = %path.display(), "writing received video");
        Ok(Self { file, frames: 0 })
    }
}

#[async_trait]
impl FrameSink for AnnexBFileSink {
    async fn render(&mut self, unit: &AccessUnit) -> Result<(), SinkError> {
        self.file.write_all(&unit.data).await?;
        self.frames += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.file.flush().await?;
        tracing::info!(target: "camlink::receive", frames = self.frames, "received video written");
        Ok(())
    }
}

/// Counts frames and reports throughput periodically.
#[derive(Debug)]
pub struct StatsSink {
    frames: u64,
    keyframes: u64,
    bytes: u64,
    window_start: Instant,
    window_frames: u64,
}

impl StatsSink {
    pub fn new() -> Self {
        Self {
            frames: 0,
            keyframes: 0,
            bytes: 0,
            window_start: Instant::now(),
            window_frames: 0,
        }
    }
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for StatsSink {
    async fn render(&mut self, unit: &AccessUnit) -> Result<(), SinkError> {
        self.frames += 1;
        self.window_frames += 1;
        self.bytes += unit.data.len() as u64;
        if unit.keyframe {
            self.keyframes += 1;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed >= STATS_INTERVAL {
            let fps = self.window_frames as f64 / elapsed.as_secs_f64();
            tracing::info!(
                target: "camlink::receive",
                frames = self.frames,
                keyframes = self.keyframes,
                bytes = self.bytes,
                "receiving video at {fps:.1} fps"
            );
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        tracing::info!(
            target: "camlink::receive",
            frames = self.frames,
            keyframes = self.keyframes,
            bytes = self.bytes,
            "receive stream ended"
        );
        Ok(())
    }
}

/// A running receive chain. Dropping it stops both tasks.
pub struct ReceivePipeline {
    ingest: JoinHandle<()>,
    process: JoinHandle<()>,
}

impl ReceivePipeline {
    pub fn spawn(
        source: Arc<dyn RtpSource>,
        fragment: ReceiveFragment,
        keyframes: Arc<dyn KeyframeRequester>,
        mut sink: Box<dyn FrameSink>,
    ) -> Self {
        let queue = Arc::new(LeakyQueue::new(fragment.queue));
        let ssrc = source.ssrc();

        let ingest_queue = Arc::clone(&queue);
        let ingest = tokio::spawn(async move {
            while let Some(packet) = source.next_packet().await {
                if !ingest_queue.push(packet).await {
                    break;
                }
            }
            ingest_queue.close();
        });

        let process = tokio::spawn(async move {
            let mut depayloader = H264Depayloader::new();
            let mut parser = AccessUnitParser::new(fragment.parser, fragment.depayloader);
            let mut gate = DecodeGate::new(fragment.decoder);
            let mut presenter = Presenter::new(fragment.sink);
            let mut pacer = KeyframePacer::new(KEYFRAME_REQUEST_INTERVAL);
            let mut reported_drops = 0;

            if fragment.depayloader.request_keyframe && pacer.ready(Instant::now()) {
                keyframes.request_keyframe(ssrc).await;
            }

            'stream: while let Some(packet) = queue.pop().await {
                let out = depayloader.push(&packet);
                if out.loss {
                    let dropped = queue.dropped();
                    if dropped != reported_drops {
                        tracing::debug!(target: "camlink::receive", dropped, "receive queue overflowed");
                        reported_drops = dropped;
                    }
                    if fragment.depayloader.request_keyframe && pacer.ready(Instant::now()) {
                        keyframes.request_keyframe(ssrc).await;
                    }
                }
                for (timestamp, annexb) in out.units {
                    let Some(unit) = parser.parse(timestamp, &annexb) else {
                        continue;
                    };
                    if !gate.admit(&unit, parser.configured()) {
                        continue;
                    }
                    let unit = convert(unit, fragment.convert);
                    match presenter.schedule(unit.timestamp, Instant::now()) {
                        Schedule::Now => {}
                        Schedule::After(wait) => tokio::time::sleep(wait).await,
                        Schedule::Drop { late_by } => {
                            tracing::trace!(target: "camlink::receive", ?late_by, "dropping late frame");
                            continue;
                        }
                    }
                    if let Err(err) = sink.render(&unit).await {
                        tracing::error!(target: "camlink::receive", "sink failed: {err}");
                        break 'stream;
                    }
                }
            }
            if gate.discarded() > 0 {
                tracing::debug!(target: "camlink::receive", discarded = gate.discarded(), "frames held back from the decoder");
            }
            if let Err(err) = sink.finish().await {
                tracing::warn!(target: "camlink::receive", "sink did not finish cleanly: {err}");
            }
        });

        Self { ingest, process }
    }

    /// Waits for the stream to drain after its source ended.
    pub async fn join(mut self) {
        let _ = (&mut self.ingest).await;
        let _ = (&mut self.process).await;
    }

    pub fn stop(&self) {
        self.ingest.abort();
        self.process.abort();
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
