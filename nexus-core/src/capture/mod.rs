//! Capture pipeline: microphone samples → fixed blocks → wire frames.
//!
//! ## Per block
//!
//! ```text
//! 1. Publish VolumeLevel (always, muted or not)
//! 2. If muted: stop here, nothing is sent
//! 3. encode_block → EncodedFrame
//! 4. ChannelSender::try_send_frame (never waits; full queue drops the frame)
//! ```
//!
//! [`run`] drives the pipeline from the capture ring inside `spawn_blocking`,
//! so the cpal callback only ever pushes into the ring.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{chunk::AudioBlock, AudioConsumer, Consumer},
    channel::{ChannelSender, SendOutcome},
    codec::{encode_block, volume_level},
    engine::diagnostics::SessionDiagnostics,
    error::Result,
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// Shared 0–100 meter value, stored as f32 bits.
#[derive(Debug, Clone, Default)]
pub struct VolumeLevel(Arc<AtomicU32>);

impl VolumeLevel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Frames microphone audio into blocks and forwards them to the channel.
pub struct CapturePipeline {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    sender: ChannelSender,
    muted: Arc<AtomicBool>,
    volume: VolumeLevel,
    diagnostics: Arc<SessionDiagnostics>,
}

impl CapturePipeline {
    pub fn new(
        sender: ChannelSender,
        muted: Arc<AtomicBool>,
        volume: VolumeLevel,
        diagnostics: Arc<SessionDiagnostics>,
        block_size: usize,
        sample_rate: u32,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
            sender,
            muted,
            volume,
            diagnostics,
        }
    }

    /// Append samples at the capture rate; every completed block is processed
    /// immediately. Returns the number of blocks processed.
    pub fn push_samples(&mut self, samples: &[f32]) -> usize {
        self.pending.extend_from_slice(samples);
        let mut processed = 0;
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            let block = std::mem::replace(&mut self.pending, rest);
            self.process_block(AudioBlock::new(block, self.sample_rate));
            processed += 1;
        }
        processed
    }

    /// Handle one complete block.
    pub fn process_block(&mut self, block: AudioBlock) {
        self.volume.set(volume_level(&block.samples));
        self.diagnostics
            .blocks_captured
            .fetch_add(1, Ordering::Relaxed);

        // Read once per block; a toggle mid-block applies to the next one.
        if self.muted.load(Ordering::Acquire) {
            self.diagnostics.blocks_muted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let frame = encode_block(&block.samples, block.sample_rate);
        match self.sender.try_send_frame(frame) {
            SendOutcome::Sent => {
                self.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Dropped => {
                let dropped = self.diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "channel send queue full; dropping microphone frames");
                }
            }
            SendOutcome::Closed => {
                self.diagnostics
                    .frames_dropped
                    .fetch_add(1, Ordering::Relaxed);
                debug!("channel closed; discarding microphone frame");
            }
        }
    }

    /// Samples waiting for a full block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Converter from the microphone's rate to the capture rate, sized for the
/// worker's drain chunk.
///
/// Built before the worker starts so a rate the resampler cannot handle fails
/// the connect instead of leaving a session with a silent microphone.
pub fn input_converter(device_sample_rate: u32, capture_sample_rate: u32) -> Result<RateConverter> {
    let converter = match RateConverter::new(device_sample_rate, capture_sample_rate, DRAIN_CHUNK) {
        Ok(converter) => converter,
        Err(e) => {
            error!(device_sample_rate, capture_sample_rate, "capture resampler unavailable: {e}");
            return Err(e);
        }
    };
    if !converter.is_passthrough() {
        info!(from = device_sample_rate, to = capture_sample_rate, "capture resampling enabled");
    }
    Ok(converter)
}

/// Everything the capture worker needs.
pub struct CaptureContext {
    pub pipeline: CapturePipeline,
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    /// Microphone rate to capture rate; see [`input_converter`].
    pub converter: RateConverter,
}

/// Blocking worker loop. Runs until `ctx.running` clears.
pub fn run(mut ctx: CaptureContext) {

    // Anything buffered before the session went live is stale.
    let stale = ctx.consumer.clear();
    if stale > 0 {
        debug!(samples = stale, "discarded stale microphone samples");
    }

    let mut raw = vec![0f32; DRAIN_CHUNK];
    info!(rate = ctx.pipeline.sample_rate, "capture worker started");

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(SLEEP_EMPTY);
            continue;
        }
        let converted = ctx.converter.process(&raw[..n]);
        if !converted.is_empty() {
            ctx.pipeline.push_samples(&converted);
        }
    }

    info!(
        pending = ctx.pipeline.pending_len(),
        blocks = ctx.pipeline.diagnostics.blocks_captured.load(Ordering::Relaxed),
        "capture worker stopped"
    );
}
