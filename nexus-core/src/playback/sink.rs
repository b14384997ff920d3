//! Ring-buffer sink feeding the speaker callback.
//!
//! The ring already holds everything scheduled but not yet rendered, so the
//! scheduler's `start` is implicit: while the cursor is ahead of the clock it
//! equals the end of the queued audio, and once the clock overtakes it the
//! ring is empty and appended audio plays immediately. Pushing in order is
//! therefore enough to realise the schedule.

use std::sync::{atomic::Ordering, Arc};

use tracing::warn;

use super::PlaybackSink;
use crate::{
    audio::resample::RateConverter,
    buffering::{AudioProducer, Producer},
    codec::DecodedBuffer,
    engine::diagnostics::SessionDiagnostics,
    error::Result,
};

/// 20 ms at 24 kHz per conversion step.
const CONVERTER_CHUNK: usize = 480;

pub struct RingSink {
    producer: AudioProducer,
    converter: RateConverter,
    source_rate: u32,
    diagnostics: Arc<SessionDiagnostics>,
}

impl RingSink {
    /// `source_rate` is the decoded speech rate, `device_rate` the speaker's.
    pub fn new(
        producer: AudioProducer,
        source_rate: u32,
        device_rate: u32,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Result<Self> {
        Ok(Self {
            producer,
            converter: RateConverter::new(source_rate, device_rate, CONVERTER_CHUNK)?,
            source_rate,
            diagnostics,
        })
    }

    fn push(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let written = self.producer.push_slice(samples);
        if written < samples.len() {
            let dropped = samples.len() - written;
            self.diagnostics
                .playback_overflow_samples
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(dropped, "playback ring full; dropping samples past the backlog limit");
        }
    }
}

impl PlaybackSink for RingSink {
    fn enqueue(&mut self, _start: f64, buffer: &DecodedBuffer) {
        let converted = if buffer.channels > 1 {
            let mono = downmix(&buffer.samples, buffer.channels as usize);
            self.converter.process(&mono)
        } else {
            self.converter.process(&buffer.samples)
        };
        self.push(&converted);
    }

    fn flush(&mut self) -> f64 {
        let padding = self.converter.flush_padding();
        let tail = self.converter.flush();
        self.push(&tail);
        padding as f64 / self.source_rate as f64
    }
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
