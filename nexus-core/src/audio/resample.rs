//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! Microphones usually run at 44.1/48 kHz while the session wants 16 kHz in;
//! speakers likewise rarely accept the model's 24 kHz out. `RateConverter`
//! bridges both directions on non-real-time threads, where allocation is
//! allowed. Matching rates short-circuit to a passthrough with no rubato
//! session at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{LiveError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input waiting for a full rubato chunk.
    pending: Vec<f32>,
    chunk_size: usize,
    /// Reused output scratch: `[1][output_frames_max]`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// Returns `LiveError::AudioStream` for a zero rate or chunk size, or if
    /// rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 || chunk_size == 0 {
            return Err(LiveError::AudioStream(format!(
                "cannot convert {from_rate} Hz to {to_rate} Hz in chunks of {chunk_size}"
            )));
        }
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| LiveError::AudioStream(format!("resampler init: {e}")))?;

        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(from_rate, to_rate, chunk_size, "sample-rate conversion enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            scratch,
        })
    }

    /// Feed samples in, get whatever full chunks could be converted.
    ///
    /// The remainder is kept for the next call; passthrough returns the input.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);
        self.drain_full_chunks()
    }

    /// Pad the held-back remainder with silence and convert it.
    ///
    /// Used at the end of a model turn so its last few milliseconds reach the
    /// speaker instead of waiting for the next turn.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.pending.is_empty() {
            return Vec::new();
        }
        self.pending.resize(self.chunk_size, 0.0);
        self.drain_full_chunks()
    }

    /// Silence `flush` appends to complete the held-back chunk, in input samples.
    pub fn flush_padding(&self) -> usize {
        if self.resampler.is_none() || self.pending.is_empty() {
            0
        } else {
            self.chunk_size - self.pending.len()
        }
    }

    /// Samples held back waiting for a full chunk.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn drain_full_chunks(&mut self) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_size {
            let input = &self.pending[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[input], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.pending.drain(..consumed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            RateConverter::new(0, 16_000, 960),
            Err(LiveError::AudioStream(_))
        ));
        assert!(RateConverter::new(48_000, 0, 960).is_err());
        assert!(RateConverter::new(48_000, 16_000, 0).is_err());
    }

    #[test]
    fn matching_rates_pass_through() {
        let mut rc = RateConverter::new(24_000, 24_000, 480).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..100).map(|i| i as f32 * 0.01).collect();
        assert_eq!(rc.process(&samples), samples);
        assert!(rc.flush().is_empty());
    }

    #[test]
    fn downsamples_48k_capture_to_16k() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn upsamples_24k_playback_to_48k() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).unwrap();
        let out = rc.process(&vec![0.0f32; 480]);
        assert!(
            (out.len() as isize - 960).unsigned_abs() <= 20,
            "output len={} expected≈960",
            out.len()
        );
    }

    #[test]
    fn partial_chunks_wait_for_more_input() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert_eq!(rc.pending_len(), 500);
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
        assert_eq!(rc.pending_len(), 40);
    }

    #[test]
    fn flush_releases_the_remainder() {
        let mut rc = RateConverter::new(24_000, 48_000, 480).unwrap();
        assert!(rc.process(&vec![0.1f32; 100]).is_empty());
        assert_eq!(rc.flush_padding(), 380);
        assert!(!rc.flush().is_empty());
        assert_eq!(rc.pending_len(), 0);
        assert_eq!(rc.flush_padding(), 0);
    }

    #[test]
    fn passthrough_needs_no_padding() {
        let mut rc = RateConverter::new(24_000, 24_000, 480).unwrap();
        rc.process(&[0.1f32; 100]);
        assert_eq!(rc.flush_padding(), 0);
    }
}
