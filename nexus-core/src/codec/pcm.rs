//! 16-bit PCM encode/decode with base64 transport framing.
//!
//! ## Quantisation
//!
//! ```text
//! f32 [-1, 1] ──clamp──► × 32768 ──round──► saturate i16 ──► LE bytes ──► base64
//! base64 ──► LE bytes ──► i16 ──► ÷ 32768 ──► f32 [-1, 1)
//! ```
//!
//! Scaling by 32768 on both sides keeps the round-trip error within half a
//! quantisation step everywhere except at +1.0, which saturates to 32767 and
//! lands exactly one step short.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BYTES_PER_SAMPLE: usize = 2;
const I16_SCALE: f32 = 32_768.0;

/// Reasons an inbound frame cannot be turned into playable audio.
///
/// None of these are fatal to a session: the caller drops the frame and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame carries no audio")]
    Empty,

    #[error("frame payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("payload of {len} bytes is not a whole number of 16-bit samples")]
    Misaligned { len: usize },

    #[error("invalid stream format: {0}")]
    InvalidFormat(String),
}

/// One microphone block encoded for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    /// Base64 of little-endian i16 samples.
    pub data: String,
    /// Codec tag, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// A chunk of synthesized speech as delivered by the session channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Base64 of little-endian i16 samples.
    pub data: String,
    /// Codec tag reported by the server, if any.
    pub mime_type: Option<String>,
}

impl InboundFrame {
    pub fn new(data: impl Into<String>, mime_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            mime_type,
        }
    }
}

/// Decoded speech ready for the playback scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    /// Interleaved f32 samples in [-1.0, 1.0).
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// MIME tag for raw 16-bit PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Quantise a block of f32 samples and frame it as base64.
///
/// Never fails: out-of-range samples are clamped and NaN becomes silence.
pub fn encode_block(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    EncodedFrame {
        data: STANDARD.encode(&bytes),
        mime_type: pcm_mime_type(sample_rate),
    }
}

/// Reverse of [`encode_block`] for an inbound frame.
///
/// # Errors
/// - [`DecodeError::Empty`] for an empty payload
/// - [`DecodeError::InvalidEncoding`] if the payload is not base64
/// - [`DecodeError::Misaligned`] if the byte count is odd or does not split
///   evenly across `channels`
/// - [`DecodeError::InvalidFormat`] for a zero sample rate or channel count
pub fn decode_frame(
    frame: &InboundFrame,
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedBuffer, DecodeError> {
    if sample_rate == 0 || channels == 0 {
        return Err(DecodeError::InvalidFormat(format!(
            "sample_rate={sample_rate} channels={channels}"
        )));
    }

    let bytes = STANDARD
        .decode(frame.data.trim())
        .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;

    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let frame_width = BYTES_PER_SAMPLE * channels as usize;
    if bytes.len() % frame_width != 0 {
        return Err(DecodeError::Misaligned { len: bytes.len() });
    }

    let samples = bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / I16_SCALE)
        .collect();

    Ok(DecodedBuffer {
        samples,
        sample_rate,
        channels,
    })
}

/// UI loudness metric in [0, 100]: mean absolute amplitude scaled by 500.
pub fn volume_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples
        .iter()
        .map(|s| if s.is_nan() { 0.0 } else { s.abs() })
        .sum();
    ((sum / samples.len() as f32) * 500.0).min(100.0)
}

fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * I16_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn inbound(frame: EncodedFrame) -> InboundFrame {
        InboundFrame::new(frame.data, Some(frame.mime_type))
    }

    #[test]
    fn silence_round_trips_exactly() {
        let block = vec![0.0f32; 4096];
        let decoded = decode_frame(&inbound(encode_block(&block, 16_000)), 16_000, 1)
            .expect("decode silence");
        assert_eq!(decoded.samples.len(), 4096);
        assert!(decoded.samples.iter().all(|&s| s == 0.0));
        assert_abs_diff_eq!(decoded.duration_secs(), 0.256, epsilon = 1e-9);
    }

    #[test]
    fn round_trip_error_is_within_one_quantisation_step() {
        let block: Vec<f32> = (0..2048)
            .map(|i| ((i as f32 * 0.731).sin() * 1.0007).clamp(-1.0, 1.0))
            .chain([1.0, -1.0, 0.5, -0.5, 1.0 / 65_536.0])
            .collect();
        let decoded =
            decode_frame(&inbound(encode_block(&block, 16_000)), 16_000, 1).expect("decode");
        for (orig, got) in block.iter().zip(&decoded.samples) {
            assert!(
                (orig - got).abs() <= 1.0 / 32_768.0,
                "sample {orig} decoded as {got}"
            );
        }
    }

    #[test]
    fn out_of_range_and_nan_samples_are_sanitised() {
        let frame = encode_block(&[4.0, -4.0, f32::NAN], 16_000);
        let decoded = decode_frame(&inbound(frame), 16_000, 1).expect("decode");
        assert_abs_diff_eq!(decoded.samples[0], 32_767.0 / 32_768.0);
        assert_abs_diff_eq!(decoded.samples[1], -1.0);
        assert_eq!(decoded.samples[2], 0.0);
    }

    #[test]
    fn encoded_frame_is_little_endian_base64_with_rate_tag() {
        let frame = encode_block(&[0.5, -0.5], 16_000);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let bytes = STANDARD.decode(&frame.data).expect("valid base64");
        assert_eq!(bytes, vec![0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let err = decode_frame(&InboundFrame::new("", None), 24_000, 1).unwrap_err();
        assert_eq!(err, DecodeError::Empty);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        let data = STANDARD.encode([1u8, 2, 3]);
        let err = decode_frame(&InboundFrame::new(data, None), 24_000, 1).unwrap_err();
        assert_eq!(err, DecodeError::Misaligned { len: 3 });
    }

    #[test]
    fn stereo_payload_must_hold_whole_frames() {
        let data = STANDARD.encode([0u8; 6]);
        let err = decode_frame(&InboundFrame::new(data, None), 24_000, 2).unwrap_err();
        assert_eq!(err, DecodeError::Misaligned { len: 6 });

        let data = STANDARD.encode([0u8; 8]);
        let ok = decode_frame(&InboundFrame::new(data, None), 24_000, 2).expect("two frames");
        assert_eq!(ok.frames(), 2);
    }

    #[test]
    fn garbage_payload_is_an_encoding_error() {
        let err = decode_frame(&InboundFrame::new("@@not base64@@", None), 24_000, 1)
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEncoding(_)));
    }

    #[test]
    fn duration_follows_declared_rate() {
        let frame = encode_block(&vec![0.1; 12_000], 24_000);
        let decoded = decode_frame(&inbound(frame), 24_000, 1).expect("decode");
        assert_abs_diff_eq!(decoded.duration_secs(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn volume_level_scales_and_saturates() {
        assert_eq!(volume_level(&[]), 0.0);
        assert_abs_diff_eq!(volume_level(&[0.1, -0.1]), 50.0, epsilon = 1e-4);
        assert_eq!(volume_level(&[0.9, -0.9]), 100.0);
        assert_abs_diff_eq!(volume_level(&[f32::NAN, 0.2]), 50.0, epsilon = 1e-4);
    }
}
