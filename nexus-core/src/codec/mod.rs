//! Wire codec for session audio.
//!
//! Outbound microphone blocks become base64-framed 16-bit little-endian PCM
//! ([`encode_block`]); inbound synthesized speech goes the other way
//! ([`decode_frame`]). Both directions are pure functions.

pub mod pcm;

pub use pcm::{
    decode_frame, encode_block, pcm_mime_type, volume_level, DecodeError, DecodedBuffer,
    EncodedFrame, InboundFrame,
};

/// Sample rate the remote model expects for microphone audio (Hz).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech returned by the remote model (Hz).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured block, matching the browser's script-processor size.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;
