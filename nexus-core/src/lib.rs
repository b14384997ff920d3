//! # nexus-core
//!
//! Real-time voice session SDK: full-duplex audio with a remote voice model.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC ring → capture worker (spawn_blocking)
//!                               │ 4096-sample blocks @ 16 kHz
//!                          encode_block ── muted? ──► dropped (level still metered)
//!                               │
//!                          ChannelSender::try_send_frame ──► transport task ──► wire
//!
//! wire ──► transport task ──► ChannelEvent::Audio ──► engine actor
//!                                                       │ decode_frame
//!                                                  PlaybackScheduler
//!                                                       │ RingSink (resample)
//!                                                  SPSC ring → Speaker
//! ```
//!
//! The audio callbacks only touch lock-free rings. Session state lives in one
//! actor task; see [`engine`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod channel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;

// Convenience re-exports for downstream crates
pub use audio::{
    device::{list_input_devices, list_output_devices, DeviceInfo},
    AudioBackend, CpalBackend,
};
pub use channel::{ChannelConnector, GeminiLiveConnector};
pub use engine::{diagnostics::DiagnosticsSnapshot, EngineConfig, LiveEngine};
pub use error::{LiveError, Result};
pub use ipc::events::{AudioActivityEvent, SessionState, SessionStatusEvent};
