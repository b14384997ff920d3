use thiserror::Error;

use crate::codec::DecodeError;

/// All errors produced by nexus-core.
#[derive(Debug, Error)]
pub enum LiveError {
    /// Microphone could not be opened (permission denied, device busy, ...).
    #[error("microphone unavailable: {0}")]
    Microphone(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio output error: {0}")]
    AudioOutput(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("session channel failed to open: {0}")]
    ChannelOpen(String),

    #[error("session channel error: {0}")]
    ChannelRuntime(String),

    #[error("inbound audio frame rejected: {0}")]
    Decode(#[from] DecodeError),

    #[error("a live session is already active")]
    AlreadyActive,

    #[error("no live session is connected")]
    NotConnected,

    #[error("connect attempt was cancelled")]
    Cancelled,

    #[error("live engine has shut down")]
    EngineStopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LiveError>;
