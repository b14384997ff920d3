//! `LiveEngine`: the live session controller.
//!
//! ## Lifecycle
//!
//! ```text
//!            connect()                 attempt ok
//!   Idle ─────────────────► Connecting ───────────► Connected
//!    ▲  ▲                       │  attempt failed       │  │
//!    │  │ disconnect()/reset()  ▼                       │  │ channel error
//!    │  └──────────────────── Error ◄──────────────────────┘
//!    │                                                  │
//!    └──────────── disconnect() / channel closed ───────┘
//! ```
//!
//! ## Threading
//!
//! All state transitions happen inside one actor task ([`actor`]). Public
//! methods send a command and await its reply, and channel events are handled
//! by the same task, so commands and inbound audio are processed strictly one
//! at a time. The only state touched outside the actor is atomic: the mute
//! flag, the volume meter, and the diagnostics counters.

pub mod actor;
pub mod diagnostics;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::{
    audio::AudioBackend,
    capture::VolumeLevel,
    channel::ChannelConnector,
    codec::{CAPTURE_BLOCK_SIZE, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE},
    error::{LiveError, Result},
    ipc::events::{AudioActivityEvent, SessionState, SessionStatusEvent},
};

use self::{
    actor::EngineCommand,
    diagnostics::{DiagnosticsSnapshot, SessionDiagnostics},
};

/// Broadcast channel capacity for status and activity events.
const BROADCAST_CAP: usize = 256;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// Configuration for `LiveEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate microphone audio is sent at (Hz). Default: 16000.
    pub capture_sample_rate: u32,
    /// Rate of synthesized speech (Hz). Default: 24000.
    pub playback_sample_rate: u32,
    /// Channels in inbound speech frames. Default: 1.
    pub playback_channels: u16,
    /// Samples per outbound block. Default: 4096.
    pub capture_block_size: usize,
    /// Live model id without the `models/` prefix.
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
    /// Exact device names; `None` uses the system default.
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// Depth of the engine's command queue.
    pub command_capacity: usize,
    /// How long `disconnect()` waits for the channel to confirm closure.
    pub close_timeout: Duration,
    /// Level-meter refresh interval.
    pub meter_interval: Duration,
    /// Playback backlog above which a warning is logged.
    pub max_playback_backlog: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            playback_channels: 1,
            capture_block_size: CAPTURE_BLOCK_SIZE,
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: None,
            preferred_input_device: None,
            preferred_output_device: None,
            command_capacity: 32,
            close_timeout: Duration::from_secs(3),
            meter_interval: Duration::from_millis(33),
            max_playback_backlog: Duration::from_secs(60),
        }
    }
}

/// State shared between the engine handle and its actor.
pub(crate) struct Shared {
    /// Written only by the actor.
    status: Mutex<SessionState>,
    pub(crate) muted: Arc<AtomicBool>,
    pub(crate) volume: VolumeLevel,
    pub(crate) diagnostics: Arc<SessionDiagnostics>,
    activity_seq: AtomicU64,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    activity_tx: broadcast::Sender<AudioActivityEvent>,
}

impl Shared {
    fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Mutex::new(SessionState::Idle),
            muted: Arc::new(AtomicBool::new(false)),
            volume: VolumeLevel::new(),
            diagnostics: Arc::new(SessionDiagnostics::default()),
            activity_seq: AtomicU64::new(0),
            status_tx,
            activity_tx,
        }
    }

    pub(crate) fn status(&self) -> SessionState {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: SessionState, detail: Option<String>) {
        *self.status.lock() = status;
        info!(%status, detail = detail.as_deref().unwrap_or(""), "session status changed");
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }

    /// Broadcast the current meter reading.
    pub(crate) fn publish_activity(&self) {
        let seq = self.activity_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.activity_tx.send(AudioActivityEvent {
            seq,
            volume: self.volume.get(),
            muted: self.muted.load(Ordering::Acquire),
        });
    }
}

/// Handle to a running live engine. Cheap to clone; the actor shuts down
/// (tearing down any session) once every clone is dropped.
#[derive(Clone)]
pub struct LiveEngine {
    commands: mpsc::Sender<EngineCommand>,
    shared: Arc<Shared>,
    config: Arc<EngineConfig>,
}

impl LiveEngine {
    /// Start the engine's actor on the current Tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(Shared::new());
        let (commands, rx) = mpsc::channel(config.command_capacity.max(1));

        let actor = actor::Actor::new(
            Arc::clone(&config),
            backend,
            connector,
            Arc::clone(&shared),
        );
        tokio::spawn(actor::run(actor, rx));

        Self {
            commands,
            shared,
            config,
        }
    }

    /// Open a session: microphone, speaker, then the channel.
    ///
    /// Resolves once the session is `Connected`.
    ///
    /// # Errors
    /// - `LiveError::AlreadyActive` while connecting or connected (no second
    ///   channel is opened).
    /// - `LiveError::Cancelled` if `disconnect()`/`reset()` interrupted it.
    /// - Device or channel errors; the engine is then in `Error` with
    ///   everything released.
    pub async fn connect(&self) -> Result<()> {
        self.request(EngineCommand::Connect).await?
    }

    /// Tear down whatever is active and return to `Idle`. Valid in every state.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(EngineCommand::Disconnect).await
    }

    /// Flip the microphone mute flag. Returns the new value.
    ///
    /// # Errors
    /// `LiveError::NotConnected` unless a session is connected.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(EngineCommand::ToggleMute).await?
    }

    /// Leave `Error` (or any other state) for `Idle`, releasing everything.
    pub async fn reset(&self) -> Result<()> {
        self.request(EngineCommand::Reset).await
    }

    pub fn status(&self) -> SessionState {
        self.shared.status()
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Latest microphone level in [0, 100].
    pub fn volume(&self) -> f32 {
        self.shared.volume.get()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<AudioActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    /// Counters for the current (or last) session.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| LiveError::EngineStopped)?;
        rx.await.map_err(|_| LiveError::EngineStopped)
    }
}
