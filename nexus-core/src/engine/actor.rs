//! The engine's actor task.
//!
//! ## Loop
//!
//! ```text
//! Idle / Error  : wait for a command
//! Connecting    : select { command, connect attempt }
//! Connected     : select { command, channel event }
//! ```
//!
//! Each phase variant owns exactly the resources valid in it, so an `Idle`
//! engine cannot be holding a microphone. Dropping a `Connecting` attempt
//! drops whatever it had acquired so far, which closes those devices.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::future::BoxFuture;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use super::{EngineConfig, Shared};
use crate::{
    audio::{AudioBackend, InputRequest, InputStreamHandle, OutputRequest, OutputStreamHandle},
    buffering::{create_capture_ring, create_playback_ring},
    capture::{self, CaptureContext, CapturePipeline},
    channel::{ChannelConnector, ChannelEvent, ChannelHandle, SessionSetup},
    codec::{decode_frame, InboundFrame},
    error::{LiveError, Result},
    ipc::events::SessionState,
    playback::{AudioClock, PlaybackScheduler, RingSink},
};

/// Most output devices run at or below this rate; the playback ring is sized
/// for it before the device reports its actual rate.
const RING_SIZING_RATE: u32 = 48_000;

pub(crate) enum EngineCommand {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    ToggleMute(oneshot::Sender<Result<bool>>),
    Reset(oneshot::Sender<()>),
}

struct PendingConnect {
    session_id: u64,
    attempt: BoxFuture<'static, Result<ActiveSession>>,
    reply: oneshot::Sender<Result<()>>,
}

enum Phase {
    Idle,
    Connecting(PendingConnect),
    Connected(ActiveSession),
    Error { reason: String },
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting(_) => SessionState::Connecting,
            Phase::Connected(_) => SessionState::Connected,
            Phase::Error { .. } => SessionState::Error,
        }
    }
}

/// Everything needed to open a session, cloned into each attempt.
#[derive(Clone)]
struct SessionFactory {
    config: Arc<EngineConfig>,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn ChannelConnector>,
    shared: Arc<Shared>,
}

pub(crate) struct Actor {
    phase: Phase,
    factory: SessionFactory,
    next_session_id: u64,
}

enum Step {
    Command(Option<EngineCommand>),
    Attempt(Result<ActiveSession>),
    Channel(Option<ChannelEvent>),
}

impl Actor {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn ChannelConnector>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            phase: Phase::Idle,
            factory: SessionFactory {
                config,
                backend,
                connector,
                shared,
            },
            next_session_id: 1,
        }
    }

    fn shared(&self) -> &Shared {
        &self.factory.shared
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect(reply) => {
                if matches!(self.phase, Phase::Connecting(_) | Phase::Connected(_)) {
                    warn!(state = %self.phase.state(), "connect rejected: session already active");
                    let _ = reply.send(Err(LiveError::AlreadyActive));
                } else {
                    self.begin_connect(reply);
                }
            }
            EngineCommand::Disconnect(reply) => {
                self.teardown_to_idle().await;
                let _ = reply.send(());
            }
            EngineCommand::Reset(reply) => {
                if let Phase::Error { reason } = &self.phase {
                    debug!(%reason, "clearing error state");
                }
                self.teardown_to_idle().await;
                let _ = reply.send(());
            }
            EngineCommand::ToggleMute(reply) => {
                let result = match &self.phase {
                    Phase::Connected(session) => {
                        let muted = !self.shared().muted.fetch_xor(true, Ordering::AcqRel);
                        info!(session_id = session.id, muted, "microphone mute toggled");
                        Ok(muted)
                    }
                    _ => Err(LiveError::NotConnected),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn begin_connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let shared = self.shared();
        shared.muted.store(false, Ordering::Release);
        shared.volume.reset();
        shared.diagnostics.reset();

        info!(session_id, "connecting live session");
        self.phase = Phase::Connecting(PendingConnect {
            session_id,
            attempt: Box::pin(open_session(self.factory.clone(), session_id)),
            reply,
        });
        self.shared().set_status(SessionState::Connecting, None);
    }

    fn finish_connect(&mut self, result: Result<ActiveSession>) {
        let Phase::Connecting(pending) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };

        match result {
            Ok(session) => {
                info!(session_id = pending.session_id, "live session connected");
                self.phase = Phase::Connected(session);
                self.shared().set_status(SessionState::Connected, None);
                let _ = pending.reply.send(Ok(()));
            }
            Err(e) => {
                // The attempt future has returned, so every handle it held is
                // already closed.
                error!(session_id = pending.session_id, "live session failed to open: {e}");
                let reason = e.to_string();
                self.phase = Phase::Error {
                    reason: reason.clone(),
                };
                self.shared().set_status(SessionState::Error, Some(reason));
                let _ = pending.reply.send(Err(e));
            }
        }
    }

    async fn handle_channel_event(&mut self, event: Option<ChannelEvent>) {
        let Phase::Connected(session) = &mut self.phase else {
            return;
        };

        match event {
            Some(ChannelEvent::Audio(frame)) => session.play(&frame),
            Some(ChannelEvent::Text(text)) => {
                info!(session_id = session.id, %text, "model text");
            }
            Some(ChannelEvent::TurnComplete) => {
                debug!(session_id = session.id, "model turn complete");
                session.scheduler.flush();
            }
            Some(ChannelEvent::Interrupted) => {
                debug!(session_id = session.id, "model turn interrupted");
            }
            Some(ChannelEvent::Closed { reason }) => {
                info!(session_id = session.id, reason = ?reason, "session channel closed by remote");
                if let Phase::Connected(session) = std::mem::replace(&mut self.phase, Phase::Idle) {
                    session.shutdown(None).await;
                }
                self.shared().set_status(SessionState::Idle, reason);
            }
            None => {
                warn!(session_id = session.id, "session channel ended without a close event");
                if let Phase::Connected(session) = std::mem::replace(&mut self.phase, Phase::Idle) {
                    session.shutdown(None).await;
                }
                self.shared().set_status(SessionState::Idle, None);
            }
            Some(ChannelEvent::Error(reason)) => {
                error!(session_id = session.id, %reason, "session channel failed");
                if let Phase::Connected(session) = std::mem::replace(&mut self.phase, Phase::Idle) {
                    session.shutdown(None).await;
                }
                self.phase = Phase::Error {
                    reason: reason.clone(),
                };
                self.shared().set_status(SessionState::Error, Some(reason));
            }
        }
    }

    /// Release everything held in the current phase and publish `Idle`.
    async fn teardown_to_idle(&mut self) {
        let previous = std::mem::replace(&mut self.phase, Phase::Idle);
        let was = previous.state();

        match previous {
            Phase::Idle => return,
            Phase::Connecting(pending) => {
                info!(session_id = pending.session_id, "cancelling connect attempt");
                drop(pending.attempt);
                let _ = pending.reply.send(Err(LiveError::Cancelled));
            }
            Phase::Connected(session) => {
                let timeout = self.factory.config.close_timeout;
                session.shutdown(Some(timeout)).await;
            }
            Phase::Error { .. } => {}
        }

        debug!(from = %was, "session torn down");
        self.shared().set_status(SessionState::Idle, None);
    }
}

/// Drive the actor until every engine handle is dropped.
pub(crate) async fn run(mut actor: Actor, mut commands: mpsc::Receiver<EngineCommand>) {
    loop {
        let step = match &mut actor.phase {
            Phase::Connecting(pending) => tokio::select! {
                command = commands.recv() => Step::Command(command),
                result = &mut pending.attempt => Step::Attempt(result),
            },
            Phase::Connected(session) => tokio::select! {
                command = commands.recv() => Step::Command(command),
                event = session.channel.events.recv() => Step::Channel(event),
            },
            Phase::Idle | Phase::Error { .. } => Step::Command(commands.recv().await),
        };

        match step {
            Step::Command(Some(command)) => actor.handle_command(command).await,
            Step::Command(None) => break,
            Step::Attempt(result) => actor.finish_connect(result),
            Step::Channel(event) => actor.handle_channel_event(event).await,
        }
    }

    debug!("engine handles dropped; shutting down");
    actor.teardown_to_idle().await;
}

/// A connected session and every resource it owns.
struct ActiveSession {
    id: u64,
    microphone: InputStreamHandle,
    speaker: OutputStreamHandle,
    channel: ChannelHandle,
    scheduler: PlaybackScheduler,
    capture_running: RunningFlag,
    capture_worker: Option<JoinHandle<()>>,
    meter: Option<JoinHandle<()>>,
    playback_rate: u32,
    playback_channels: u16,
    shared: Arc<Shared>,
}

/// Acquire the microphone, the speaker and the channel, in that order, then
/// start the capture worker and the level meter.
///
/// Every handle is a local until the end, so an error or a dropped attempt
/// releases whatever was acquired.
async fn open_session(factory: SessionFactory, id: u64) -> Result<ActiveSession> {
    let SessionFactory {
        config,
        backend,
        connector,
        shared,
    } = factory;

    let (mic_producer, mic_consumer) = create_capture_ring();
    let microphone = backend.open_input(
        &InputRequest {
            sample_rate: config.capture_sample_rate,
            preferred_device: config.preferred_input_device.clone(),
        },
        mic_producer,
    )?;
    info!(session_id = id, sample_rate = microphone.sample_rate, "microphone open");
    let capture_converter =
        capture::input_converter(microphone.sample_rate, config.capture_sample_rate)?;

    let backlog_secs = config.max_playback_backlog.as_secs_f64();
    let (speaker_producer, speaker_consumer) = create_playback_ring(
        RING_SIZING_RATE.max(config.playback_sample_rate),
        backlog_secs,
    );
    let speaker = backend.open_output(
        &OutputRequest {
            sample_rate: config.playback_sample_rate,
            preferred_device: config.preferred_output_device.clone(),
        },
        speaker_consumer,
    )?;
    info!(session_id = id, sample_rate = speaker.sample_rate, "speaker open");

    let sink = RingSink::new(
        speaker_producer,
        config.playback_sample_rate,
        speaker.sample_rate,
        Arc::clone(&shared.diagnostics),
    )?;
    let clock: Arc<dyn AudioClock> = Arc::new(speaker.clock.clone());
    let scheduler = PlaybackScheduler::new(clock, Box::new(sink), backlog_secs);

    let channel = connector
        .connect(SessionSetup {
            model: config.model.clone(),
            voice_name: config.voice_name.clone(),
            system_instruction: config.system_instruction.clone(),
        })
        .await?;

    // No await past this point: the workers start only once nothing can cancel.
    let capture_running = RunningFlag::new();
    let pipeline = CapturePipeline::new(
        channel.sender.clone(),
        Arc::clone(&shared.muted),
        shared.volume.clone(),
        Arc::clone(&shared.diagnostics),
        config.capture_block_size,
        config.capture_sample_rate,
    );
    let ctx = CaptureContext {
        pipeline,
        consumer: mic_consumer,
        running: capture_running.shared(),
        converter: capture_converter,
    };
    let capture_worker = tokio::task::spawn_blocking(move || capture::run(ctx));
    let meter = spawn_meter(Arc::clone(&shared), config.meter_interval);

    Ok(ActiveSession {
        id,
        microphone,
        speaker,
        channel,
        scheduler,
        capture_running,
        capture_worker: Some(capture_worker),
        meter: Some(meter),
        playback_rate: config.playback_sample_rate,
        playback_channels: config.playback_channels,
        shared,
    })
}

fn spawn_meter(shared: Arc<Shared>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            shared.publish_activity();
        }
    })
}

impl ActiveSession {
    /// Decode an inbound frame and put it on the playback timeline.
    /// A bad frame is dropped; the session carries on.
    fn play(&mut self, frame: &InboundFrame) {
        let diagnostics = &self.shared.diagnostics;
        diagnostics.inbound_frames.fetch_add(1, Ordering::Relaxed);

        match decode_frame(frame, self.playback_rate, self.playback_channels) {
            Ok(buffer) => {
                self.scheduler.schedule(&buffer);
                diagnostics
                    .buffers_scheduled
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(session_id = self.id, "dropping inbound frame: {}", LiveError::from(e));
            }
        }
    }

    /// Stop capture, release both devices, stop the meter, then close the
    /// channel (waiting up to `close_timeout` when given).
    async fn shutdown(mut self, close_timeout: Option<std::time::Duration>) {
        self.capture_running.stop();
        if let Some(worker) = self.capture_worker.take() {
            if let Err(e) = worker.await {
                error!(session_id = self.id, "capture worker panicked: {e}");
            }
        }

        self.microphone.close();
        self.speaker.close();

        if let Some(meter) = self.meter.take() {
            meter.abort();
        }

        match close_timeout {
            Some(timeout) => {
                if let Some(reason) = self.channel.close(timeout).await {
                    debug!(session_id = self.id, %reason, "channel close reason");
                }
            }
            None => drop(self.channel),
        }

        self.shared.volume.reset();
        self.shared.publish_activity();

        let snap = self.shared.diagnostics.snapshot();
        info!(
            session_id = self.id,
            blocks_captured = snap.blocks_captured,
            blocks_muted = snap.blocks_muted,
            frames_sent = snap.frames_sent,
            frames_dropped = snap.frames_dropped,
            inbound_frames = snap.inbound_frames,
            decode_errors = snap.decode_errors,
            buffers_scheduled = snap.buffers_scheduled,
            playback_overflow_samples = snap.playback_overflow_samples,
            "session stopped, diagnostics"
        );
    }
}

/// Capture worker's running flag; clears itself when dropped so the worker
/// never outlives its session.
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    fn stop(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.stop();
    }
}
