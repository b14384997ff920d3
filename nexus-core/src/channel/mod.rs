//! Session channel: the duplex connection to the remote voice model.
//!
//! ## Shape
//!
//! ```text
//!             ChannelHandle                         ChannelEndpoint
//!  engine ──► sender: ChannelSender ──commands──►  commands  ──► transport task ──► wire
//!  engine ◄── events                ◄──events────  events    ◄── transport task ◄── wire
//! ```
//!
//! The engine only ever holds a [`ChannelHandle`], populated once
//! [`ChannelConnector::connect`] resolves. Transports (the WebSocket adapter,
//! test fakes) hold the [`ChannelEndpoint`] and read it through
//! [`ChannelEndpoint::next_command`].
//!
//! Closing travels on its own oneshot, not the frame queue. Once it fires,
//! frames still queued are discarded unsent.

pub mod gemini;
pub mod protocol;

pub use gemini::GeminiLiveConnector;

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::{debug, warn};

use crate::{
    codec::{EncodedFrame, InboundFrame},
    error::Result,
};

/// Session parameters sent when the channel opens.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    /// Model id without the `models/` prefix.
    pub model: String,
    pub voice_name: String,
    pub system_instruction: Option<String>,
}

/// Engine → transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Frame(EncodedFrame),
    Close,
}

/// Transport → engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A chunk of synthesized speech.
    Audio(InboundFrame),
    /// Text emitted alongside or instead of audio.
    Text(String),
    /// The model finished its turn.
    TurnComplete,
    /// The model's turn was cut short by user speech.
    Interrupted,
    /// The channel closed. Terminal.
    Closed { reason: Option<String> },
    /// The channel failed. Terminal.
    Error(String),
}

/// Result of a non-blocking frame send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The transport queue is full; the frame was dropped.
    Dropped,
    /// The transport is gone; the frame was dropped.
    Closed,
}

/// Cloneable, non-blocking outbound half.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    commands: mpsc::Sender<ChannelCommand>,
}

impl ChannelSender {
    pub fn new(commands: mpsc::Sender<ChannelCommand>) -> Self {
        Self { commands }
    }

    /// Queue a frame without waiting. Capture order is preserved because the
    /// queue is FIFO and there is a single capture worker.
    pub fn try_send_frame(&self, frame: EncodedFrame) -> SendOutcome {
        match self.commands.try_send(ChannelCommand::Frame(frame)) {
            Ok(()) => SendOutcome::Sent,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped,
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// The engine's side of an open channel.
#[derive(Debug)]
pub struct ChannelHandle {
    pub sender: ChannelSender,
    pub events: mpsc::Receiver<ChannelEvent>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// The transport's side of an open channel.
#[derive(Debug)]
pub struct ChannelEndpoint {
    pub commands: mpsc::Receiver<ChannelCommand>,
    pub events: mpsc::Sender<ChannelEvent>,
    close_rx: oneshot::Receiver<()>,
    close_seen: bool,
}

impl ChannelEndpoint {
    /// Next thing the transport should do.
    ///
    /// A close request wins over queued frames: it yields `Close` once, after
    /// discarding every frame still in the queue, and `None` from then on.
    /// Dropping the handle without closing counts as a close request. `None`
    /// also means the sender side is gone.
    ///
    /// Cancel-safe, so it can sit in a `select!`.
    pub async fn next_command(&mut self) -> Option<ChannelCommand> {
        if self.close_seen {
            return None;
        }
        tokio::select! {
            biased;
            _ = &mut self.close_rx => {
                self.close_seen = true;
                let mut discarded = 0usize;
                while let Ok(command) = self.commands.try_recv() {
                    if matches!(command, ChannelCommand::Frame(_)) {
                        discarded += 1;
                    }
                }
                if discarded > 0 {
                    debug!(discarded, "dropping queued frames on close");
                }
                self.commands.close();
                Some(ChannelCommand::Close)
            }
            command = self.commands.recv() => command,
        }
    }
}

impl ChannelHandle {
    /// Create a connected handle/endpoint pair with `capacity` slots each way.
    pub fn pair(capacity: usize) -> (ChannelHandle, ChannelEndpoint) {
        let (command_tx, command_rx) = mpsc::channel(capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = oneshot::channel();
        (
            ChannelHandle {
                sender: ChannelSender::new(command_tx),
                events: event_rx,
                close_tx: Some(close_tx),
            },
            ChannelEndpoint {
                commands: command_rx,
                events: event_tx,
                close_rx,
                close_seen: false,
            },
        )
    }

    /// Tell the transport to stop sending and close. Frames it has not sent
    /// yet are discarded. Returns `false` if the transport is already gone.
    pub fn request_close(&mut self) -> bool {
        match self.close_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Ask the transport to close and wait for it to confirm.
    ///
    /// Events arriving meanwhile are discarded. Returns the close reason if
    /// the transport reported one; gives up after `timeout`.
    pub async fn close(mut self, timeout: Duration) -> Option<String> {
        if !self.request_close() {
            return None;
        }
        let wait = async {
            while let Some(event) = self.events.recv().await {
                match event {
                    ChannelEvent::Closed { reason } => return reason,
                    ChannelEvent::Error(e) => {
                        debug!("channel error while closing: {e}");
                        return Some(e);
                    }
                    _ => {}
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(reason) => reason,
            Err(_) => {
                warn!(?timeout, "session channel did not confirm close in time");
                None
            }
        }
    }
}

/// Opens session channels.
pub trait ChannelConnector: Send + Sync + 'static {
    /// Open a channel. Resolves once the remote side accepted the setup.
    ///
    /// # Errors
    /// `LiveError::ChannelOpen` on any failure to establish the session.
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, Result<ChannelHandle>>;
}
