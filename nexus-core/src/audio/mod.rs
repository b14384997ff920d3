//! Audio device seam.
//!
//! The live engine never touches cpal directly. It asks an [`AudioBackend`]
//! for a microphone stream that writes into a ring producer and a speaker
//! stream that reads from a ring consumer, and gets back owning handles.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). [`CpalBackend`] therefore builds each stream on a dedicated thread
//! that parks until its handle is closed, then drops the stream on that same
//! thread. The handles themselves are `Send` and can live inside the engine's
//! async actor.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
mod stream;

#[cfg(feature = "audio-cpal")]
pub use stream::CpalBackend;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    buffering::{AudioConsumer, AudioProducer},
    error::Result,
    playback::AudioClock,
};

/// Parameters for opening a microphone.
#[derive(Debug, Clone)]
pub struct InputRequest {
    /// Rate the session wants; the device may run at another rate.
    pub sample_rate: u32,
    /// Exact device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

/// Parameters for opening a speaker.
#[derive(Debug, Clone)]
pub struct OutputRequest {
    pub sample_rate: u32,
    pub preferred_device: Option<String>,
}

/// Releases an open device. Implementations must tolerate repeated calls.
pub trait DeviceGuard: Send {
    fn close(&mut self);
}

/// Contract for audio I/O providers (cpal, test fakes, ...).
pub trait AudioBackend: Send + Sync + 'static {
    /// Open a microphone that pushes mono f32 samples into `producer` at the
    /// returned handle's `sample_rate`.
    ///
    /// # Errors
    /// `LiveError::Microphone` / `LiveError::NoDefaultInputDevice` when no
    /// microphone can be acquired.
    fn open_input(&self, request: &InputRequest, producer: AudioProducer)
        -> Result<InputStreamHandle>;

    /// Open a speaker that pulls mono f32 samples from `consumer`, rendering
    /// silence whenever the ring runs dry.
    fn open_output(
        &self,
        request: &OutputRequest,
        consumer: AudioConsumer,
    ) -> Result<OutputStreamHandle>;
}

/// Owning handle to an open microphone.
pub struct InputStreamHandle {
    /// Actual device rate (Hz).
    pub sample_rate: u32,
    guard: Option<Box<dyn DeviceGuard>>,
}

impl InputStreamHandle {
    pub fn new(sample_rate: u32, guard: Box<dyn DeviceGuard>) -> Self {
        Self {
            sample_rate,
            guard: Some(guard),
        }
    }

    /// Stop the microphone. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for InputStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owning handle to an open speaker plus its clock.
pub struct OutputStreamHandle {
    /// Actual device rate (Hz).
    pub sample_rate: u32,
    pub clock: OutputClock,
    guard: Option<Box<dyn DeviceGuard>>,
}

impl OutputStreamHandle {
    pub fn new(sample_rate: u32, clock: OutputClock, guard: Box<dyn DeviceGuard>) -> Self {
        Self {
            sample_rate,
            clock,
            guard: Some(guard),
        }
    }

    /// Stop the speaker. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for OutputStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Output-device clock: frames rendered so far (silence included), divided
/// by the device rate.
///
/// The render callback calls [`OutputClock::advance`]; the scheduler reads
/// [`AudioClock::now`]. Cloning shares the counter.
#[derive(Debug, Clone)]
pub struct OutputClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl OutputClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioClock for OutputClock {
    fn now(&self) -> f64 {
        self.frames_rendered() as f64 / self.sample_rate as f64
    }
}

/// Stub when the `audio-cpal` feature is disabled: every open fails.
#[cfg(not(feature = "audio-cpal"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[cfg(not(feature = "audio-cpal"))]
impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    fn open_input(&self, _: &InputRequest, _: AudioProducer) -> Result<InputStreamHandle> {
        Err(crate::error::LiveError::Microphone(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open_output(&self, _: &OutputRequest, _: AudioConsumer) -> Result<OutputStreamHandle> {
        Err(crate::error::LiveError::AudioOutput(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingGuard(Arc<AtomicUsize>);

    impl DeviceGuard for CountingGuard {
        fn close(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn handle_close_is_idempotent_and_runs_on_drop_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut handle = InputStreamHandle::new(16_000, Box::new(CountingGuard(Arc::clone(&closes))));
        handle.close();
        handle.close();
        assert!(!handle.is_open());
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let closes = Arc::new(AtomicUsize::new(0));
        let handle = OutputStreamHandle::new(
            24_000,
            OutputClock::new(24_000),
            Box::new(CountingGuard(Arc::clone(&closes))),
        );
        drop(handle);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_clock_counts_seconds_of_rendered_frames() {
        let clock = OutputClock::new(48_000);
        let shared = clock.clone();
        shared.advance(24_000);
        assert_eq!(clock.now(), 0.5);
    }
}
