//! Per-session counters shared by the capture worker, the actor and the
//! playback sink.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub blocks_captured: AtomicUsize,
    pub blocks_muted: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub inbound_frames: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub buffers_scheduled: AtomicUsize,
    pub playback_overflow_samples: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            blocks_captured: self.blocks_captured.load(Ordering::Relaxed),
            blocks_muted: self.blocks_muted.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            inbound_frames: self.inbound_frames.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            playback_overflow_samples: self.playback_overflow_samples.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 8] {
        [
            &self.blocks_captured,
            &self.blocks_muted,
            &self.frames_sent,
            &self.frames_dropped,
            &self.inbound_frames,
            &self.decode_errors,
            &self.buffers_scheduled,
            &self.playback_overflow_samples,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub blocks_captured: usize,
    pub blocks_muted: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub inbound_frames: usize,
    pub decode_errors: usize,
    pub buffers_scheduled: usize,
    pub playback_overflow_samples: usize,
}
