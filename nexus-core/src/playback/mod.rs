//! Gapless playback scheduling for synthesized speech.
//!
//! ## Algorithm
//!
//! ```text
//! cursor = None
//! on buffer b:
//!     now    = output clock
//!     start  = max(cursor.unwrap_or(now), now)
//!     sink.enqueue(start, b)
//!     cursor = start + b.duration
//! ```
//!
//! Buffers play back-to-back in arrival order no matter how jittery the
//! network is: the output clock, not arrival time, decides when each one
//! starts. A burst simply pushes the cursor ahead of `now` (more latency, no
//! loss); a gap lets `now` overtake the cursor and the next buffer starts
//! immediately.

pub mod sink;

pub use sink::RingSink;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::DecodedBuffer;

/// A monotonic playback clock in seconds.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Destination for scheduled audio.
pub trait PlaybackSink: Send {
    /// Commit `buffer` to start at output-clock time `start`.
    fn enqueue(&mut self, start: f64, buffer: &DecodedBuffer);

    /// Push out anything held back for batching (end of a model turn).
    ///
    /// Returns the seconds of silence appended to do so. Held-back audio was
    /// already counted when its buffer was enqueued; the padding was not.
    fn flush(&mut self) -> f64 {
        0.0
    }
}

/// Where on the output timeline a buffer was placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start: f64,
    pub end: f64,
}

/// Places decoded buffers on the output clock without gaps or overlap.
pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    sink: Box<dyn PlaybackSink>,
    /// Output-clock time at which the next buffer must begin.
    cursor: Option<f64>,
    /// Backlog (seconds) above which a warning is logged. Nothing is dropped here.
    max_backlog_secs: f64,
    backlog_warned: bool,
    scheduled: u64,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn AudioClock>, sink: Box<dyn PlaybackSink>, max_backlog_secs: f64) -> Self {
        Self {
            clock,
            sink,
            cursor: None,
            max_backlog_secs,
            backlog_warned: false,
            scheduled: 0,
        }
    }

    /// Schedule one buffer and advance the cursor by its duration.
    pub fn schedule(&mut self, buffer: &DecodedBuffer) -> ScheduledSpan {
        let now = self.clock.now();
        let start = self.cursor.map_or(now, |cursor| cursor.max(now));
        let end = start + buffer.duration_secs();

        self.sink.enqueue(start, buffer);
        self.cursor = Some(end);
        self.scheduled += 1;

        let backlog = end - now;
        if backlog > self.max_backlog_secs {
            if !self.backlog_warned {
                warn!(
                    backlog_secs = backlog,
                    max_backlog_secs = self.max_backlog_secs,
                    "playback backlog above limit; latency is growing"
                );
                self.backlog_warned = true;
            }
        } else {
            self.backlog_warned = false;
        }

        debug!(start, end, backlog_secs = backlog, "scheduled playback buffer");
        ScheduledSpan { start, end }
    }

    /// Flush the sink at the end of a model turn and move the cursor past any
    /// padding the sink appended, so the next turn starts after it.
    pub fn flush(&mut self) {
        let padding = self.sink.flush();
        if padding <= 0.0 {
            return;
        }
        if let Some(cursor) = self.cursor {
            let now = self.clock.now();
            self.cursor = Some(cursor.max(now) + padding);
            debug!(padding_secs = padding, "flush padding added to playback cursor");
        }
    }

    /// Time at which the next buffer would start, if anything was scheduled.
    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    /// Seconds of audio committed but not yet played.
    pub fn backlog(&self) -> f64 {
        self.cursor
            .map_or(0.0, |cursor| (cursor - self.clock.now()).max(0.0))
    }

    /// Buffers scheduled since creation.
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct ManualClock(Mutex<f64>);

    impl ManualClock {
        fn set(&self, t: f64) {
            *self.0.lock() = t;
        }
    }

    impl AudioClock for ManualClock {
        fn now(&self) -> f64 {
            *self.0.lock()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        starts: Arc<Mutex<Vec<f64>>>,
        flushes: Arc<Mutex<usize>>,
        /// Seconds of silence each flush claims to append.
        padding: f64,
    }

    impl PlaybackSink for RecordingSink {
        fn enqueue(&mut self, start: f64, _buffer: &DecodedBuffer) {
            self.starts.lock().push(start);
        }

        fn flush(&mut self) -> f64 {
            *self.flushes.lock() += 1;
            self.padding
        }
    }

    fn buffer_of(secs: f64) -> DecodedBuffer {
        let rate = 24_000u32;
        DecodedBuffer {
            samples: vec![0.0; (secs * rate as f64).round() as usize],
            sample_rate: rate,
            channels: 1,
        }
    }

    fn scheduler(clock: &Arc<ManualClock>, sink: &RecordingSink) -> PlaybackScheduler {
        let clock: Arc<dyn AudioClock> = Arc::clone(clock) as Arc<dyn AudioClock>;
        PlaybackScheduler::new(clock, Box::new(sink.clone()), 60.0)
    }

    #[test]
    fn burst_then_gap_is_gapless_then_catches_up() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink::default();
        let mut sched = scheduler(&clock, &sink);

        let arrivals = [(0.0, 0.5), (0.1, 0.3), (10.0, 0.2)];
        let mut spans = Vec::new();
        for (at, dur) in arrivals {
            clock.set(at);
            spans.push(sched.schedule(&buffer_of(dur)));
        }

        let starts: Vec<f64> = spans.iter().map(|s| s.start).collect();
        let ends: Vec<f64> = spans.iter().map(|s| s.end).collect();
        for (got, want) in starts.iter().zip([0.0, 0.5, 10.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-9);
        }
        for (got, want) in ends.iter().zip([0.5, 0.8, 10.2]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-9);
        }
        assert_eq!(&*sink.starts.lock(), &starts);
        assert_eq!(sched.scheduled_count(), 3);
    }

    #[test]
    fn first_buffer_starts_at_now() {
        let clock = Arc::new(ManualClock::default());
        clock.set(3.25);
        let sink = RecordingSink::default();
        let mut sched = scheduler(&clock, &sink);
        assert!(sched.cursor().is_none());

        let span = sched.schedule(&buffer_of(0.25));
        assert_abs_diff_eq!(span.start, 3.25);
        assert_abs_diff_eq!(sched.cursor().unwrap(), 3.5);
    }

    #[test]
    fn starts_never_overlap_under_jittery_arrivals() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink::default();
        let mut sched = scheduler(&clock, &sink);

        // Irregular arrivals, some far apart, some bunched together.
        let arrivals = [0.0, 0.01, 0.02, 0.9, 0.91, 3.0, 3.05, 3.1, 3.15, 7.5];
        let mut prev: Option<ScheduledSpan> = None;
        for (i, at) in arrivals.iter().enumerate() {
            clock.set(*at);
            let dur = 0.1 + (i % 4) as f64 * 0.15;
            let span = sched.schedule(&buffer_of(dur));
            assert!(span.start >= *at - 1e-12, "buffer {i} starts in the past");
            if let Some(p) = prev {
                assert!(span.start >= p.end - 1e-12, "buffer {i} overlaps its predecessor");
                if p.end >= *at {
                    assert_abs_diff_eq!(span.start, p.end, epsilon = 1e-9);
                }
            }
            prev = Some(span);
        }
    }

    #[test]
    fn backlog_tracks_cursor_lead_over_clock() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink::default();
        let mut sched = scheduler(&clock, &sink);
        assert_eq!(sched.backlog(), 0.0);

        sched.schedule(&buffer_of(1.0));
        sched.schedule(&buffer_of(1.0));
        assert_abs_diff_eq!(sched.backlog(), 2.0, epsilon = 1e-9);

        clock.set(1.5);
        assert_abs_diff_eq!(sched.backlog(), 0.5, epsilon = 1e-9);

        clock.set(5.0);
        assert_eq!(sched.backlog(), 0.0);
    }

    #[test]
    fn flush_reaches_the_sink() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink::default();
        let mut sched = scheduler(&clock, &sink);
        sched.flush();
        assert_eq!(*sink.flushes.lock(), 1);
        assert!(sched.cursor().is_none());
    }

    #[test]
    fn next_turn_starts_after_flush_padding() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink {
            padding: 0.015,
            ..RecordingSink::default()
        };
        let mut sched = scheduler(&clock, &sink);

        sched.schedule(&buffer_of(0.5));
        sched.flush();
        assert_abs_diff_eq!(sched.cursor().unwrap(), 0.515, epsilon = 1e-9);

        clock.set(0.1);
        let span = sched.schedule(&buffer_of(0.2));
        assert_abs_diff_eq!(span.start, 0.515, epsilon = 1e-9);
        assert_abs_diff_eq!(span.end, 0.715, epsilon = 1e-9);
    }

    #[test]
    fn padding_after_a_drained_ring_counts_from_now() {
        let clock = Arc::new(ManualClock::default());
        let sink = RecordingSink {
            padding: 0.02,
            ..RecordingSink::default()
        };
        let mut sched = scheduler(&clock, &sink);

        sched.schedule(&buffer_of(0.25));
        clock.set(2.0);
        sched.flush();
        assert_abs_diff_eq!(sched.cursor().unwrap(), 2.02, epsilon = 1e-9);
    }
}
