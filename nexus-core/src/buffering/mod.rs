//! Lock-free SPSC ring buffers between real-time audio callbacks and the
//! non-real-time session workers.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half, held by whichever side writes samples.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Consumer half, held by whichever side reads samples.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Microphone ring: 2^18 = 262 144 f32 samples ≈ 5.4 s at 48 kHz.
/// The capture worker drains every few milliseconds, so this only has to
/// absorb scheduler hiccups.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 18;

/// Create the microphone → capture worker ring.
pub fn create_capture_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}

/// Create the scheduler → speaker ring, sized for `max_backlog_secs` of audio
/// at `device_rate`, doubled so a backlog warning fires well before samples
/// are lost.
pub fn create_playback_ring(device_rate: u32, max_backlog_secs: f64) -> (AudioProducer, AudioConsumer) {
    let capacity = playback_ring_capacity(device_rate, max_backlog_secs);
    HeapRb::<f32>::new(capacity).split()
}

fn playback_ring_capacity(device_rate: u32, max_backlog_secs: f64) -> usize {
    let secs = max_backlog_secs.max(1.0) * 2.0;
    ((device_rate.max(1) as f64 * secs).ceil() as usize).max(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_ring_holds_twice_the_backlog() {
        assert_eq!(playback_ring_capacity(24_000, 60.0), 2_880_000);
    }

    #[test]
    fn playback_ring_has_a_floor() {
        assert_eq!(playback_ring_capacity(8_000, 0.0), 16_000);
        assert_eq!(playback_ring_capacity(100, 1.0), 4096);
    }

    #[test]
    fn capture_ring_round_trips_samples() {
        let (mut producer, mut consumer) = create_capture_ring();
        assert_eq!(producer.push_slice(&[0.25, -0.5, 0.75]), 3);
        let mut out = [0.0f32; 4];
        assert_eq!(consumer.pop_slice(&mut out), 3);
        assert_eq!(&out[..3], &[0.25, -0.5, 0.75]);
    }
}
