//! cpal implementation of [`AudioBackend`].
//!
//! # Design constraints
//!
//! The cpal callbacks run on OS audio threads at elevated priority. They
//! **must not** block on a mutex, perform I/O, or wait on the session. Both
//! directions therefore talk to the rest of the engine only through SPSC
//! rings (`push_slice` / `pop_slice` are lock-free) and an atomic frame
//! counter for the output clock.

use std::thread::JoinHandle;

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig, SupportedStreamConfigRange,
};
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info, warn};

use super::{
    AudioBackend, DeviceGuard, InputRequest, InputStreamHandle, OutputClock, OutputRequest,
    OutputStreamHandle,
};
use crate::{
    buffering::{AudioConsumer, AudioProducer, Consumer, Producer},
    error::{LiveError, Result},
};

/// Opens the host's real microphone and speaker.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        request: &InputRequest,
        producer: AudioProducer,
    ) -> Result<InputStreamHandle> {
        let request = request.clone();
        let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let thread = std::thread::Builder::new()
            .name("nexus-microphone".into())
            .spawn(move || {
                let (stream, rate) = match build_input(&request, producer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));
                // Park until the handle is closed, then drop the stream here.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("microphone stream released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(rate)) => Ok(InputStreamHandle::new(
                rate,
                Box::new(StreamThread::new("microphone", stop_tx, thread)),
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(LiveError::Microphone(
                "microphone thread exited before the stream opened".into(),
            )),
        }
    }

    fn open_output(
        &self,
        request: &OutputRequest,
        consumer: AudioConsumer,
    ) -> Result<OutputStreamHandle> {
        let request = request.clone();
        let (ready_tx, ready_rx) = bounded::<Result<OutputClock>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let thread = std::thread::Builder::new()
            .name("nexus-speaker".into())
            .spawn(move || {
                let (stream, clock) = match build_output(&request, consumer) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(clock));
                let _ = stop_rx.recv();
                drop(stream);
                debug!("speaker stream released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(clock)) => Ok(OutputStreamHandle::new(
                clock.sample_rate(),
                clock,
                Box::new(StreamThread::new("speaker", stop_tx, thread)),
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(LiveError::AudioOutput(
                "speaker thread exited before the stream opened".into(),
            )),
        }
    }
}

/// Owns the parked stream thread; closing wakes it and joins.
struct StreamThread {
    label: &'static str,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn new(label: &'static str, stop: Sender<()>, thread: JoinHandle<()>) -> Self {
        Self {
            label,
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

impl DeviceGuard for StreamThread {
    fn close(&mut self) {
        // Dropping the sender disconnects the channel and unparks the thread.
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = self.label, "audio stream thread panicked");
            }
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

fn select_device(direction: Direction, preferred: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(wanted) = preferred {
        let found = match direction {
            Direction::Input => host.input_devices().map(|d| find_named(d, wanted)),
            Direction::Output => host.output_devices().map(|d| find_named(d, wanted)),
        };
        match found {
            Ok(Some(device)) => return Ok(device),
            Ok(None) => warn!(device = wanted, "preferred audio device not found, falling back"),
            Err(e) => warn!("failed to list audio devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    match direction {
        Direction::Input => host
            .input_devices()
            .map_err(|e| LiveError::Microphone(e.to_string()))?
            .next()
            .ok_or(LiveError::NoDefaultInputDevice),
        Direction::Output => host
            .output_devices()
            .map_err(|e| LiveError::AudioOutput(e.to_string()))?
            .next()
            .ok_or(LiveError::NoDefaultOutputDevice),
    }
}

fn find_named(mut devices: impl Iterator<Item = Device>, wanted: &str) -> Option<Device> {
    devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
}

fn is_handled_format(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 | SampleFormat::U8
    )
}

/// Prefer a config that runs natively at `rate` (fewest channels, f32 first),
/// otherwise take the device default and resample in software.
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
    default: SupportedStreamConfig,
) -> SupportedStreamConfig {
    ranges
        .filter(|r| {
            r.min_sample_rate().0 <= rate
                && rate <= r.max_sample_rate().0
                && is_handled_format(r.sample_format())
        })
        .min_by_key(|r| (r.channels(), r.sample_format() != SampleFormat::F32))
        .map(|r| r.with_sample_rate(SampleRate(rate)))
        .unwrap_or(default)
}

fn build_input(request: &InputRequest, producer: AudioProducer) -> Result<(Stream, u32)> {
    let device = select_device(Direction::Input, request.preferred_device.as_deref())?;
    let name = device.name().unwrap_or_default();

    let default = device
        .default_input_config()
        .map_err(|e| LiveError::Microphone(e.to_string()))?;
    let supported = match device.supported_input_configs() {
        Ok(ranges) => pick_config(ranges, request.sample_rate, default),
        Err(_) => default,
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    info!(device = %name, sample_rate, channels, ?format, "opening microphone");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match format {
        SampleFormat::F32 => input_stream::<f32>(&device, &config, producer),
        SampleFormat::I16 => input_stream::<i16>(&device, &config, producer),
        SampleFormat::U16 => input_stream::<u16>(&device, &config, producer),
        SampleFormat::U8 => input_stream::<u8>(&device, &config, producer),
        fmt => {
            return Err(LiveError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| LiveError::Microphone(e.to_string()))?;
    Ok((stream, sample_rate))
}

fn input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (f, out) in mono.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch]
                        .iter()
                        .map(|&s| f32::from_sample(s))
                        .sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!(dropped = mono.len() - written, "capture ring full");
                }
            },
            |err| error!("microphone stream error: {err}"),
            None,
        )
        .map_err(|e| LiveError::Microphone(e.to_string()))
}

fn build_output(request: &OutputRequest, consumer: AudioConsumer) -> Result<(Stream, OutputClock)> {
    let device = select_device(Direction::Output, request.preferred_device.as_deref())?;
    let name = device.name().unwrap_or_default();

    let default = device
        .default_output_config()
        .map_err(|e| LiveError::AudioOutput(e.to_string()))?;
    let supported = match device.supported_output_configs() {
        Ok(ranges) => pick_config(ranges, request.sample_rate, default),
        Err(_) => default,
    };

    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let format = supported.sample_format();
    info!(device = %name, sample_rate, channels, ?format, "opening speaker");

    let config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let clock = OutputClock::new(sample_rate);

    let stream = match format {
        SampleFormat::F32 => output_stream::<f32>(&device, &config, consumer, clock.clone()),
        SampleFormat::I16 => output_stream::<i16>(&device, &config, consumer, clock.clone()),
        SampleFormat::U16 => output_stream::<u16>(&device, &config, consumer, clock.clone()),
        SampleFormat::U8 => output_stream::<u8>(&device, &config, consumer, clock.clone()),
        fmt => {
            return Err(LiveError::AudioOutput(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| LiveError::AudioOutput(e.to_string()))?;
    Ok((stream, clock))
}

fn output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: AudioConsumer,
    clock: OutputClock,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                let got = consumer.pop_slice(&mut mono);
                mono[got..].fill(0.0);
                for (frame, &sample) in data.chunks_exact_mut(ch).zip(mono.iter()) {
                    frame.fill(T::from_sample(sample));
                }
                clock.advance(frames as u64);
            },
            |err| error!("speaker stream error: {err}"),
            None,
        )
        .map_err(|e| LiveError::AudioOutput(e.to_string()))
}
