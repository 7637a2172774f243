//! Mikrofon Capture und Playback über cpal
//!
//! Der Input-Callback mischt auf Mono, resampled auf 48kHz und schreibt in
//! einen Ring-Buffer. Ein Pump-Task liest daraus 20ms Frames und
//! veröffentlicht sie als [`AudioStream`].
//!
//! Für die Wiedergabe füllt ein Feeder-Task den Playback-Buffer aus dem
//! Remote-Stream; der Output-Callback verteilt die Samples auf alle Kanäle.

use super::stream::{
    AudioFrame, AudioStream, AudioTrack, CaptureDevice, CaptureHandle, LocalStream,
    PlaybackDevice, PlaybackHandle,
};
use super::{MediaConstraints, MediaError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Sample Rate aller Frames im Core
pub const SAMPLE_RATE: u32 = 48000;

/// 20ms @ 48kHz
pub const FRAME_SIZE: usize = 960;

/// Puffer für 200ms
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// SIGNAL HELPERS
// ============================================================================

/// Einfaches Linear-Resampling
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let step = source_rate as f32 / target_rate as f32;
    let out_len = (data.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 * step;
            let left = pos as usize;
            let a = data.get(left).copied().unwrap_or(0.0);
            let b = data.get(left + 1).copied().unwrap_or(a);
            a + (b - a) * (pos - left as f32)
        })
        .collect()
}

/// Interleaved Samples auf einen Kanal mitteln
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// RMS-Pegel, auf 1.0 begrenzt
fn rms_level(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let power = data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32;
    power.sqrt().min(1.0)
}

// ============================================================================
// CAPTURE PIPELINE
// ============================================================================

/// Zwischen cpal-Callback und Pump-Task geteilt
#[derive(Clone)]
struct CaptureShared {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    level: Arc<Mutex<f32>>,
    /// Track-Flag; aus = stumm
    enabled: Arc<Mutex<bool>>,
}

impl CaptureShared {
    fn new(enabled: Arc<Mutex<bool>>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            level: Arc::new(Mutex::new(0.0)),
            enabled,
        }
    }

    /// Ein Callback-Block vom Gerät
    fn ingest(&self, interleaved: &[f32], channels: usize, source_rate: u32) {
        if interleaved.is_empty() {
            return;
        }
        *self.level.lock() = rms_level(interleaved);

        // Stumm: Pegel weiter messen, aber nichts senden
        if !*self.enabled.lock() {
            return;
        }

        let samples = resample_linear(&downmix(interleaved, channels), source_rate, SAMPLE_RATE);
        let mut buffer = self.buffer.lock();
        let dropped = samples
            .into_iter()
            .filter(|s| buffer.try_push(*s).is_err())
            .count();
        if dropped > 0 {
            tracing::trace!("Capture buffer full, dropped {} samples", dropped);
        }
    }

    /// Nächster volle Frame, falls vorhanden
    fn next_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }
}

/// Passende Gerätekonfiguration: 48kHz bevorzugt, f32 vor i16
fn choose_config(
    ranges: &[SupportedStreamConfigRange],
) -> Result<(StreamConfig, SampleFormat), MediaError> {
    let target = cpal::SampleRate(SAMPLE_RATE);
    let usable = |format: SampleFormat| matches!(format, SampleFormat::F32 | SampleFormat::I16);
    let format_rank = |format: SampleFormat| match format {
        SampleFormat::F32 => 0,
        _ => 1,
    };

    let at_target = ranges
        .iter()
        .filter(|r| usable(r.sample_format()))
        .filter(|r| r.min_sample_rate() <= target && r.max_sample_rate() >= target)
        .min_by_key(|r| format_rank(r.sample_format()));
    if let Some(range) = at_target {
        return Ok((range.clone().with_sample_rate(target).into(), range.sample_format()));
    }

    ranges
        .iter()
        .filter(|r| usable(r.sample_format()))
        .min_by_key(|r| format_rank(r.sample_format()))
        .map(|r| (r.clone().with_max_sample_rate().into(), r.sample_format()))
        .ok_or_else(|| MediaError::Device("no f32 or i16 stream configuration".to_string()))
}

/// Laufende cpal-Aufnahme
struct Microphone {
    // Drop beendet die Aufnahme
    _stream: Stream,
}

// cpal::Stream ist auf manchen Plattformen nicht Send; er wird nur gehalten
// und im selben Handle wieder gedroppt
unsafe impl Send for Microphone {}

impl Microphone {
    fn open(device_name: Option<&str>, shared: &CaptureShared) -> Result<Self, MediaError> {
        let device = find_device(device_name)?;
        let ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| MediaError::Device(e.to_string()))?
            .collect();
        let (config, format) = choose_config(&ranges)?;

        tracing::info!(
            "Opening microphone {}: {} Hz, {} channel(s), {:?}",
            device.name().unwrap_or_else(|_| "<unknown>".to_string()),
            config.sample_rate.0,
            config.channels,
            format
        );

        let stream = match format {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, shared.clone())?,
            _ => build_stream::<f32>(&device, &config, shared.clone())?,
        };
        stream
            .play()
            .map_err(|e| MediaError::Device(e.to_string()))?;

        Ok(Self { _stream: stream })
    }
}

fn find_device(name: Option<&str>) -> Result<Device, MediaError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| MediaError::PermissionDenied(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                tracing::warn!("Input device '{}' not found", name);
                MediaError::NoCaptureDevice
            }),
        None => host.default_input_device().ok_or(MediaError::NoCaptureDevice),
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    shared: CaptureShared,
) -> Result<Stream, MediaError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let source_rate = config.sample_rate.0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                shared.ingest(&samples, channels, source_rate);
            },
            |err| tracing::error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaError::PermissionDenied("device not available".to_string())
            }
            other => MediaError::Device(other.to_string()),
        })
}

// ============================================================================
// CPAL CAPTURE DEVICE
// ============================================================================

/// Capture-Gerät auf Basis von cpal (Standard-Mikrofon oder per Name)
#[derive(Debug, Default)]
pub struct CpalCapture;

struct CpalCaptureHandle {
    microphone: Option<Microphone>,
    pump: JoinHandle<()>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn stop(&mut self) {
        self.pump.abort();
        if self.microphone.take().is_some() {
            tracing::info!("Microphone closed");
        }
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            tracing::debug!("Echo cancellation / noise suppression not available on native capture");
        }

        let track = AudioTrack::new("microphone");
        let shared = CaptureShared::new(track.enabled_flag());
        let microphone = Microphone::open(constraints.device_name.as_deref(), &shared)?;

        let audio = AudioStream::new();
        let publisher = audio.clone();
        let source = shared.clone();
        let pump = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            loop {
                ticker.tick().await;
                while let Some(samples) = source.next_frame() {
                    publisher.publish(AudioFrame::new(samples, SAMPLE_RATE));
                }
            }
        });

        let handle = CpalCaptureHandle {
            microphone: Some(microphone),
            pump,
        };
        Ok(LocalStream::new(vec![track], audio, Some(Box::new(handle))).with_level(shared.level))
    }
}

// ============================================================================
// PLAYBACK PIPELINE
// ============================================================================

/// Zwischen Feeder-Task und Output-Callback geteilt
#[derive(Clone)]
struct PlaybackShared {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    level: Arc<Mutex<f32>>,
}

impl PlaybackShared {
    fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Mono-Samples mit 48kHz für den Lautsprecher
    fn feed(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        let dropped = samples
            .iter()
            .filter(|s| buffer.try_push(**s).is_err())
            .count();
        if dropped > 0 {
            tracing::trace!("Playback buffer full, dropped {} samples", dropped);
        }
    }

    /// Füllt einen interleaved Output-Block; fehlende Samples sind Stille
    fn render(&self, out: &mut [f32], channels: usize, target_rate: u32) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        if frames == 0 || target_rate == 0 {
            return;
        }

        let needed = (frames as u64 * SAMPLE_RATE as u64).div_ceil(target_rate as u64) as usize;
        let source: Vec<f32> = {
            let mut buffer = self.buffer.lock();
            (0..needed).map(|_| buffer.try_pop().unwrap_or(0.0)).collect()
        };
        let mut samples = resample_linear(&source, SAMPLE_RATE, target_rate);
        samples.resize(frames, 0.0);

        // Mono auf alle Kanäle verteilen
        for (frame, sample) in out.chunks_mut(channels).zip(samples.iter()) {
            frame.fill(*sample);
        }
        *self.level.lock() = rms_level(&samples);
    }
}

/// Überträgt Frames aus dem Stream in den Playback-Buffer
fn spawn_feeder(audio: &AudioStream, shared: PlaybackShared) -> JoinHandle<()> {
    let mut rx = audio.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    shared.feed(&resample_linear(&frame.samples, frame.sample_rate, SAMPLE_RATE))
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Playback dropped {} frames", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Laufende cpal-Wiedergabe
struct Speaker {
    // Drop beendet die Wiedergabe
    _stream: Stream,
}

// Wie beim Mikrofon: der Stream wird nur gehalten und gedroppt
unsafe impl Send for Speaker {}

impl Speaker {
    fn open(shared: &PlaybackShared) -> Result<Self, MediaError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(MediaError::NoPlaybackDevice)?;
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| MediaError::Device(e.to_string()))?
            .collect();
        let (config, format) = choose_config(&ranges)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let stream = match format {
            SampleFormat::I16 => build_output_stream::<i16>(&device, &config, shared.clone())?,
            _ => build_output_stream::<f32>(&device, &config, shared.clone())?,
        };
        stream
            .play()
            .map_err(|e| MediaError::Device(e.to_string()))?;

        Ok(Self { _stream: stream })
    }
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    shared: PlaybackShared,
) -> Result<Stream, MediaError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let target_rate = config.sample_rate.0;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                shared.render(&mut scratch, channels, target_rate);
                for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = (*sample).to_sample::<T>();
                }
            },
            |err| tracing::error!("Audio playback error: {}", err),
            None,
        )
        .map_err(|e| MediaError::Device(e.to_string()))
}

// ============================================================================
// CPAL PLAYBACK DEVICE
// ============================================================================

/// Wiedergabe über das Standard-Ausgabegerät
#[derive(Debug, Default)]
pub struct CpalPlayback;

struct CpalPlaybackHandle {
    speaker: Option<Speaker>,
    feeder: JoinHandle<()>,
}

impl PlaybackHandle for CpalPlaybackHandle {
    fn stop(&mut self) {
        self.feeder.abort();
        if self.speaker.take().is_some() {
            tracing::info!("Speaker closed");
        }
    }
}

impl Drop for CpalPlaybackHandle {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

impl PlaybackDevice for CpalPlayback {
    fn play(&self, audio: &AudioStream) -> Result<Box<dyn PlaybackHandle>, MediaError> {
        let shared = PlaybackShared::new();
        let speaker = Speaker::open(&shared)?;
        let feeder = spawn_feeder(audio, shared);
        Ok(Box::new(CpalPlaybackHandle {
            speaker: Some(speaker),
            feeder,
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
