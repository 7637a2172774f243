//! Audio Streams, Tracks und Capture-Abstraktion

use super::{MediaConstraints, MediaError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Kapazität des Frame-Broadcasts (~2 Sekunden bei 20ms Frames)
const FRAME_CHANNEL_CAPACITY: usize = 100;

/// Maximal gepufferte Remote-Frames im Mixer
const MIXER_MAX_PENDING: usize = 25;

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein Block PCM Samples (mono, f32)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            captured_at: Instant::now(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Addiert zwei Frames, Ergebnis auf [-1.0, 1.0] begrenzt
    pub fn mix(&self, other: &AudioFrame) -> AudioFrame {
        let len = self.samples.len().max(other.samples.len());
        let samples = (0..len)
            .map(|i| {
                let a = self.samples.get(i).copied().unwrap_or(0.0);
                let b = other.samples.get(i).copied().unwrap_or(0.0);
                (a + b).clamp(-1.0, 1.0)
            })
            .collect();

        AudioFrame {
            samples,
            sample_rate: self.sample_rate,
            captured_at: self.captured_at,
        }
    }
}

// ============================================================================
// AUDIO STREAM
// ============================================================================

/// Broadcast von Audio-Frames, beliebig viele Empfänger
#[derive(Clone)]
pub struct AudioStream {
    id: String,
    tx: broadcast::Sender<AudioFrame>,
}

impl AudioStream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.tx.subscribe()
    }

    /// Veröffentlicht einen Frame; gibt die Anzahl der Empfänger zurück
    pub fn publish(&self, frame: AudioFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for AudioStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStream")
            .field("id", &self.id)
            .field("receivers", &self.receiver_count())
            .finish()
    }
}

// ============================================================================
// AUDIO TRACK
// ============================================================================

/// Audio-Track mit `enabled` Flag (Mute) und Ende-Status
#[derive(Clone)]
pub struct AudioTrack {
    id: String,
    label: String,
    enabled: Arc<Mutex<bool>>,
    ended: Arc<Mutex<bool>>,
}

impl AudioTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            enabled: Arc::new(Mutex::new(true)),
            ended: Arc::new(Mutex::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    /// Geteiltes Flag, das der Capture-Callback liest
    pub fn enabled_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.enabled)
    }

    pub fn stop(&self) {
        *self.ended.lock() = true;
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.lock()
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Hält eine laufende Aufnahme am Leben, bis `stop` aufgerufen wird
pub trait CaptureHandle: Send {
    fn stop(&mut self);
}

/// Quelle für lokale Mikrofon-Streams
pub trait CaptureDevice: Send + Sync {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

/// Capture ohne Hardware: Frames werden vom Aufrufer über
/// `LocalStream::audio().publish()` eingespeist (Headless-Betrieb).
#[derive(Debug, Default)]
pub struct NullCapture;

impl CaptureDevice for NullCapture {
    fn open(&self, _constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        Ok(LocalStream::new(
            vec![AudioTrack::new("null")],
            AudioStream::new(),
            None,
        ))
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Hält eine laufende Wiedergabe am Leben, bis `stop` aufgerufen wird
pub trait PlaybackHandle: Send {
    fn stop(&mut self);
}

/// Ausgabegerät für empfangenes Audio
pub trait PlaybackDevice: Send + Sync {
    fn play(&self, audio: &AudioStream) -> Result<Box<dyn PlaybackHandle>, MediaError>;
}

// ============================================================================
// LOCAL STREAM
// ============================================================================

/// Lokal aufgenommener Stream (Mikrofon)
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<AudioTrack>,
    audio: AudioStream,
    capture: Arc<Mutex<Option<Box<dyn CaptureHandle>>>>,
    level: Arc<Mutex<f32>>,
}

impl LocalStream {
    pub fn new(
        tracks: Vec<AudioTrack>,
        audio: AudioStream,
        capture: Option<Box<dyn CaptureHandle>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
            audio,
            capture: Arc::new(Mutex::new(capture)),
            level: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn with_level(mut self, level: Arc<Mutex<f32>>) -> Self {
        self.level = level;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[AudioTrack] {
        &self.tracks
    }

    pub fn first_audio_track(&self) -> Option<&AudioTrack> {
        self.tracks.first()
    }

    pub fn audio(&self) -> &AudioStream {
        &self.audio
    }

    pub fn input_level(&self) -> f32 {
        *self.level.lock()
    }

    /// Stoppt alle Tracks und gibt das Capture-Gerät frei
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(mut capture) = self.capture.lock().take() {
            capture.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_ended())
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

// ============================================================================
// REMOTE STREAM
// ============================================================================

/// Beschreibung eines empfangenen Remote-Tracks
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub mime_type: String,
}

/// Remote Audio, sobald der Peer einen Track liefert
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub info: RemoteTrackInfo,
    pub audio: AudioStream,
}

impl RemoteStream {
    pub fn new(info: RemoteTrackInfo) -> Self {
        Self {
            info,
            audio: AudioStream::new(),
        }
    }
}

// ============================================================================
// MIXER
// ============================================================================

/// Mischt lokale und Remote-Frames zu einem Stream.
///
/// Lokale Frames geben den Takt vor; pro lokalem Frame wird höchstens ein
/// gepufferter Remote-Frame beigemischt.
pub fn mix_streams(local: &AudioStream, remote: &AudioStream) -> (AudioStream, JoinHandle<()>) {
    let output = AudioStream::new();
    let mut local_rx = local.subscribe();
    let mut remote_rx = remote.subscribe();
    let out = output.clone();

    let handle = tokio::spawn(async move {
        let mut pending: VecDeque<AudioFrame> = VecDeque::new();
        let mut remote_open = true;

        loop {
            tokio::select! {
                frame = local_rx.recv() => match frame {
                    Ok(frame) => {
                        let mixed = match pending.pop_front() {
                            Some(remote) => frame.mix(&remote),
                            None => frame,
                        };
                        out.publish(mixed);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Mixer lagged behind local audio by {} frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                frame = remote_rx.recv(), if remote_open => match frame {
                    Ok(frame) => {
                        if pending.len() >= MIXER_MAX_PENDING {
                            pending.pop_front();
                        }
                        pending.push_back(frame);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => remote_open = false,
                },
            }
        }
    });

    (output, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_clamps_and_pads() {
        let a = AudioFrame::new(vec![0.8, 0.1], 48000);
        let b = AudioFrame::new(vec![0.5, 0.1, -0.2], 48000);
        let mixed = a.mix(&b);
        assert_eq!(mixed.samples.len(), 3);
        assert_eq!(mixed.samples[0], 1.0);
        assert!((mixed.samples[1] - 0.2).abs() < 1e-6);
        assert!((mixed.samples[2] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_stop_ends_tracks() {
        let stream = NullCapture.open(&MediaConstraints::default()).unwrap();
        assert!(stream.is_active());
        stream.stop();
        assert!(!stream.is_active());
        stream.stop();
    }

    #[tokio::test]
    async fn test_mixer_combines_remote_into_local() {
        let local = AudioStream::new();
        let remote = AudioStream::new();
        let (mixed, handle) = mix_streams(&local, &remote);
        let mut rx = mixed.subscribe();

        // Mixer-Task abonniert synchron in mix_streams, daher gehen keine Frames verloren
        remote.publish(AudioFrame::new(vec![0.25; 4], 48000));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        local.publish(AudioFrame::new(vec![0.25; 4], 48000));

        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.samples, vec![0.5; 4]);
        handle.abort();
    }
}
