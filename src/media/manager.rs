//! Verwaltung von lokalem und Remote-Stream

use super::stream::{
    mix_streams, AudioStream, CaptureDevice, LocalStream, PlaybackDevice, PlaybackHandle,
    RemoteStream,
};
use super::{MediaConstraints, MediaError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Hält den lokalen Mikrofon-Stream und den Remote-Stream eines Anrufs
pub struct MediaManager {
    device: Arc<dyn CaptureDevice>,
    playback: Mutex<Option<Arc<dyn PlaybackDevice>>>,
    local: Mutex<Option<LocalStream>>,
    remote: Mutex<Option<RemoteStream>>,
    player: Mutex<Option<Box<dyn PlaybackHandle>>>,
    mixer: Mutex<Option<(AudioStream, JoinHandle<()>)>>,
}

impl MediaManager {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            playback: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            player: Mutex::new(None),
            mixer: Mutex::new(None),
        }
    }

    /// Ausgabegerät für künftige Remote-Streams; ohne Gerät wird nichts
    /// wiedergegeben
    pub fn set_playback(&self, device: Arc<dyn PlaybackDevice>) {
        *self.playback.lock() = Some(device);
    }

    /// Öffnet das Mikrofon.
    ///
    /// Bei wiederholtem Aufruf wird der bereits geöffnete Stream zurückgegeben.
    pub fn get_local_stream(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let mut local = self.local.lock();
        if let Some(stream) = local.as_ref() {
            return Ok(stream.clone());
        }

        let stream = self.device.open(constraints).map_err(|e| {
            tracing::error!("Failed to acquire microphone: {}", e);
            e
        })?;
        tracing::info!("Local stream acquired ({} track(s))", stream.tracks().len());

        *local = Some(stream.clone());
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local.lock().clone()
    }

    /// Schaltet den ersten Audio-Track um; gibt `true` zurück wenn jetzt stumm
    pub fn toggle_mute(&self) -> Result<bool, MediaError> {
        let local = self.local.lock();
        let track = local
            .as_ref()
            .and_then(|s| s.first_audio_track())
            .ok_or(MediaError::NoLocalStream)?;

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!("Audio muted: {}", !enabled);
        Ok(!enabled)
    }

    pub fn is_muted(&self) -> bool {
        self.local
            .lock()
            .as_ref()
            .and_then(|s| s.first_audio_track())
            .map(|t| !t.is_enabled())
            .unwrap_or(false)
    }

    /// Eingangspegel (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        self.local
            .lock()
            .as_ref()
            .map(|s| s.input_level())
            .unwrap_or(0.0)
    }

    /// Übernimmt den Remote-Stream und startet die Wiedergabe.
    ///
    /// Ein fehlendes Ausgabegerät beendet den Anruf nicht.
    pub fn set_remote_stream(&self, stream: RemoteStream) {
        tracing::info!("Remote stream attached: track {}", stream.info.track_id);
        self.stop_player();

        let playback = self.playback.lock().clone();
        if let Some(playback) = playback {
            match playback.play(&stream.audio) {
                Ok(handle) => *self.player.lock() = Some(handle),
                Err(e) => tracing::warn!("Remote audio playback unavailable: {}", e),
            }
        }

        *self.remote.lock() = Some(stream);
        // Ein bestehender Mix kennt den neuen Remote-Stream nicht
        self.stop_mixer();
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote.lock().clone()
    }

    /// Stream für die Aufnahme: lokal + remote gemischt, nur lokal, oder `None`
    pub fn composite_stream(&self) -> Option<AudioStream> {
        let local = self.local.lock().clone()?;
        let remote = match self.remote.lock().clone() {
            Some(remote) => remote,
            None => return Some(local.audio().clone()),
        };

        let mut mixer = self.mixer.lock();
        if let Some((stream, _)) = mixer.as_ref() {
            return Some(stream.clone());
        }

        let (stream, handle) = mix_streams(local.audio(), &remote.audio);
        *mixer = Some((stream.clone(), handle));
        Some(stream)
    }

    /// Stoppt alle Tracks und gibt alle Referenzen frei
    pub fn dispose(&self) {
        self.stop_mixer();
        self.stop_player();
        if let Some(stream) = self.local.lock().take() {
            stream.stop();
            tracing::info!("Local stream released");
        }
        self.remote.lock().take();
    }

    pub fn has_local_stream(&self) -> bool {
        self.local.lock().is_some()
    }

    fn stop_player(&self) {
        if let Some(mut player) = self.player.lock().take() {
            player.stop();
        }
    }

    fn stop_mixer(&self) {
        if let Some((_, handle)) = self.mixer.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MediaManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("has_local_stream", &self.has_local_stream())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{NullCapture, RemoteTrackInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCapture {
        opened: AtomicUsize,
    }

    impl CaptureDevice for CountingCapture {
        fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            NullCapture.open(constraints)
        }
    }

    struct DeniedCapture;

    #[derive(Default)]
    struct CountingPlayback {
        played: AtomicUsize,
        stopped: Arc<AtomicUsize>,
    }

    struct CountingHandle(Arc<AtomicUsize>);

    impl PlaybackHandle for CountingHandle {
        fn stop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PlaybackDevice for CountingPlayback {
        fn play(&self, _: &AudioStream) -> Result<Box<dyn PlaybackHandle>, MediaError> {
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingHandle(Arc::clone(&self.stopped))))
        }
    }

    struct MissingSpeaker;

    impl PlaybackDevice for MissingSpeaker {
        fn play(&self, _: &AudioStream) -> Result<Box<dyn PlaybackHandle>, MediaError> {
            Err(MediaError::NoPlaybackDevice)
        }
    }

    fn remote(track_id: &str) -> RemoteStream {
        RemoteStream::new(RemoteTrackInfo {
            track_id: track_id.to_string(),
            stream_id: "s".to_string(),
            mime_type: "audio/opus".to_string(),
        })
    }

    impl CaptureDevice for DeniedCapture {
        fn open(&self, _: &MediaConstraints) -> Result<LocalStream, MediaError> {
            Err(MediaError::PermissionDenied("user dismissed prompt".to_string()))
        }
    }

    #[test]
    fn test_get_local_stream_is_idempotent() {
        let device = Arc::new(CountingCapture {
            opened: AtomicUsize::new(0),
        });
        let manager = MediaManager::new(device.clone());

        let first = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        let second = manager.get_local_stream(&MediaConstraints::default()).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(device.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_permission_denied_is_reported() {
        let manager = MediaManager::new(Arc::new(DeniedCapture));
        let err = manager
            .get_local_stream(&MediaConstraints::default())
            .unwrap_err();
        assert!(matches!(err, MediaError::PermissionDenied(_)));
        assert!(!manager.has_local_stream());
    }

    #[test]
    fn test_toggle_mute_disables_track() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        let stream = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        let track = stream.first_audio_track().unwrap().clone();
        assert!(track.is_enabled());

        assert!(manager.toggle_mute().unwrap());
        assert!(!track.is_enabled());
        assert!(manager.is_muted());
    }

    #[test]
    fn test_toggle_mute_is_involution() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        let stream = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        let track = stream.first_audio_track().unwrap().clone();
        let original = track.is_enabled();

        manager.toggle_mute().unwrap();
        manager.toggle_mute().unwrap();

        assert_eq!(track.is_enabled(), original);
        assert!(!manager.is_muted());
    }

    #[test]
    fn test_toggle_mute_without_stream_fails() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        assert!(matches!(manager.toggle_mute(), Err(MediaError::NoLocalStream)));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        manager.dispose();

        let stream = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        manager.dispose();
        assert!(!manager.has_local_stream());
        assert!(!stream.is_active());

        manager.dispose();
        assert!(!manager.has_local_stream());
        assert!(manager.remote_stream().is_none());
    }

    #[test]
    fn test_composite_without_remote_is_local() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        assert!(manager.composite_stream().is_none());

        let stream = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        let composite = manager.composite_stream().unwrap();
        assert_eq!(composite.id(), stream.audio().id());
    }

    #[tokio::test]
    async fn test_composite_with_remote_is_mixed() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        let stream = manager.get_local_stream(&MediaConstraints::default()).unwrap();
        manager.set_remote_stream(RemoteStream::new(RemoteTrackInfo {
            track_id: "t".to_string(),
            stream_id: "s".to_string(),
            mime_type: "audio/opus".to_string(),
        }));

        let composite = manager.composite_stream().unwrap();
        assert_ne!(composite.id(), stream.audio().id());
        // Zweiter Aufruf liefert denselben Mix
        assert_eq!(manager.composite_stream().unwrap().id(), composite.id());
        manager.dispose();
    }

    #[test]
    fn test_remote_stream_is_played_until_replaced_or_disposed() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        let playback = Arc::new(CountingPlayback::default());
        manager.set_playback(playback.clone());

        manager.set_remote_stream(remote("first"));
        assert_eq!(playback.played.load(Ordering::SeqCst), 1);
        assert_eq!(playback.stopped.load(Ordering::SeqCst), 0);

        // Neuer Track ersetzt die laufende Wiedergabe
        manager.set_remote_stream(remote("second"));
        assert_eq!(playback.played.load(Ordering::SeqCst), 2);
        assert_eq!(playback.stopped.load(Ordering::SeqCst), 1);

        manager.dispose();
        manager.dispose();
        assert_eq!(playback.stopped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_speaker_keeps_remote_stream() {
        let manager = MediaManager::new(Arc::new(NullCapture));
        manager.set_playback(Arc::new(MissingSpeaker));
        manager.set_remote_stream(remote("t"));
        assert_eq!(manager.remote_stream().unwrap().info.track_id, "t");
    }
}
