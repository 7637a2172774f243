//! Recording Engine
//!
//! Ein Task liest Frames aus dem (gemischten) Stream, kodiert sie über den
//! `RecordingSink` und puffert die Chunks. Erst `stop_recording` erzeugt das
//! Artefakt.

use super::artifact::RecordingArtifact;
use super::sink::{RecordingSink, WavSink};
use super::RecordingError;
use crate::media::{AudioStream, SAMPLE_RATE};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

type SinkFactory = Box<dyn Fn() -> Box<dyn RecordingSink> + Send + Sync>;

struct ActiveRecording {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<Box<dyn RecordingSink>, RecordingError>>,
    started: Instant,
}

pub struct RecordingEngine {
    sink_factory: SinkFactory,
    active: Mutex<Option<ActiveRecording>>,
    chunks: Arc<Mutex<Vec<Bytes>>>,
    artifact: Mutex<Option<RecordingArtifact>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::with_sink(|| Box::new(WavSink::new()))
    }

    /// Engine mit eigenem Encoder (pro Aufnahme eine neue Instanz)
    pub fn with_sink<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn RecordingSink> + Send + Sync + 'static,
    {
        Self {
            sink_factory: Box::new(factory),
            active: Mutex::new(None),
            chunks: Arc::new(Mutex::new(Vec::new())),
            artifact: Mutex::new(None),
        }
    }

    /// Startet die Aufnahme.
    ///
    /// `Ok(false)` wenn bereits aufgenommen wird oder der Encoder nicht
    /// startet, `Unavailable` ohne Stream.
    pub fn start_recording(&self, stream: Option<&AudioStream>) -> Result<bool, RecordingError> {
        let mut active = self.active.lock();
        if active.is_some() {
            tracing::debug!("Recording already in progress");
            return Ok(false);
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                tracing::warn!("Cannot start recording without a stream");
                return Err(RecordingError::Unavailable);
            }
        };

        let mut sink = (self.sink_factory)();
        if let Err(e) = sink.start(SAMPLE_RATE) {
            tracing::error!("Failed to start recording sink: {}", e);
            return Ok(false);
        }

        self.chunks.lock().clear();
        self.artifact.lock().take();

        let mut rx = stream.subscribe();
        let chunks = Arc::clone(&self.chunks);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = rx.recv() => match frame {
                        Ok(frame) => {
                            if let Some(chunk) = sink.push_chunk(&frame)? {
                                chunks.lock().push(chunk);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Recording dropped {} frames", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut stop_rx => {
                        // Bereits gepufferte Frames noch übernehmen
                        while let Ok(frame) = rx.try_recv() {
                            if let Some(chunk) = sink.push_chunk(&frame)? {
                                chunks.lock().push(chunk);
                            }
                        }
                        break;
                    }
                }
            }
            Ok(sink)
        });

        *active = Some(ActiveRecording {
            stop_tx,
            task,
            started: Instant::now(),
        });
        tracing::info!("Recording started");
        Ok(true)
    }

    /// Beendet die Aufnahme und erzeugt das Artefakt
    pub async fn stop_recording(&self) -> Result<RecordingArtifact, RecordingError> {
        let active = self
            .active
            .lock()
            .take()
            .ok_or(RecordingError::NotRecording)?;
        let elapsed = active.started.elapsed();

        let _ = active.stop_tx.send(());
        let mut sink = active
            .task
            .await
            .map_err(|e| RecordingError::Encoding(e.to_string()))??;

        let chunks = self.chunks.lock().clone();
        let blob = sink.finish(&chunks)?;
        let artifact = RecordingArtifact::new(blob, sink.mime_type(), elapsed.as_secs_f64());

        tracing::info!(
            "Recording stopped: {} chunks, {:.1}s, {} bytes",
            chunks.len(),
            artifact.duration_seconds,
            artifact.size()
        );
        *self.artifact.lock() = Some(artifact.clone());
        Ok(artifact)
    }

    pub fn is_recording(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Laufzeit der aktuellen oder Länge der letzten Aufnahme
    pub fn duration(&self) -> Duration {
        if let Some(active) = self.active.lock().as_ref() {
            return active.started.elapsed();
        }
        self.artifact
            .lock()
            .as_ref()
            .map(|a| Duration::from_secs_f64(a.duration_seconds))
            .unwrap_or(Duration::ZERO)
    }

    /// `data:` URL der letzten Aufnahme, nur wenn Daten gepuffert wurden
    pub fn recording_url(&self) -> Option<String> {
        if self.is_recording() || self.chunks.lock().is_empty() {
            return None;
        }
        self.artifact.lock().as_ref().map(|a| a.to_data_url())
    }

    /// Gibt das Artefakt ab (z.B. an einen Uploader)
    pub fn take_artifact(&self) -> Option<RecordingArtifact> {
        let artifact = self.artifact.lock().take();
        if artifact.is_some() {
            self.chunks.lock().clear();
        }
        artifact
    }

    /// Bricht eine laufende Aufnahme ab und verwirft alle Daten
    pub fn dispose(&self) {
        if let Some(active) = self.active.lock().take() {
            active.task.abort();
            tracing::info!("Recording cancelled");
        }
        self.chunks.lock().clear();
        self.artifact.lock().take();
    }
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for RecordingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEngine")
            .field("recording", &self.is_recording())
            .field("chunks", &self.chunks.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
