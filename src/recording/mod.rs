//! Recording Module - Aufnahme des Gesprächs
//!
//! Dieses Modul verwaltet:
//! - die Aufnahme des gemischten Streams in kodierte Chunks
//! - das fertige Artefakt (WAV) und dessen Übergabe an einen Uploader
//!

mod artifact;
mod engine;
mod sink;

pub use artifact::{RecordingArtifact, RecordingUploader};
pub use engine::RecordingEngine;
pub use sink::{RecordingSink, WavSink};

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RecordingError {
    #[error("No stream available for recording")]
    Unavailable,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

impl From<hound::Error> for RecordingError {
    fn from(err: hound::Error) -> Self {
        RecordingError::Encoding(err.to_string())
    }
}
