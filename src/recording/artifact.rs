//! Fertige Aufnahme und Übergabe an die Persistenz

use super::RecordingError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingArtifact {
    pub id: String,
    #[serde(skip)]
    pub blob: Bytes,
    pub mime_type: String,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl RecordingArtifact {
    pub fn new(blob: Bytes, mime_type: &str, duration_seconds: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            blob,
            mime_type: mime_type.to_string(),
            duration_seconds,
            created_at: Utc::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.blob.len()
    }

    /// `data:` URL für die Wiedergabe
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.blob))
    }
}

/// Übernimmt fertige Aufnahmen (Speicherung, Wiederholungen)
#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload(&self, artifact: RecordingArtifact) -> Result<(), RecordingError>;
}
