//! Encoder für die Aufnahme

use super::RecordingError;
use crate::media::{AudioFrame, SAMPLE_RATE};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Wandelt Frames in Chunks und Chunks in das fertige Artefakt
pub trait RecordingSink: Send {
    fn mime_type(&self) -> &str;

    fn start(&mut self, sample_rate: u32) -> Result<(), RecordingError>;

    /// Kodiert einen Frame; `None` wenn (noch) kein Chunk entsteht
    fn push_chunk(&mut self, frame: &AudioFrame) -> Result<Option<Bytes>, RecordingError>;

    fn finish(&mut self, chunks: &[Bytes]) -> Result<Bytes, RecordingError>;
}

/// 16-bit PCM mono in einer WAV-Datei (hound)
#[derive(Debug)]
pub struct WavSink {
    sample_rate: u32,
}

impl WavSink {
    pub fn new() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
        }
    }
}

impl Default for WavSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink for WavSink {
    fn mime_type(&self) -> &str {
        "audio/wav"
    }

    fn start(&mut self, sample_rate: u32) -> Result<(), RecordingError> {
        if sample_rate == 0 {
            return Err(RecordingError::Encoding("sample rate must be positive".to_string()));
        }
        self.sample_rate = sample_rate;
        Ok(())
    }

    fn push_chunk(&mut self, frame: &AudioFrame) -> Result<Option<Bytes>, RecordingError> {
        if frame.samples.is_empty() {
            return Ok(None);
        }

        let mut chunk = BytesMut::with_capacity(frame.samples.len() * 2);
        for sample in &frame.samples {
            chunk.put_i16_le((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
        }
        Ok(Some(chunk.freeze()))
    }

    fn finish(&mut self, chunks: &[Bytes]) -> Result<Bytes, RecordingError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut buffer = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)?;
            for chunk in chunks {
                for pair in chunk.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
            }
            writer.finalize()?;
        }
        Ok(Bytes::from(buffer))
    }
}
