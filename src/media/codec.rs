//! Opus Codec für den Audio-Track
//!
//! Der Encoder schneidet beliebig große Blöcke in 20ms Frames, der Decoder
//! liefert pro RTP-Payload die dekodierten Mono-Samples (48kHz).

use super::{MediaError, FRAME_SIZE, SAMPLE_RATE};
use bytes::Bytes;
use opus::{Application, Channels, Decoder, Encoder};

/// Obergrenze für ein kodiertes Paket (RFC 6716 empfiehlt 4000 Byte)
const MAX_PACKET_SIZE: usize = 4000;

/// 120ms @ 48kHz, längster Opus-Frame
const MAX_DECODED_SAMPLES: usize = 5760;

/// Kodiert 48kHz Mono in 20ms Opus-Pakete
pub struct FrameEncoder {
    encoder: Encoder,
    pending: Vec<f32>,
    packet: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> Result<Self, MediaError> {
        let encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| MediaError::Codec(e.to_string()))?;
        Ok(Self {
            encoder,
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            packet: vec![0; MAX_PACKET_SIZE],
        })
    }

    /// Nimmt Samples auf und gibt alle jetzt vollständigen Pakete zurück;
    /// ein Rest unter 20ms wartet auf den nächsten Aufruf
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<Bytes>, MediaError> {
        self.pending.extend_from_slice(samples);

        let mut packets = Vec::new();
        while self.pending.len() >= FRAME_SIZE {
            let len = self
                .encoder
                .encode_float(&self.pending[..FRAME_SIZE], &mut self.packet)
                .map_err(|e| MediaError::Codec(e.to_string()))?;
            packets.push(Bytes::copy_from_slice(&self.packet[..len]));
            self.pending.drain(..FRAME_SIZE);
        }
        Ok(packets)
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for FrameEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameEncoder")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Dekodiert Opus-Pakete zu 48kHz Mono
pub struct FrameDecoder {
    decoder: Decoder,
    output: Vec<f32>,
}

impl FrameDecoder {
    pub fn new() -> Result<Self, MediaError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| MediaError::Codec(e.to_string()))?;
        Ok(Self {
            decoder,
            output: vec![0.0; MAX_DECODED_SAMPLES],
        })
    }

    /// Ein Paket dekodieren; ein leeres Paket fordert Verlustverschleierung an
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, MediaError> {
        let len = self
            .decoder
            .decode_float(payload, &mut self.output, false)
            .map_err(|e| MediaError::Codec(e.to_string()))?;
        Ok(self.output[..len].to_vec())
    }

    /// Dekodiert, bei defektem Paket wird ein verschleierter Frame geliefert
    pub fn decode_or_conceal(&mut self, payload: &[u8]) -> Option<Vec<f32>> {
        match self.decode(payload) {
            Ok(samples) => Some(samples),
            Err(e) => {
                tracing::warn!("Opus decode error: {}", e);
                self.decode(&[]).ok()
            }
        }
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / SAMPLE_RATE as f32).sin() * 0.3)
            .collect()
    }

    #[test]
    fn test_partial_frames_wait_for_more_samples() {
        let mut encoder = FrameEncoder::new().unwrap();
        assert!(encoder.push(&tone(500)).unwrap().is_empty());
        assert_eq!(encoder.pending_samples(), 500);

        // 500 + 1500 = 2 Frames + 80 Samples Rest
        let packets = encoder.push(&tone(1500)).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(encoder.pending_samples(), 80);
        assert!(packets.iter().all(|p| !p.is_empty() && p.len() <= MAX_PACKET_SIZE));
    }

    #[test]
    fn test_packets_decode_to_full_frames() {
        let mut encoder = FrameEncoder::new().unwrap();
        let mut decoder = FrameDecoder::new().unwrap();

        let packets = encoder.push(&tone(FRAME_SIZE * 3)).unwrap();
        assert_eq!(packets.len(), 3);
        for packet in &packets {
            assert_eq!(decoder.decode(packet).unwrap().len(), FRAME_SIZE);
        }

        // Nach dem Einschwingen trägt der Frame wieder Signal
        let last = decoder.decode(&packets[2]).unwrap();
        assert!(last.iter().any(|s| s.abs() > 0.01));
    }

    #[test]
    fn test_lost_packet_is_concealed() {
        let mut encoder = FrameEncoder::new().unwrap();
        let mut decoder = FrameDecoder::new().unwrap();
        let packets = encoder.push(&tone(FRAME_SIZE)).unwrap();
        decoder.decode(&packets[0]).unwrap();

        let concealed = decoder.decode_or_conceal(&[]).unwrap();
        assert_eq!(concealed.len(), FRAME_SIZE);
    }
}
