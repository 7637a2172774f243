//! Media Module - lokale Aufnahme und Remote Audio
//!
//! Dieses Modul verwaltet:
//! - Mikrofon Capture und Lautsprecher-Wiedergabe (cpal)
//! - Opus-Kodierung der 20ms Frames
//! - Mute über das `enabled` Flag des Audio-Tracks
//! - den Remote Audio Stream, sobald er eintrifft
//! - den gemischten Stream für die Aufnahme

mod audio;
mod codec;
mod manager;
mod stream;

pub use audio::{resample_linear, CpalCapture, CpalPlayback, FRAME_SIZE, SAMPLE_RATE};
pub use codec::{FrameDecoder, FrameEncoder};
pub use manager::MediaManager;
pub use stream::{
    mix_streams, AudioFrame, AudioStream, AudioTrack, CaptureDevice, CaptureHandle, LocalStream,
    NullCapture, PlaybackDevice, PlaybackHandle, RemoteStream, RemoteTrackInfo,
};

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("No capture device available")]
    NoCaptureDevice,

    #[error("No playback device available")]
    NoPlaybackDevice,

    #[error("Capture device error: {0}")]
    Device(String),

    #[error("No local stream acquired")]
    NoLocalStream,

    #[error("Opus codec error: {0}")]
    Codec(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Wünsche an die Mikrofon-Aufnahme
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    /// Gerätename, `None` = Standardgerät
    pub device_name: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            device_name: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}
