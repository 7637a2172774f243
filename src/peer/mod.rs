//! Peer Module - Peer Connection Abstraktion
//!
//! Dieses Modul verwaltet:
//! - die Peer Connection (Standard: webrtc-rs)
//! - SDP Offer/Answer in der richtigen Reihenfolge
//! - Events der Verbindung (ICE Candidates, Remote Tracks, Status)

mod manager;
mod webrtc_peer;

pub use manager::{PeerConnectionManager, PeerNotification};
pub use webrtc_peer::{default_ice_servers, WebRtcPeerFactory};

use crate::media::{LocalStream, RemoteStream};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Out of order SDP operation: {0}")]
    SignalingState(String),

    #[error("No open peer connection")]
    NotOpen,

    #[error("Data channel not available")]
    DataChannelUnavailable,

    #[error("Audio codec error: {0}")]
    Codec(String),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
}

/// SDP wie im Browser: `{"type": "offer", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate wie im Browser (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<&str>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.map(str::to_string),
            sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Verbindungsstatus des Peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Rohwerte aus den Verbindungsstatistiken
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub packets_lost: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub round_trip_time_ms: Option<f64>,
}

/// Events, die eine Peer Connection auslöst
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokaler Candidate entdeckt (Trickle ICE)
    LocalCandidate(IceCandidate),
    /// Candidate-Sammlung abgeschlossen
    GatheringComplete,
    /// Verbindungsstatus geändert
    ConnectionState(PeerState),
    /// Remote Track eingetroffen; dekodierte Frames laufen über `audio`
    RemoteTrack(RemoteStream),
    /// Nachricht über den Control-Data-Channel
    Data(Bytes),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Die eigentliche Peer Connection (webrtc-rs oder Test-Doubles)
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_audio(&self, stream: &LocalStream) -> Result<(), PeerError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn stats(&self) -> Result<StatsSnapshot, PeerError>;

    async fn send_data(&self, data: Bytes) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt Peer Connections; Events gehen an `events`
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
