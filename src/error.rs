//! Fehler-Taxonomie des Call-Cores

use crate::media::MediaError;
use crate::peer::PeerError;
use crate::recording::RecordingError;
use crate::session::SessionError;
use crate::signaling::{SignalingError, TransportError};
use thiserror::Error;

/// Verhandlungsphase, deren Timeout abgelaufen ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationPhase {
    Gathering,
    Connection,
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationPhase::Gathering => write!(f, "ICE gathering"),
            NegotiationPhase::Connection => write!(f, "connection"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    #[error("SDP operation out of order: {0}")]
    SignalingState(String),

    #[error("{phase} timed out")]
    NegotiationTimeout { phase: NegotiationPhase },

    #[error("Signaling transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Recording unavailable: no stream to record")]
    RecordingUnavailable,

    #[error("Recording failed: {0}")]
    Recording(RecordingError),

    #[error("A call is already active")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Call engine not initialized")]
    NotInitialized,

    #[error("A carrier call is active")]
    CarrierCallActive,

    #[error("Invalid session: {0}")]
    InvalidSession(#[from] SessionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Peer connection error: {0}")]
    Peer(PeerError),

    #[error("Signaling error: {0}")]
    Signaling(String),
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::SignalingState(message) => CallError::SignalingState(message),
            other => CallError::Peer(other),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Transport(e) => CallError::Transport(e),
            SignalingError::NotInitialized => CallError::NotInitialized,
            SignalingError::NoActiveCall => CallError::NoActiveCall,
            other => CallError::Signaling(other.to_string()),
        }
    }
}

impl From<RecordingError> for CallError {
    fn from(err: RecordingError) -> Self {
        match err {
            RecordingError::Unavailable => CallError::RecordingUnavailable,
            other => CallError::Recording(other),
        }
    }
}

/// Fehler in der Form, wie sie an `Error`-Listener geht
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
}

impl From<&CallError> for ErrorReport {
    fn from(err: &CallError) -> Self {
        let kind = match err {
            CallError::MediaAccess(_) => "media_access",
            CallError::SignalingState(_) => "signaling_state",
            CallError::NegotiationTimeout { .. } => "negotiation_timeout",
            CallError::Transport(_) => "transport",
            CallError::RecordingUnavailable | CallError::Recording(_) => "recording",
            CallError::AlreadyInCall => "already_in_call",
            CallError::NoActiveCall => "no_active_call",
            CallError::NotInitialized => "not_initialized",
            CallError::CarrierCallActive => "carrier_call_active",
            CallError::InvalidSession(_) => "invalid_session",
            CallError::InvalidInput(_) => "invalid_input",
            CallError::Peer(_) => "peer",
            CallError::Signaling(_) => "signaling",
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}
