//! Signaling Module - Austausch der Verhandlungsnachrichten
//!
//! Dieses Modul verwaltet die Kommunikation über den Signaling-Kanal:
//! - Transport-Abstraktion (Pub/Sub nach Topic)
//! - WebSocket-Relay (mit Wiederverbindung) und In-Memory-Bus als Transporte
//! - Duplikat- und Session-Filter für eingehende Nachrichten
//!

mod channel;
mod messages;
mod transport;
mod websocket;

pub use channel::SignalingChannel;
pub use messages::*;
pub use transport::{InMemoryBus, SignalingTransport, TransportError, TransportEvent};
pub use websocket::WebSocketTransport;

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid message payload: {0}")]
    InvalidPayload(String),

    #[error("Signaling channel not initialized")]
    NotInitialized,

    #[error("No call bound to the signaling channel")]
    NoActiveCall,
}
