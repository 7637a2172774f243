//! Pulse Call Core - P2P Voice Calls
//!
//! Engine für Sprachanrufe zwischen zwei Teilnehmern:
//! - Signaling über einen Pub/Sub-Relay (WebSocket) mit Inbox pro Teilnehmer
//! - WebRTC für Audio und Datenkanal, Trickle-ICE mit Warteschlange
//! - Automatische Wiederverbindung mit exponentiellem Backoff
//! - Aufnahme des gemischten Gesprächs als WAV
//!
//! Der Einstiegspunkt ist [`CallOrchestrator`]; alle anderen Module sind
//! einzeln nutzbar und testbar.

pub mod config;
pub mod error;
pub mod ice;
pub mod logging;
pub mod media;
pub mod monitor;
pub mod observer;
pub mod orchestrator;
pub mod peer;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CallConfig;
pub use error::{CallError, ErrorReport};
pub use orchestrator::{CallEvent, CallMode, CallOrchestrator, EventKind, IncomingCall, RecordingEvent};
pub use session::{CallSession, TerminationReason};
pub use state::ConnectionState;
