//! Transport-Abstraktion (Pub/Sub nach Topic)
//!
//! Zustellung ist at-least-once und zwischen Nachrichtentypen ungeordnet.

use super::messages::SignalingMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Relay error: {code} - {message}")]
    Server { code: i32, message: String },

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Fehler, bei denen ein erneuter Versuch sinnvoll ist
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::SendFailed(_)
                | TransportError::NotConnected
                | TransportError::Disconnected(_)
        )
    }
}

/// Zustandswechsel der Verbindung zum Relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Verbindung verloren, Wiederverbindung läuft
    Disconnected { reason: String },
    /// Verbindung wiederhergestellt, Abos erneuert
    Reconnected,
    /// Endgültig getrennt; Abos enden
    Closed { reason: String },
}

impl TransportEvent {
    pub fn to_error(&self) -> Option<TransportError> {
        match self {
            TransportEvent::Disconnected { reason } => {
                Some(TransportError::Disconnected(reason.clone()))
            }
            TransportEvent::Closed { reason } => Some(TransportError::Closed(reason.clone())),
            TransportEvent::Reconnected => None,
        }
    }
}

// ============================================================================
// TRAIT
// ============================================================================

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn publish(&self, topic: &str, message: &SignalingMessage) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Verbindungsereignisse ab jetzt
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

// ============================================================================
// IN-MEMORY BUS
// ============================================================================

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<SignalingMessage>>>,
    published: Vec<(String, SignalingMessage)>,
    failures_pending: usize,
}

/// Transport im selben Prozess (Loopback, Tests)
#[derive(Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    events: broadcast::Sender<TransportEvent>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            events,
        }
    }

    /// Meldet ein Verbindungsereignis an alle Beobachter
    pub fn notify(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Trennt den Bus endgültig: alle Abos enden, `Closed` wird gemeldet
    pub fn close(&self, reason: &str) {
        self.state.lock().subscribers.clear();
        self.notify(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Alle veröffentlichten Nachrichten mit Topic, in Reihenfolge
    pub fn published(&self) -> Vec<(String, SignalingMessage)> {
        self.state.lock().published.clone()
    }

    /// Die nächsten `count` Publishes schlagen mit `SendFailed` fehl
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failures_pending = count;
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(topic)
            .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingTransport for InMemoryBus {
    async fn publish(&self, topic: &str, message: &SignalingMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }

        state.published.push((topic.to_string(), message.clone()));
        if let Some(subscribers) = state.subscribers.get_mut(topic) {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.state.lock().subscribers.remove(topic);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBus")
            .field("topics", &state.subscribers.len())
            .field("published", &state.published.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
