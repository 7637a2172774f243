//! Call-Lifecycle State Machine
//!
//! Hält den einzigen autoritativen `ConnectionState`. Alle anderen
//! Komponenten lesen ihn nur oder geben Kommandos, halten aber keinen
//! eigenen Call-Status.

use crate::observer::{Observers, Subscription};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Aktueller Status der Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Kein aktiver Anruf
    Idle,
    /// Verhandlung läuft
    Connecting,
    /// Medien fließen
    Connected,
    /// Verbindung gestört, automatische Wiederherstellung läuft
    Reconnecting,
    /// Anruf gescheitert
    Failed { reason: String },
    /// Anruf regulär beendet
    Ended,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Ended)
    }

    /// Eine Session ist aktiv, solange der Status weder idle noch terminal ist
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed { .. } => "failed",
            Self::Ended => "ended",
        }
    }

    /// Prüft, ob der Lifecycle den Übergang erlaubt.
    ///
    /// `StateManager::set_state` selbst prüft nichts; der Orchestrator nutzt
    /// diese Regeln vor jedem Übergang.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Idle, Connecting) => true,
            (Idle | Failed { .. } | Ended, Idle) => true,
            (Connecting, Connected | Failed { .. } | Ended) => true,
            (Connected, Reconnecting | Failed { .. } | Ended) => true,
            (Reconnecting, Connected | Failed { .. } | Ended) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// STATE MANAGER
// ============================================================================

struct StateInner {
    current: Mutex<ConnectionState>,
    listeners: Observers<ConnectionState>,
    timeout: Mutex<Option<PendingTimeout>>,
    generation: AtomicU64,
}

struct PendingTimeout {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Verwaltet den Call-Status und benachrichtigt Listener
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<StateInner>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StateInner {
                current: Mutex::new(ConnectionState::Idle),
                listeners: Observers::new(),
                timeout: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Gibt den aktuellen Status zurück
    pub fn state(&self) -> ConnectionState {
        self.inner.current.lock().clone()
    }

    /// Überschreibt den Status und benachrichtigt alle Listener.
    ///
    /// Bricht einen laufenden Timeout ab.
    pub fn set_state(&self, next: ConnectionState) {
        self.cancel_timeout();
        Self::apply(&self.inner, next);
    }

    /// Registriert einen Listener für Statusänderungen
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    /// Erzwingt `Idle` nach Ablauf von `after`, falls kein `set_state` dazwischenkommt
    pub fn start_timeout(&self, after: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Slot bleibt gesperrt bis der Handle eingetragen ist
        let mut slot = self.inner.timeout.lock();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;

            let still_armed = {
                let mut slot = inner.timeout.lock();
                match slot.as_ref() {
                    Some(pending) if pending.generation == generation => {
                        slot.take();
                        true
                    }
                    _ => false,
                }
            };

            if still_armed {
                tracing::info!("State timeout fired after {:?}, forcing idle", after);
                Self::apply(&inner, ConnectionState::Idle);
            }
        });

        if let Some(previous) = slot.replace(PendingTimeout { generation, handle }) {
            previous.handle.abort();
        }
    }

    pub fn has_pending_timeout(&self) -> bool {
        self.inner.timeout.lock().is_some()
    }

    /// Zurück auf `Idle`, alle Timer gelöscht
    pub fn reset(&self) {
        self.cancel_timeout();
        Self::apply(&self.inner, ConnectionState::Idle);
    }

    fn cancel_timeout(&self) {
        if let Some(pending) = self.inner.timeout.lock().take() {
            pending.handle.abort();
        }
    }

    fn apply(inner: &StateInner, next: ConnectionState) {
        {
            let mut current = inner.current.lock();
            if *current != next {
                tracing::debug!("Connection state: {} -> {}", *current, next);
            }
            *current = next.clone();
        }
        inner.listeners.notify(&next);
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("state", &self.state())
            .field("pending_timeout", &self.has_pending_timeout())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_notifies_every_listener() {
        let manager = StateManager::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&seen_a);
        let _ = manager.on_state_change(move |s| a.lock().push(s.clone()));
        let b = Arc::clone(&seen_b);
        let _ = manager.on_state_change(move |s| b.lock().push(s.clone()));

        manager.set_state(ConnectionState::Connecting);
        manager.set_state(ConnectionState::Connected);

        let expected = vec![ConnectionState::Connecting, ConnectionState::Connected];
        assert_eq!(*seen_a.lock(), expected);
        assert_eq!(*seen_b.lock(), expected);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_set_state_is_unconditional() {
        let manager = StateManager::new();
        manager.set_state(ConnectionState::Ended);
        manager.set_state(ConnectionState::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Ended.is_terminal());
        assert!(ConnectionState::Failed {
            reason: "x".to_string()
        }
        .is_terminal());
        assert!(!ConnectionState::Reconnecting.is_terminal());
        assert!(!ConnectionState::Ended.can_transition_to(&ConnectionState::Connected));
        assert!(ConnectionState::Reconnecting.can_transition_to(&ConnectionState::Connected));
        assert!(ConnectionState::Ended.can_transition_to(&ConnectionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_forces_idle() {
        let manager = StateManager::new();
        manager.set_state(ConnectionState::Connecting);
        manager.start_timeout(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!manager.has_pending_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_state_cancels_timeout() {
        let manager = StateManager::new();
        manager.set_state(ConnectionState::Connecting);
        manager.start_timeout(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.set_state(ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_timer() {
        let manager = StateManager::new();
        manager.set_state(ConnectionState::Connected);
        manager.start_timeout(Duration::from_millis(50));
        manager.reset();

        assert_eq!(manager.state(), ConnectionState::Idle);
        assert!(!manager.has_pending_timeout());
    }
}
