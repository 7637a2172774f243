//! Session Verwaltung
//!
//! Identifiziert die beiden Teilnehmer eines Anrufs, vergibt die Session-ID
//! (`{localId}-{remoteId}-{epochMillis}`) und misst die Dauer.

use crate::observer::{Observers, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Invalid session: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Parameter für eine neue Session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    #[serde(alias = "localCare4wId")]
    pub local_participant_id: String,
    #[serde(alias = "remoteCare4wId")]
    pub remote_participant_id: String,
    #[serde(default)]
    pub is_initiator: Option<bool>,
    /// Übernommene Session-ID (Angerufener übernimmt die des Anrufers)
    #[serde(default)]
    pub session_id: Option<String>,
}

impl SessionParams {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local_participant_id: local.into(),
            remote_participant_id: remote.into(),
            ..Self::default()
        }
    }

    pub fn initiator(mut self, is_initiator: bool) -> Self {
        self.is_initiator = Some(is_initiator);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    Rejected(String),
    Timeout(String),
    ReconnectionExhausted,
    Replaced,
    Error(String),
}

impl TerminationReason {
    /// Beendigung auf dieser Seite; die Gegenseite bekommt einen Hangup
    pub fn is_local(&self) -> bool {
        !matches!(self, TerminationReason::RemoteHangup | TerminationReason::Rejected(_))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::LocalHangup => write!(f, "local hangup"),
            TerminationReason::RemoteHangup => write!(f, "remote hangup"),
            TerminationReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            TerminationReason::Timeout(phase) => write!(f, "{} timeout", phase),
            TerminationReason::ReconnectionExhausted => {
                write!(f, "reconnection attempts exhausted")
            }
            TerminationReason::Replaced => write!(f, "replaced by a new call"),
            TerminationReason::Error(message) => write!(f, "error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub is_initiator: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
}

impl CallSession {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Initialized,
    Ended,
}

struct ActiveSession {
    session: CallSession,
    started: Instant,
    ended: Option<Instant>,
}

pub struct SessionManager {
    current: Mutex<Option<ActiveSession>>,
    last_stamp: Mutex<i64>,
    initialized: Observers<CallSession>,
    ended: Observers<CallSession>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            last_stamp: Mutex::new(0),
            initialized: Observers::new(),
            ended: Observers::new(),
        }
    }

    /// Beginnt eine neue Session und gibt ihre ID zurück
    pub fn initialize(&self, params: SessionParams) -> String {
        let session_id = match params.session_id {
            Some(id) => id,
            None => {
                let stamp = self.next_stamp();
                format!(
                    "{}-{}-{}",
                    params.local_participant_id, params.remote_participant_id, stamp
                )
            }
        };

        let session = CallSession {
            session_id: session_id.clone(),
            local_participant_id: params.local_participant_id,
            remote_participant_id: params.remote_participant_id,
            is_initiator: params.is_initiator.unwrap_or(false),
            started_at: Utc::now(),
            ended_at: None,
            termination_reason: None,
        };

        *self.current.lock() = Some(ActiveSession {
            session: session.clone(),
            started: Instant::now(),
            ended: None,
        });

        tracing::info!("Session initialized: {}", session_id);
        self.initialized.notify(&session);
        session_id
    }

    /// Millisekunden-Zeitstempel, streng monoton pro Manager
    fn next_stamp(&self) -> i64 {
        let mut last = self.last_stamp.lock();
        let now = Utc::now().timestamp_millis();
        let stamp = if now > *last { now } else { *last + 1 };
        *last = stamp;
        stamp
    }

    pub fn validate(&self) -> SessionValidation {
        let mut errors = Vec::new();
        match self.current.lock().as_ref() {
            None => errors.push("session not initialized".to_string()),
            Some(active) => {
                if active.session.local_participant_id.trim().is_empty() {
                    errors.push("local participant id is required".to_string());
                }
                if active.session.remote_participant_id.trim().is_empty() {
                    errors.push("remote participant id is required".to_string());
                }
            }
        }

        SessionValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Wie `validate`, aber als Fehler
    pub fn ensure_valid(&self) -> Result<(), SessionError> {
        let validation = self.validate();
        if validation.valid {
            Ok(())
        } else {
            Err(SessionError::Invalid(validation.errors))
        }
    }

    pub fn session(&self) -> Option<CallSession> {
        self.current.lock().as_ref().map(|a| a.session.clone())
    }

    pub fn session_id(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .map(|a| a.session.session_id.clone())
    }

    /// Aktive (nicht beendete) Session
    pub fn has_active_session(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map(|a| a.ended.is_none())
            .unwrap_or(false)
    }

    /// Dauer seit `initialize`, nach `end` eingefroren
    pub fn duration(&self) -> Duration {
        match self.current.lock().as_ref() {
            Some(active) => match active.ended {
                Some(ended) => ended.duration_since(active.started),
                None => active.started.elapsed(),
            },
            None => Duration::ZERO,
        }
    }

    /// Beendet die Session; nur der erste Aufruf hat Wirkung
    pub fn end(&self, reason: TerminationReason) -> Option<CallSession> {
        let session = {
            let mut current = self.current.lock();
            let active = current.as_mut()?;
            if active.ended.is_some() {
                return None;
            }
            active.ended = Some(Instant::now());
            active.session.ended_at = Some(Utc::now());
            active.session.termination_reason = Some(reason);
            active.session.clone()
        };

        tracing::info!(
            "Session ended: {} ({})",
            session.session_id,
            session
                .termination_reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default()
        );
        self.ended.notify(&session);
        Some(session)
    }

    pub fn on_event<F>(&self, kind: SessionEventKind, listener: F) -> Subscription
    where
        F: Fn(&CallSession) + Send + Sync + 'static,
    {
        match kind {
            SessionEventKind::Initialized => self.initialized.subscribe(listener),
            SessionEventKind::Ended => self.ended.subscribe(listener),
        }
    }

    /// Verwirft die Session ohne Ende-Event
    pub fn clear(&self) {
        self.current.lock().take();
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_validate_after_initialize() {
        let manager = SessionManager::new();
        let params: SessionParams =
            serde_json::from_str(r#"{"localCare4wId": "A", "remoteCare4wId": "B"}"#).unwrap();
        let id = manager.initialize(params);

        assert!(id.starts_with("A-B-"));
        let validation = manager.validate();
        assert!(validation.valid);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn test_validate_without_initialize() {
        let validation = SessionManager::new().validate();
        assert!(!validation.valid);
        assert!(!validation.errors.is_empty());
    }

    #[test]
    fn test_missing_ids_are_reported() {
        let manager = SessionManager::new();
        manager.initialize(SessionParams::new("A", ""));
        let validation = manager.validate();
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 1);
        assert!(manager.ensure_valid().is_err());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let manager = SessionManager::new();
        let first = manager.initialize(SessionParams::new("A", "B"));
        let second = manager.initialize(SessionParams::new("A", "B"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_adopted_session_id() {
        let manager = SessionManager::new();
        let id = manager.initialize(SessionParams::new("B", "A").with_session_id("A-B-42"));
        assert_eq!(id, "A-B-42");
        assert!(!manager.session().unwrap().is_initiator);
    }

    #[test]
    fn test_end_is_idempotent_and_freezes_duration() {
        let manager = SessionManager::new();
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ended);
        let _ = manager.on_event(SessionEventKind::Ended, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.initialize(SessionParams::new("A", "B").initiator(true));
        let session = manager.end(TerminationReason::LocalHangup).unwrap();
        assert_eq!(session.termination_reason, Some(TerminationReason::LocalHangup));
        assert!(manager.end(TerminationReason::RemoteHangup).is_none());
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        let frozen = manager.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(manager.duration(), frozen);
        assert!(!manager.has_active_session());
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(
            TerminationReason::ReconnectionExhausted.to_string(),
            "reconnection attempts exhausted"
        );
        assert!(TerminationReason::Timeout("connection".into()).is_local());
        assert!(!TerminationReason::RemoteHangup.is_local());
    }
}
