//! ICE Candidate Verwaltung
//!
//! Lokale Candidates werden beim Entdecken gesammelt (Trickle ICE). Remote
//! Candidates, die vor der Remote Description eintreffen, werden gepuffert und
//! danach genau einmal in Ankunftsreihenfolge angewendet.

use crate::observer::{Observers, Subscription};
use crate::peer::IceCandidate;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

/// Timeouts für Candidate-Sammlung und Verbindungsaufbau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceConfig {
    pub gathering_timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            gathering_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IceCandidateRecord {
    pub candidate: IceCandidate,
    pub origin: CandidateOrigin,
    pub collected_at: DateTime<Utc>,
}

impl IceCandidateRecord {
    fn new(candidate: IceCandidate, origin: CandidateOrigin) -> Self {
        Self {
            candidate,
            origin,
            collected_at: Utc::now(),
        }
    }
}

/// Ergebnis von [`IceManager::queue_remote_candidate`]
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCandidateDisposition {
    /// Remote Description fehlt noch, Candidate wurde gepuffert
    Queued,
    /// Sofort auf die Peer Connection anwenden
    Apply(IceCandidateRecord),
    /// Schon bekannt, ignoriert
    Duplicate,
}

#[derive(Default)]
struct IceState {
    local: Vec<IceCandidateRecord>,
    pending_remote: VecDeque<IceCandidateRecord>,
    applied_remote: Vec<IceCandidateRecord>,
    seen_remote: HashSet<IceCandidate>,
    remote_description_set: bool,
}

pub struct IceManager {
    config: IceConfig,
    state: Mutex<IceState>,
    listeners: Observers<IceCandidateRecord>,
}

impl IceManager {
    pub fn new(config: IceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(IceState::default()),
            listeners: Observers::new(),
        }
    }

    pub fn config(&self) -> IceConfig {
        self.config
    }

    /// Speichert einen lokal entdeckten Candidate
    pub fn collect_local_candidate(&self, candidate: IceCandidate) -> IceCandidateRecord {
        let record = IceCandidateRecord::new(candidate, CandidateOrigin::Local);
        self.state.lock().local.push(record.clone());
        tracing::debug!("Local ICE candidate: {}", record.candidate.candidate);
        self.listeners.notify(&record);
        record
    }

    /// Nimmt einen Remote Candidate entgegen
    pub fn queue_remote_candidate(&self, candidate: IceCandidate) -> RemoteCandidateDisposition {
        let record = {
            let mut state = self.state.lock();
            if !state.seen_remote.insert(candidate.clone()) {
                tracing::debug!("Duplicate remote ICE candidate ignored");
                return RemoteCandidateDisposition::Duplicate;
            }

            let record = IceCandidateRecord::new(candidate, CandidateOrigin::Remote);
            if !state.remote_description_set {
                state.pending_remote.push_back(record);
                tracing::debug!(
                    "Remote ICE candidate queued ({} pending)",
                    state.pending_remote.len()
                );
                return RemoteCandidateDisposition::Queued;
            }

            state.applied_remote.push(record.clone());
            record
        };

        self.listeners.notify(&record);
        RemoteCandidateDisposition::Apply(record)
    }

    /// Markiert die Remote Description als gesetzt.
    ///
    /// Gibt die gepufferten Candidates in Ankunftsreihenfolge zurück; ein
    /// zweiter Aufruf liefert eine leere Liste.
    pub fn mark_remote_description_set(&self) -> Vec<IceCandidateRecord> {
        let flushed: Vec<IceCandidateRecord> = {
            let mut state = self.state.lock();
            state.remote_description_set = true;
            let flushed: Vec<_> = state.pending_remote.drain(..).collect();
            state.applied_remote.extend(flushed.iter().cloned());
            flushed
        };

        if !flushed.is_empty() {
            tracing::debug!("Flushing {} queued remote ICE candidates", flushed.len());
        }
        for record in &flushed {
            self.listeners.notify(record);
        }
        flushed
    }

    pub fn is_remote_description_set(&self) -> bool {
        self.state.lock().remote_description_set
    }

    pub fn local_candidates(&self) -> Vec<IceCandidateRecord> {
        self.state.lock().local.clone()
    }

    pub fn pending_remote_count(&self) -> usize {
        self.state.lock().pending_remote.len()
    }

    pub fn applied_remote_candidates(&self) -> Vec<IceCandidateRecord> {
        self.state.lock().applied_remote.clone()
    }

    /// Listener für lokale und angewendete Remote Candidates
    pub fn on_candidate<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&IceCandidateRecord) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Verwirft alle Candidates (zwischen zwei Anrufversuchen)
    pub fn reset(&self) {
        *self.state.lock() = IceState::default();
    }
}

impl Default for IceManager {
    fn default() -> Self {
        Self::new(IceConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate::new(
            format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000{} typ host", n, n, n),
            Some("0"),
            Some(0),
        )
    }

    #[test]
    fn test_remote_candidates_flush_in_order_once() {
        let ice = IceManager::default();
        assert_eq!(ice.queue_remote_candidate(candidate(1)), RemoteCandidateDisposition::Queued);
        assert_eq!(ice.queue_remote_candidate(candidate(2)), RemoteCandidateDisposition::Queued);
        assert_eq!(ice.queue_remote_candidate(candidate(3)), RemoteCandidateDisposition::Queued);

        let flushed = ice.mark_remote_description_set();
        let order: Vec<_> = flushed.iter().map(|r| r.candidate.clone()).collect();
        assert_eq!(order, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(flushed.iter().all(|r| r.origin == CandidateOrigin::Remote));

        assert!(ice.mark_remote_description_set().is_empty());
        assert_eq!(ice.applied_remote_candidates().len(), 3);
    }

    #[test]
    fn test_candidate_after_description_applies_immediately() {
        let ice = IceManager::default();
        ice.mark_remote_description_set();

        match ice.queue_remote_candidate(candidate(4)) {
            RemoteCandidateDisposition::Apply(record) => assert_eq!(record.candidate, candidate(4)),
            other => panic!("unexpected disposition: {:?}", other),
        }
        assert_eq!(ice.pending_remote_count(), 0);
    }

    #[test]
    fn test_duplicate_remote_candidate_is_ignored() {
        let ice = IceManager::default();
        ice.queue_remote_candidate(candidate(1));
        assert_eq!(
            ice.queue_remote_candidate(candidate(1)),
            RemoteCandidateDisposition::Duplicate
        );
        assert_eq!(ice.mark_remote_description_set().len(), 1);
        assert_eq!(
            ice.queue_remote_candidate(candidate(1)),
            RemoteCandidateDisposition::Duplicate
        );
    }

    #[test]
    fn test_listeners_see_local_and_remote() {
        let ice = IceManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _ = ice.on_candidate(move |r| sink.lock().push(r.origin));

        ice.collect_local_candidate(candidate(1));
        ice.queue_remote_candidate(candidate(2));
        assert_eq!(seen.lock().len(), 1);

        ice.mark_remote_description_set();
        assert_eq!(*seen.lock(), vec![CandidateOrigin::Local, CandidateOrigin::Remote]);
        assert_eq!(ice.local_candidates().len(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let ice = IceManager::default();
        ice.collect_local_candidate(candidate(1));
        ice.queue_remote_candidate(candidate(2));
        ice.mark_remote_description_set();

        ice.reset();
        assert!(!ice.is_remote_description_set());
        assert!(ice.local_candidates().is_empty());
        assert_eq!(ice.queue_remote_candidate(candidate(2)), RemoteCandidateDisposition::Queued);
    }
}
