//! Test-Doubles für die Peer Connection

use crate::media::LocalStream;
use crate::peer::{
    IceCandidate, PeerConnection, PeerError, PeerEvent, PeerFactory, SessionDescription,
    StatsSnapshot,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Peer ohne Netzwerk; zeichnet alle Aufrufe auf
pub struct FakePeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    sent: Mutex<Vec<Bytes>>,
    stats: Mutex<StatsSnapshot>,
    offers: Mutex<Vec<bool>>,
    tracks: Mutex<usize>,
    closed: Mutex<bool>,
}

impl FakePeer {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            events,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            stats: Mutex::new(StatsSnapshot::default()),
            offers: Mutex::new(Vec::new()),
            tracks: Mutex::new(0),
            closed: Mutex::new(false),
        }
    }

    /// Löst ein Event aus, als käme es von der echten Verbindung
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn sent_data(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// ICE-Restart-Flag jedes erzeugten Offers
    pub fn offers(&self) -> Vec<bool> {
        self.offers.lock().clone()
    }

    pub fn set_stats(&self, stats: StatsSnapshot) {
        *self.stats.lock() = stats;
    }

    pub fn attached_tracks(&self) -> usize {
        *self.tracks.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_audio(&self, _stream: &LocalStream) -> Result<(), PeerError> {
        *self.tracks.lock() += 1;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let mut offers = self.offers.lock();
        offers.push(ice_restart);
        Ok(SessionDescription::offer(format!("v=0 fake-offer {}", offers.len())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, PeerError> {
        Ok(self.stats.lock().clone())
    }

    async fn send_data(&self, data: Bytes) -> Result<(), PeerError> {
        if *self.closed.lock() {
            return Err(PeerError::DataChannelUnavailable);
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

/// Erzeugt `FakePeer`s und merkt sich alle
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(FakePeer::new(events));
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}
