//! Peer Connection Manager
//!
//! Hüllt die Peer Connection ein, erzwingt die SDP-Reihenfolge und fächert
//! ihre Events an Listener auf.

use super::{
    IceCandidate, PeerConnection, PeerError, PeerEvent, PeerFactory, SessionDescription,
    StatsSnapshot,
};
use crate::media::{LocalStream, RemoteTrackInfo};
use crate::observer::{Observers, Subscription};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Peer-Event mit der Generation der Verbindung, von der es stammt
#[derive(Debug, Clone)]
pub struct PeerNotification {
    pub generation: u64,
    pub event: PeerEvent,
}

struct ActivePeer {
    pc: Arc<dyn PeerConnection>,
    generation: u64,
    remote_description_set: bool,
    local_media_attached: bool,
    pump: JoinHandle<()>,
}

/// Verwaltet genau eine Peer Connection pro Anrufversuch
pub struct PeerConnectionManager {
    factory: Arc<dyn PeerFactory>,
    active: Mutex<Option<ActivePeer>>,
    generation: AtomicU64,
    remote_tracks: Arc<Observers<RemoteTrackInfo>>,
    events: Arc<Observers<PeerNotification>>,
}

impl PeerConnectionManager {
    pub fn new(factory: Arc<dyn PeerFactory>) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            remote_tracks: Arc::new(Observers::new()),
            events: Arc::new(Observers::new()),
        }
    }

    /// Erstellt eine neue Peer Connection; eine bestehende wird vorher geschlossen.
    ///
    /// Gibt die Generation der neuen Verbindung zurück.
    pub async fn open(&self) -> Result<u64, PeerError> {
        self.close().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pc = self.factory.create(tx).await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let remote_tracks = Arc::clone(&self.remote_tracks);
        let events = Arc::clone(&self.events);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let PeerEvent::RemoteTrack(stream) = &event {
                    remote_tracks.notify(&stream.info);
                }
                events.notify(&PeerNotification { generation, event });
            }
        });

        *self.active.lock() = Some(ActivePeer {
            pc,
            generation,
            remote_description_set: false,
            local_media_attached: false,
            pump,
        });

        tracing::info!("Peer connection opened (generation {})", generation);
        Ok(generation)
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Generation der offenen Verbindung
    pub fn generation(&self) -> Option<u64> {
        self.active.lock().as_ref().map(|a| a.generation)
    }

    pub fn has_remote_description(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.remote_description_set)
            .unwrap_or(false)
    }

    pub fn has_local_media(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.local_media_attached)
            .unwrap_or(false)
    }

    /// Hängt den lokalen Audio-Track an (einmal pro Verbindung)
    pub async fn attach_local_stream(&self, stream: &LocalStream) -> Result<(), PeerError> {
        if self.has_local_media() {
            return Ok(());
        }

        let pc = self.connection()?;
        pc.add_local_audio(stream).await?;

        if let Some(active) = self.active.lock().as_mut() {
            active.local_media_attached = true;
        }
        Ok(())
    }

    /// Erstellt ein Offer und setzt es als Local Description
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.offer(false).await
    }

    /// Offer mit ICE Restart (neue Credentials, neue Candidates)
    pub async fn create_offer_with_restart(&self) -> Result<SessionDescription, PeerError> {
        self.offer(true).await
    }

    /// Erstellt ein Answer; erfordert vorher `set_remote_description`
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if !self.has_remote_description() {
            return Err(PeerError::SignalingState(
                "create_answer requires a remote description".to_string(),
            ));
        }

        let pc = self.connection()?;
        let answer = pc.create_answer().await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let pc = self.connection()?;
        pc.set_remote_description(desc).await?;

        if let Some(active) = self.active.lock().as_mut() {
            active.remote_description_set = true;
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let pc = self.connection()?;
        pc.add_ice_candidate(candidate).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, PeerError> {
        let pc = self.connection()?;
        pc.stats().await
    }

    pub async fn send_data(&self, data: Bytes) -> Result<(), PeerError> {
        let pc = self.connection()?;
        pc.send_data(data).await
    }

    /// Listener für eintreffende Remote Tracks
    pub fn on_remote_track<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RemoteTrackInfo) + Send + Sync + 'static,
    {
        self.remote_tracks.subscribe(listener)
    }

    /// Listener für alle Peer-Events
    pub fn on_event<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PeerNotification) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Gibt die offene Verbindung zurück (z.B. als Stats-Quelle)
    pub fn connection(&self) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.active
            .lock()
            .as_ref()
            .map(|a| Arc::clone(&a.pc))
            .ok_or(PeerError::NotOpen)
    }

    /// Schließt die Verbindung; mehrfacher Aufruf ist harmlos
    pub async fn close(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.pump.abort();
            if let Err(e) = active.pc.close().await {
                tracing::warn!("Error while closing peer connection: {}", e);
            }
            tracing::info!("Peer connection closed (generation {})", active.generation);
        }
    }

    async fn offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let pc = self.connection()?;
        let offer = pc.create_offer(ice_restart).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("generation", &self.generation())
            .field("remote_description", &self.has_remote_description())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
