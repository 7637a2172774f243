//! Zwei Orchestratoren telefonieren über den In-Memory-Bus miteinander.
//!
//! Die Peers verbinden sich selbst, sobald beide SDPs gesetzt sind und ein
//! Kandidat der Gegenseite angekommen ist.

use async_trait::async_trait;
use bytes::Bytes;
use call_core::media::{LocalStream, NullCapture};
use call_core::peer::{
    IceCandidate, PeerConnection, PeerError, PeerEvent, PeerFactory, PeerState,
    SessionDescription, StatsSnapshot,
};
use call_core::signaling::InMemoryBus;
use call_core::{CallConfig, CallEvent, CallOrchestrator, ConnectionState, TerminationReason};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Progress {
    local_set: bool,
    remote_set: bool,
    candidates: usize,
    connected: bool,
}

struct LoopbackPeer {
    name: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    progress: Mutex<Progress>,
}

impl LoopbackPeer {
    fn maybe_connect(&self) {
        let mut progress = self.progress.lock();
        if progress.connected
            || !progress.local_set
            || !progress.remote_set
            || progress.candidates == 0
        {
            return;
        }
        progress.connected = true;
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerState::Connected));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_local_audio(&self, _stream: &LocalStream) -> Result<(), PeerError> {
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::offer(format!(
            "v=0 {} restart={}",
            self.name, ice_restart
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        Ok(SessionDescription::answer(format!("v=0 {}", self.name)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), PeerError> {
        self.progress.lock().local_set = true;
        let candidate = IceCandidate::new(
            format!("candidate:1 1 udp 2130706431 127.0.0.1 9 typ host ufrag {}", self.name),
            Some("0"),
            Some(0),
        );
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        let _ = self.events.send(PeerEvent::GatheringComplete);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), PeerError> {
        self.progress.lock().remote_set = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        self.progress.lock().candidates += 1;
        self.maybe_connect();
        Ok(())
    }

    async fn stats(&self) -> Result<StatsSnapshot, PeerError> {
        Ok(StatsSnapshot::default())
    }

    async fn send_data(&self, _data: Bytes) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        Ok(())
    }
}

struct LoopbackFactory {
    name: String,
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        Ok(Arc::new(LoopbackPeer {
            name: self.name.clone(),
            events,
            progress: Mutex::new(Progress::default()),
        }))
    }
}

async fn participant(bus: &InMemoryBus, id: &str) -> CallOrchestrator {
    let orchestrator = CallOrchestrator::new(
        CallConfig::default(),
        Arc::new(NullCapture),
        Arc::new(LoopbackFactory {
            name: id.to_string(),
        }),
    );
    orchestrator
        .initialize(Arc::new(bus.clone()), id)
        .await
        .unwrap();
    orchestrator
}

async fn wait_for<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_call_connects_and_hangs_up() {
    let bus = InMemoryBus::new();
    let alice = participant(&bus, "alice").await;
    let bob = participant(&bus, "bob").await;

    // Bob nimmt jeden Anruf an
    let mut bob_events = bob.subscribe();
    let acceptor = bob.clone();
    tokio::spawn(async move {
        while let Ok(event) = bob_events.recv().await {
            if let CallEvent::IncomingCall(call) = event {
                acceptor.accept_call(call).await.unwrap();
            }
        }
    });

    let session_id = alice.make_call("bob").await.unwrap();
    wait_for(|| {
        alice.state() == ConnectionState::Connected && bob.state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(bob.active_session().unwrap().session_id, session_id);

    let ended = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&ended);
    let _subscription = bob.on(call_core::EventKind::CallEnd, move |event| {
        if let CallEvent::CallEnd(session) = event {
            *sink.lock() = session.termination_reason.clone();
        }
    });

    alice.hangup().await.unwrap();
    wait_for(|| bob.state() == ConnectionState::Ended).await;
    assert_eq!(alice.state(), ConnectionState::Ended);
    assert_eq!(*ended.lock(), Some(TerminationReason::RemoteHangup));

    alice.dispose().await;
    bob.dispose().await;
}

#[tokio::test]
async fn test_unknown_participant_never_connects() {
    let bus = InMemoryBus::new();
    let alice = participant(&bus, "alice").await;

    alice.make_call("nobody").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.state(), ConnectionState::Connecting);

    alice.hangup().await.unwrap();
    assert_eq!(alice.state(), ConnectionState::Ended);
    assert!(alice.active_session().is_none());
}
