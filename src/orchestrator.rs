//! Call Orchestrator
//!
//! Verbindet alle Komponenten zu einem Anruf. Es gibt genau eine aktive
//! Session. Eingehende Signale, Peer-Events und Timer landen in einer Queue,
//! die ein einzelner Driver-Task abarbeitet; Befehle der Anwendung und der
//! Driver teilen sich einen Operations-Lock, so dass Zustandsübergänge nie
//! parallel laufen.

use crate::config::CallConfig;
use crate::error::{CallError, ErrorReport, NegotiationPhase};
use crate::ice::{IceManager, RemoteCandidateDisposition};
use crate::media::{CaptureDevice, MediaError, MediaManager, PlaybackDevice, RemoteTrackInfo};
use crate::monitor::{BackoffPolicy, ConnectionMonitor, QualityReport};
use crate::observer::{Observers, Subscription};
use crate::peer::{
    PeerConnectionManager, PeerError, PeerEvent, PeerFactory, PeerNotification, PeerState,
    SessionDescription,
};
use crate::recording::{RecordingArtifact, RecordingEngine, RecordingUploader};
use crate::session::{CallSession, SessionManager, SessionParams, TerminationReason};
use crate::signaling::{
    MessageType, SignalingChannel, SignalingMessage, SignalingTransport, TransportError,
};
use crate::state::{ConnectionState, StateManager};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Erlaubte DTMF-Zeichen (`,` = Pause)
const DTMF_DIGITS: &str = "0123456789*#ABCD,";

/// Hangup-Gründe, bei denen die Gegenseite den Anruf nie angenommen hat
const REJECTION_REASONS: [&str; 2] = ["busy", "rejected"];

/// Anzahl gemerkter beendeter Sessions (späte Offers werden abgewiesen)
const ENDED_SESSION_CAPACITY: usize = 32;

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateChange,
    CallStart,
    CallEnd,
    RemoteTrack,
    Error,
    IncomingCall,
    Quality,
    Recording,
    Data,
}

/// Eingehender, noch nicht angenommener Anruf
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub session_id: String,
    pub caller_id: String,
    pub offer: SessionDescription,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RecordingEvent {
    Started,
    Stopped {
        id: String,
        duration_seconds: f64,
        size: usize,
    },
    Uploaded {
        id: String,
    },
    Failed {
        message: String,
    },
}

/// Alles, was die Anwendung vom Orchestrator hört
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChange(ConnectionState),
    CallStart(CallSession),
    CallEnd(CallSession),
    RemoteTrack(RemoteTrackInfo),
    Error(ErrorReport),
    IncomingCall(IncomingCall),
    /// Anrufer hat aufgelegt, bevor angenommen wurde
    IncomingCallCancelled { session_id: String },
    Quality(QualityReport),
    Recording(RecordingEvent),
    Data(Bytes),
}

impl CallEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CallEvent::StateChange(_) => EventKind::StateChange,
            CallEvent::CallStart(_) => EventKind::CallStart,
            CallEvent::CallEnd(_) => EventKind::CallEnd,
            CallEvent::RemoteTrack(_) => EventKind::RemoteTrack,
            CallEvent::Error(_) => EventKind::Error,
            CallEvent::IncomingCall(_) | CallEvent::IncomingCallCancelled { .. } => {
                EventKind::IncomingCall
            }
            CallEvent::Quality(_) => EventKind::Quality,
            CallEvent::Recording(_) => EventKind::Recording,
            CallEvent::Data(_) => EventKind::Data,
        }
    }
}

/// Wie der aktuelle Anruf geführt wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    PeerToPeer,
    CarrierBridged,
}

/// Listener pro Event-Art plus ein Broadcast für alle
struct EventHub {
    state_change: Observers<CallEvent>,
    call_start: Observers<CallEvent>,
    call_end: Observers<CallEvent>,
    remote_track: Observers<CallEvent>,
    error: Observers<CallEvent>,
    incoming_call: Observers<CallEvent>,
    quality: Observers<CallEvent>,
    recording: Observers<CallEvent>,
    data: Observers<CallEvent>,
    all: broadcast::Sender<CallEvent>,
}

impl EventHub {
    fn new() -> Self {
        let (all, _) = broadcast::channel(256);
        Self {
            state_change: Observers::new(),
            call_start: Observers::new(),
            call_end: Observers::new(),
            remote_track: Observers::new(),
            error: Observers::new(),
            incoming_call: Observers::new(),
            quality: Observers::new(),
            recording: Observers::new(),
            data: Observers::new(),
            all,
        }
    }

    fn list(&self, kind: EventKind) -> &Observers<CallEvent> {
        match kind {
            EventKind::StateChange => &self.state_change,
            EventKind::CallStart => &self.call_start,
            EventKind::CallEnd => &self.call_end,
            EventKind::RemoteTrack => &self.remote_track,
            EventKind::Error => &self.error,
            EventKind::IncomingCall => &self.incoming_call,
            EventKind::Quality => &self.quality,
            EventKind::Recording => &self.recording,
            EventKind::Data => &self.data,
        }
    }

    fn emit(&self, event: CallEvent) {
        self.list(event.kind()).notify(&event);
        // Ohne Empfänger ist das kein Fehler
        let _ = self.all.send(event);
    }
}

// ============================================================================
// DRIVER INPUT
// ============================================================================

enum Inbound {
    Signal(SignalingMessage),
    Peer(PeerNotification),
    Timeout {
        session_id: String,
        phase: NegotiationPhase,
    },
    ReconnectDue {
        session_id: String,
        attempt: u32,
    },
    RingTimeout {
        session_id: String,
    },
    Transport(TransportError),
}

/// Zustand des laufenden Anrufversuchs, der in keiner Komponente lebt
#[derive(Default)]
struct CallContext {
    local_id: Option<String>,
    pending_incoming: Option<IncomingCall>,
    has_connected: bool,
    awaiting_answer: bool,
    timers: HashMap<NegotiationPhase, JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    ring_timer: Option<JoinHandle<()>>,
    ended_sessions: VecDeque<String>,
}

impl CallContext {
    fn cancel_timers(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.cancel_ring_timer();
    }

    fn cancel_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    /// Entnimmt den klingelnden Anruf, wenn er zur Session gehört
    fn take_pending(&mut self, session_id: &str) -> Option<IncomingCall> {
        let matches = self
            .pending_incoming
            .as_ref()
            .map(|p| p.session_id == session_id)
            .unwrap_or(false);
        if !matches {
            return None;
        }
        self.cancel_ring_timer();
        self.pending_incoming.take()
    }

    fn remember_ended(&mut self, session_id: &str) {
        if self.ended_sessions.iter().any(|id| id == session_id) {
            return;
        }
        self.ended_sessions.push_back(session_id.to_string());
        if self.ended_sessions.len() > ENDED_SESSION_CAPACITY {
            self.ended_sessions.pop_front();
        }
    }

    fn has_ended(&self, session_id: &str) -> bool {
        self.ended_sessions.iter().any(|id| id == session_id)
    }

    fn reset_call(&mut self) {
        self.cancel_timers();
        self.has_connected = false;
        self.awaiting_answer = false;
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

struct Inner {
    config: CallConfig,
    state: StateManager,
    media: MediaManager,
    ice: IceManager,
    signaling: SignalingChannel,
    session: SessionManager,
    peer: PeerConnectionManager,
    monitor: ConnectionMonitor,
    recording: RecordingEngine,
    uploader: Mutex<Option<Arc<dyn RecordingUploader>>>,
    events: Arc<EventHub>,
    op_lock: tokio::sync::Mutex<()>,
    ctx: Mutex<CallContext>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    carrier_active: AtomicBool,
    disposed: AtomicBool,
}

/// Einstiegspunkt für die Anwendung.
///
/// Klonen ist billig; alle Klone teilen denselben Anruf.
#[derive(Clone)]
pub struct CallOrchestrator {
    inner: Arc<Inner>,
}

impl CallOrchestrator {
    /// Baut alle Komponenten auf; Netzwerk gibt es erst mit `initialize`
    pub fn new(
        config: CallConfig,
        capture: Arc<dyn CaptureDevice>,
        peer_factory: Arc<dyn PeerFactory>,
    ) -> Self {
        let events = Arc::new(EventHub::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let monitor_config = config.monitor_config();

        let state = StateManager::new();
        let media = MediaManager::new(capture);
        let ice = IceManager::new(config.ice_config());
        let signaling = SignalingChannel::with_retry(BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::from(&monitor_config)
        });
        let session = SessionManager::new();
        let peer = PeerConnectionManager::new(peer_factory);
        let monitor = ConnectionMonitor::new(monitor_config);
        let recording = RecordingEngine::new();

        let mut subscriptions = Vec::new();

        let hub = Arc::clone(&events);
        subscriptions.push(state.on_state_change(move |next| {
            hub.emit(CallEvent::StateChange(next.clone()));
        }));

        let tx = inbound_tx.clone();
        subscriptions.push(peer.on_event(move |notification| {
            let _ = tx.send(Inbound::Peer(notification.clone()));
        }));

        let hub = Arc::clone(&events);
        subscriptions.push(monitor.on_quality(move |report| {
            hub.emit(CallEvent::Quality(report.clone()));
        }));
        subscriptions.push(monitor.on_degradation(|report| {
            tracing::warn!(
                "Call quality degraded: loss {:.1}%, rtt {:?} ms",
                report.loss_ratio * 100.0,
                report.sample.round_trip_time_ms
            );
        }));

        Self {
            inner: Arc::new(Inner {
                config,
                state,
                media,
                ice,
                signaling,
                session,
                peer,
                monitor,
                recording,
                uploader: Mutex::new(None),
                events,
                op_lock: tokio::sync::Mutex::new(()),
                ctx: Mutex::new(CallContext::default()),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                driver: Mutex::new(None),
                subscriptions: Mutex::new(subscriptions),
                carrier_active: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Empfänger für fertige Aufnahmen
    pub fn set_uploader(&self, uploader: Arc<dyn RecordingUploader>) {
        *self.inner.uploader.lock() = Some(uploader);
    }

    /// Ausgabegerät für das Remote-Audio
    pub fn set_playback(&self, playback: Arc<dyn PlaybackDevice>) {
        self.inner.media.set_playback(playback);
    }

    /// Verbindet das Signaling und startet den Driver
    pub async fn initialize(
        &self,
        transport: Arc<dyn SignalingTransport>,
        local_participant_id: &str,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(CallError::NotInitialized);
        }
        if local_participant_id.trim().is_empty() {
            return Err(CallError::InvalidInput(
                "local participant id is required".to_string(),
            ));
        }

        let _guard = inner.op_lock.lock().await;
        inner
            .signaling
            .initialize(transport, local_participant_id)
            .await?;

        let tx = inner.inbound_tx.clone();
        let forward = move |msg: SignalingMessage| {
            let _ = tx.send(Inbound::Signal(msg));
        };
        inner.signaling.on_offer(forward.clone());
        inner.signaling.on_answer(forward.clone());
        inner.signaling.on_candidate(forward.clone());
        inner.signaling.on_hangup(forward);

        let tx = inner.inbound_tx.clone();
        inner.signaling.on_error(move |err| {
            let _ = tx.send(Inbound::Transport(err));
        });

        if let Some(mut rx) = inner.inbound_rx.lock().take() {
            let weak = Arc::downgrade(&self.inner);
            let handle = tokio::spawn(async move {
                while let Some(inbound) = rx.recv().await {
                    match weak.upgrade() {
                        Some(inner) => inner.handle(inbound).await,
                        None => break,
                    }
                }
            });
            *inner.driver.lock() = Some(handle);
        }

        inner.ctx.lock().local_id = Some(local_participant_id.to_string());
        tracing::info!("Call orchestrator ready for {}", local_participant_id);
        Ok(())
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Ruft `target` an und gibt die Session-ID zurück
    pub async fn make_call(&self, target: &str) -> Result<String, CallError> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let _guard = inner.op_lock.lock().await;
        inner.ensure_ready()?;
        inner.make_room().await?;
        inner.prepare_attempt(false);

        let local = inner.local_id()?;
        let session_id = inner
            .session
            .initialize(SessionParams::new(local, target).initiator(true));
        if let Err(e) = inner.session.ensure_valid() {
            inner.session.clear();
            return Err(e.into());
        }

        tracing::info!("Calling {} (session {})", target, session_id);
        inner.transition(ConnectionState::Connecting);
        inner.signaling.bind_call(&session_id, target);
        inner.arm_negotiation_timers(&session_id);
        if let Some(session) = inner.session.session() {
            inner.emit(CallEvent::CallStart(session));
        }

        if let Err(e) = inner.start_outgoing().await {
            inner.report_error(&e);
            inner.teardown(TerminationReason::Error(e.to_string())).await;
            return Err(e);
        }
        Ok(session_id)
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn accept_call(&self, incoming: IncomingCall) -> Result<(), CallError> {
        let inner = &self.inner;
        inner.ensure_ready()?;
        let _guard = inner.op_lock.lock().await;
        inner.ensure_ready()?;

        let was_pending = inner
            .ctx
            .lock()
            .take_pending(&incoming.session_id)
            .is_some();
        inner.make_room().await?;
        // Kandidaten, die vor dem Annehmen kamen, bleiben in der Queue
        inner.prepare_attempt(was_pending);

        let local = inner.local_id()?;
        inner.session.initialize(
            SessionParams::new(local, incoming.caller_id.as_str())
                .initiator(false)
                .with_session_id(incoming.session_id.as_str()),
        );
        if let Err(e) = inner.session.ensure_valid() {
            inner.session.clear();
            return Err(e.into());
        }

        tracing::info!(
            "Accepting call from {} (session {})",
            incoming.caller_id,
            incoming.session_id
        );
        inner.transition(ConnectionState::Connecting);
        inner
            .signaling
            .bind_call(&incoming.session_id, &incoming.caller_id);
        inner.arm_negotiation_timers(&incoming.session_id);
        if let Some(session) = inner.session.session() {
            inner.emit(CallEvent::CallStart(session));
        }

        if let Err(e) = inner.start_incoming(incoming.offer).await {
            inner.report_error(&e);
            inner.teardown(TerminationReason::Error(e.to_string())).await;
            return Err(e);
        }
        Ok(())
    }

    /// Lehnt den klingelnden Anruf ab (Standardgrund `rejected`)
    pub async fn reject_call(&self, reason: Option<&str>) -> Result<(), CallError> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.reject_pending(reason.unwrap_or("rejected")).await
    }

    /// Legt auf; klingelt es nur, wird abgelehnt
    pub async fn hangup(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let _guard = inner.op_lock.lock().await;
        if inner.session.has_active_session() {
            inner.teardown(TerminationReason::LocalHangup).await;
            return Ok(());
        }
        inner.reject_pending("rejected").await
    }

    /// Gibt `true` zurück wenn jetzt stumm
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.inner.media.toggle_mute().map_err(|e| match e {
            MediaError::NoLocalStream => CallError::NoActiveCall,
            other => other.into(),
        })
    }

    pub fn is_muted(&self) -> bool {
        self.inner.media.is_muted()
    }

    /// Eingangspegel des Mikrofons (0.0 - 1.0)
    pub fn input_level(&self) -> f32 {
        self.inner.media.input_level()
    }

    /// Sendet DTMF-Ziffern über den Datenkanal
    pub async fn send_digits(&self, digits: &str) -> Result<(), CallError> {
        let digits = digits.to_ascii_uppercase();
        if digits.is_empty() {
            return Err(CallError::InvalidInput("no digits given".to_string()));
        }
        if let Some(bad) = digits.chars().find(|c| !DTMF_DIGITS.contains(*c)) {
            return Err(CallError::InvalidInput(format!(
                "invalid DTMF digit '{}'",
                bad
            )));
        }
        if self.state() != ConnectionState::Connected {
            return Err(CallError::NoActiveCall);
        }

        let payload = serde_json::json!({ "type": "dtmf", "digits": digits });
        self.inner
            .peer
            .send_data(Bytes::from(payload.to_string()))
            .await?;
        tracing::debug!("Sent DTMF {}", digits);
        Ok(())
    }

    /// Beliebige Daten an die Gegenseite
    pub async fn send_data(&self, payload: Bytes) -> Result<(), CallError> {
        if !self.inner.session.has_active_session() {
            return Err(CallError::NoActiveCall);
        }
        self.inner.peer.send_data(payload).await?;
        Ok(())
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// `Ok(false)` wenn bereits aufgenommen wird
    pub async fn start_recording(&self) -> Result<bool, CallError> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.start_recording()
    }

    /// Beendet die Aufnahme; ein gesetzter Uploader bekommt das Artefakt
    pub async fn stop_recording(&self) -> Result<RecordingArtifact, CallError> {
        let _guard = self.inner.op_lock.lock().await;
        self.inner.finish_recording().await
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.is_recording()
    }

    /// `data:` URL der letzten Aufnahme, solange sie nicht übergeben wurde
    pub fn recording_url(&self) -> Option<String> {
        self.inner.recording.recording_url()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Die laufende Session, `None` nach dem Ende
    pub fn active_session(&self) -> Option<CallSession> {
        self.inner.session.session().filter(|s| !s.is_ended())
    }

    /// Klingelnder Anruf, der noch nicht angenommen wurde
    pub fn pending_incoming(&self) -> Option<IncomingCall> {
        self.inner.ctx.lock().pending_incoming.clone()
    }

    /// Meldet einen parallel laufenden Telefonanruf (neue Anrufe werden blockiert)
    pub fn set_carrier_call_active(&self, active: bool) {
        self.inner.carrier_active.store(active, Ordering::SeqCst);
        tracing::info!("Carrier call active: {}", active);
    }

    pub fn active_call_mode(&self) -> Option<CallMode> {
        if self.inner.carrier_active.load(Ordering::SeqCst) {
            Some(CallMode::CarrierBridged)
        } else if self.inner.session.has_active_session() {
            Some(CallMode::PeerToPeer)
        } else {
            None
        }
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.events.list(kind).subscribe(listener)
    }

    pub fn off(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Alle Events als Stream
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.all.subscribe()
    }

    /// Beendet einen laufenden Anruf und gibt alle Ressourcen frei.
    ///
    /// Mehrfacher Aufruf ist harmlos, auch ohne `initialize`.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _guard = inner.op_lock.lock().await;
        if inner.session.has_active_session() {
            inner.teardown(TerminationReason::LocalHangup).await;
        }
        if inner.ctx.lock().pending_incoming.is_some() {
            let _ = inner.reject_pending("rejected").await;
        }

        // Umgekehrte Aufbau-Reihenfolge
        inner.recording.dispose();
        inner.monitor.dispose();
        inner.peer.close().await;
        inner.session.clear();
        inner.signaling.dispose().await;
        inner.ice.reset();
        inner.media.dispose();
        inner.state.reset();

        inner.ctx.lock().reset_call();
        if let Some(driver) = inner.driver.lock().take() {
            driver.abort();
        }
        for subscription in inner.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        tracing::info!("Call orchestrator disposed");
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("state", &self.state())
            .field("session", &self.inner.session.session_id())
            .finish()
    }
}

// ============================================================================
// INTERNALS (Aufrufer hält den Operations-Lock)
// ============================================================================

impl Inner {
    fn emit(&self, event: CallEvent) {
        self.events.emit(event);
    }

    /// Übergang nur, wenn der Lifecycle ihn erlaubt
    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.state.state();
        if !current.can_transition_to(&next) {
            tracing::warn!("Ignoring state transition {} -> {}", current, next);
            return false;
        }
        self.state.set_state(next);
        true
    }

    fn report_error(&self, err: &CallError) {
        tracing::error!("Call error: {}", err);
        self.emit(CallEvent::Error(ErrorReport::from(err)));
    }

    fn ensure_ready(&self) -> Result<(), CallError> {
        if self.disposed.load(Ordering::SeqCst) || !self.signaling.is_initialized() {
            return Err(CallError::NotInitialized);
        }
        if self.carrier_active.load(Ordering::SeqCst) {
            return Err(CallError::CarrierCallActive);
        }
        Ok(())
    }

    fn local_id(&self) -> Result<String, CallError> {
        self.ctx
            .lock()
            .local_id
            .clone()
            .ok_or(CallError::NotInitialized)
    }

    fn active_session_id(&self) -> Option<String> {
        self.session
            .session()
            .filter(|s| !s.is_ended())
            .map(|s| s.session_id)
    }

    /// Aktive oder klingelnde Session
    fn owns_session(&self, session_id: &str) -> bool {
        if self.active_session_id().as_deref() == Some(session_id) {
            return true;
        }
        self.ctx
            .lock()
            .pending_incoming
            .as_ref()
            .map(|p| p.session_id == session_id)
            .unwrap_or(false)
    }

    fn is_initiator(&self) -> bool {
        self.session
            .session()
            .map(|s| s.is_initiator)
            .unwrap_or(false)
    }

    /// Beendet oder verweigert, was einem neuen Anruf im Weg steht
    async fn make_room(&self) -> Result<(), CallError> {
        let ringing = self.ctx.lock().pending_incoming.is_some();
        if !self.session.has_active_session() && !ringing {
            return Ok(());
        }
        if !self.config.replace_active_call {
            return Err(CallError::AlreadyInCall);
        }

        if ringing {
            if let Err(e) = self.reject_pending("busy").await {
                tracing::warn!("Failed to reject ringing call: {}", e);
            }
        }
        self.teardown(TerminationReason::Replaced).await;
        Ok(())
    }

    fn prepare_attempt(&self, keep_candidates: bool) {
        if self.state.state() != ConnectionState::Idle {
            self.state.reset();
        }
        if !keep_candidates {
            self.ice.reset();
        }
        self.monitor.dispose();
        self.ctx.lock().reset_call();
    }

    fn arm_timer(&self, after: Duration, inbound: Inbound) -> JoinHandle<()> {
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(inbound);
        })
    }

    fn arm_negotiation_timers(&self, session_id: &str) {
        let config = self.ice.config();
        let mut timers = HashMap::new();
        for (phase, after) in [
            (NegotiationPhase::Gathering, config.gathering_timeout),
            (NegotiationPhase::Connection, config.connection_timeout),
        ] {
            let timer = self.arm_timer(
                after,
                Inbound::Timeout {
                    session_id: session_id.to_string(),
                    phase,
                },
            );
            timers.insert(phase, timer);
        }
        self.ctx.lock().timers = timers;
    }

    async fn start_outgoing(&self) -> Result<(), CallError> {
        let stream = self.media.get_local_stream(&self.config.media)?;
        self.peer.open().await?;
        self.peer.attach_local_stream(&stream).await?;

        let offer = self.peer.create_offer().await?;
        self.ctx.lock().awaiting_answer = true;
        self.signaling.send_offer(&offer).await?;
        Ok(())
    }

    async fn start_incoming(&self, offer: SessionDescription) -> Result<(), CallError> {
        let stream = self.media.get_local_stream(&self.config.media)?;
        self.peer.open().await?;
        self.peer.attach_local_stream(&stream).await?;

        self.apply_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.signaling.send_answer(&answer).await?;
        Ok(())
    }

    /// Setzt die Remote-SDP und spielt die zurückgehaltenen Kandidaten ein
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.peer.set_remote_description(desc).await?;
        for record in self.ice.mark_remote_description_set() {
            if let Err(e) = self.peer.add_ice_candidate(record.candidate).await {
                tracing::warn!("Failed to apply queued candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn reject_pending(&self, reason: &str) -> Result<(), CallError> {
        let pending = {
            let mut ctx = self.ctx.lock();
            ctx.cancel_ring_timer();
            let pending = ctx.pending_incoming.take().ok_or(CallError::NoActiveCall)?;
            ctx.remember_ended(&pending.session_id);
            pending
        };

        self.signaling.clear_call();
        self.ice.reset();
        tracing::info!(
            "Rejecting call from {} ({})",
            pending.caller_id,
            reason
        );
        self.signaling
            .send_hangup_to(&pending.session_id, &pending.caller_id, Some(reason))
            .await?;
        Ok(())
    }

    /// Baut den Anruf ab; ohne aktive Session passiert nichts
    async fn teardown(&self, reason: TerminationReason) {
        if !self.session.has_active_session() {
            return;
        }
        self.ctx.lock().cancel_timers();

        if reason.is_local() {
            if let Err(e) = self.signaling.send_hangup(hangup_reason(&reason)).await {
                tracing::warn!("Failed to send hangup: {}", e);
            }
        }
        if self.recording.is_recording() {
            if let Err(e) = self.finish_recording().await {
                tracing::warn!("Failed to finish recording: {}", e);
            }
        }

        self.monitor.dispose();
        self.peer.close().await;
        self.media.dispose();
        self.ice.reset();
        self.signaling.clear_call();
        let ended = self.session.end(reason.clone());

        let next = match reason {
            TerminationReason::Timeout(_)
            | TerminationReason::ReconnectionExhausted
            | TerminationReason::Error(_) => ConnectionState::Failed {
                reason: reason.to_string(),
            },
            _ => ConnectionState::Ended,
        };
        self.transition(next);
        {
            let mut ctx = self.ctx.lock();
            ctx.reset_call();
            if let Some(session) = ended.as_ref() {
                ctx.remember_ended(&session.session_id);
            }
        }

        if let Some(session) = ended {
            self.emit(CallEvent::CallEnd(session));
        }
    }

    fn start_recording(&self) -> Result<bool, CallError> {
        let stream = self.media.composite_stream();
        let started = match self.recording.start_recording(stream.as_ref()) {
            Ok(started) => started,
            Err(e) => {
                let err = CallError::from(e);
                self.emit(CallEvent::Recording(RecordingEvent::Failed {
                    message: err.to_string(),
                }));
                return Err(err);
            }
        };
        if started {
            self.emit(CallEvent::Recording(RecordingEvent::Started));
        }
        Ok(started)
    }

    async fn finish_recording(&self) -> Result<RecordingArtifact, CallError> {
        let artifact = match self.recording.stop_recording().await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.emit(CallEvent::Recording(RecordingEvent::Failed {
                    message: e.to_string(),
                }));
                return Err(e.into());
            }
        };
        self.emit(CallEvent::Recording(RecordingEvent::Stopped {
            id: artifact.id.clone(),
            duration_seconds: artifact.duration_seconds,
            size: artifact.size(),
        }));

        let uploader = self.uploader.lock().clone();
        if let (Some(uploader), Some(owned)) = (uploader, self.recording.take_artifact()) {
            let events = Arc::clone(&self.events);
            tokio::spawn(async move {
                let id = owned.id.clone();
                match uploader.upload(owned).await {
                    Ok(()) => {
                        tracing::info!("Recording {} uploaded", id);
                        events.emit(CallEvent::Recording(RecordingEvent::Uploaded { id }));
                    }
                    Err(e) => {
                        tracing::error!("Recording upload failed: {}", e);
                        events.emit(CallEvent::Recording(RecordingEvent::Failed {
                            message: e.to_string(),
                        }));
                    }
                }
            });
        }
        Ok(artifact)
    }

    // ========================================================================
    // DRIVER
    // ========================================================================

    async fn handle(&self, inbound: Inbound) {
        let _guard = self.op_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        match inbound {
            Inbound::Signal(msg) => match msg.kind {
                MessageType::Offer => self.on_offer(msg).await,
                MessageType::Answer => self.on_answer(msg).await,
                MessageType::Candidate => self.on_remote_candidate(msg).await,
                MessageType::Hangup => self.on_hangup(msg).await,
            },
            Inbound::Peer(notification) => self.on_peer_event(notification).await,
            Inbound::Timeout { session_id, phase } => self.on_timeout(&session_id, phase).await,
            Inbound::ReconnectDue {
                session_id,
                attempt,
            } => self.on_reconnect_due(&session_id, attempt).await,
            Inbound::RingTimeout { session_id } => self.on_ring_timeout(&session_id).await,
            Inbound::Transport(err) => self.on_transport_error(err).await,
        }
    }

    async fn on_offer(&self, msg: SignalingMessage) {
        let offer = match msg.description() {
            Ok(offer) => offer,
            Err(e) => {
                self.report_error(&e.into());
                return;
            }
        };

        if let Some(current) = self.active_session_id() {
            if current != msg.session_id {
                self.send_busy(&msg).await;
                return;
            }
            if self.is_initiator() {
                tracing::debug!("Ignoring offer for own session {}", current);
                return;
            }
            // Neuverhandlung (z.B. ICE-Restart der Gegenseite)
            if let Err(e) = self.renegotiate(offer).await {
                self.report_error(&e);
            }
            return;
        }

        // Spätes Offer (z.B. ICE-Restart) für einen bereits beendeten Anruf
        if self.ctx.lock().has_ended(&msg.session_id) {
            tracing::info!("Rejecting offer for ended session {}", msg.session_id);
            self.release_auto_binding(&msg.session_id);
            if let Err(e) = self
                .signaling
                .send_hangup_to(&msg.session_id, &msg.sender_id, None)
                .await
            {
                tracing::warn!("Failed to reject late offer: {}", e);
            }
            return;
        }

        if self.carrier_active.load(Ordering::SeqCst) {
            self.send_busy(&msg).await;
            self.release_auto_binding(&msg.session_id);
            return;
        }

        let incoming = {
            let mut ctx = self.ctx.lock();
            match ctx.pending_incoming.as_ref() {
                Some(pending) if pending.session_id == msg.session_id => return,
                Some(_) => None,
                None => {
                    let incoming = IncomingCall {
                        session_id: msg.session_id.clone(),
                        caller_id: msg.sender_id.clone(),
                        offer,
                        received_at: Utc::now(),
                    };
                    ctx.pending_incoming = Some(incoming.clone());
                    Some(incoming)
                }
            }
        };

        match incoming {
            Some(incoming) => {
                // Bindung schon jetzt, damit Kandidaten des Anrufers ankommen
                self.ice.reset();
                self.signaling
                    .bind_call(&incoming.session_id, &incoming.caller_id);
                let timer = self.arm_timer(
                    self.config.ring_timeout(),
                    Inbound::RingTimeout {
                        session_id: incoming.session_id.clone(),
                    },
                );
                self.ctx.lock().ring_timer = Some(timer);
                tracing::info!(
                    "Incoming call from {} (session {})",
                    incoming.caller_id,
                    incoming.session_id
                );
                self.emit(CallEvent::IncomingCall(incoming));
            }
            None => self.send_busy(&msg).await,
        }
    }

    /// Löst die Bindung, die der Channel für ein abgewiesenes Offer selbst
    /// angelegt hat
    fn release_auto_binding(&self, session_id: &str) {
        let ringing = self.ctx.lock().pending_incoming.is_some();
        if !ringing && self.signaling.current_call_id().as_deref() == Some(session_id) {
            self.signaling.clear_call();
        }
    }

    async fn send_busy(&self, msg: &SignalingMessage) {
        tracing::info!("Busy, rejecting call from {}", msg.sender_id);
        if let Err(e) = self
            .signaling
            .send_hangup_to(&msg.session_id, &msg.sender_id, Some("busy"))
            .await
        {
            tracing::warn!("Failed to send busy hangup: {}", e);
        }
    }

    async fn renegotiate(&self, offer: SessionDescription) -> Result<(), CallError> {
        self.apply_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.signaling.send_answer(&answer).await?;
        tracing::info!("Renegotiated session");
        Ok(())
    }

    async fn on_answer(&self, msg: SignalingMessage) {
        if !self.ctx.lock().awaiting_answer
            || self.active_session_id().as_deref() != Some(msg.session_id.as_str())
        {
            tracing::debug!("Ignoring unexpected answer for {}", msg.session_id);
            return;
        }
        let answer = match msg.description() {
            Ok(answer) => answer,
            Err(e) => {
                self.report_error(&e.into());
                return;
            }
        };

        match self.apply_remote_description(answer).await {
            Ok(()) => {
                self.ctx.lock().awaiting_answer = false;
                tracing::info!("Answer applied for session {}", msg.session_id);
            }
            Err(e) => self.report_error(&e),
        }
    }

    async fn on_remote_candidate(&self, msg: SignalingMessage) {
        if !self.owns_session(&msg.session_id) {
            tracing::debug!("Dropping candidate for session {}", msg.session_id);
            return;
        }
        let candidate = match msg.ice_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::warn!("Dropping malformed candidate: {}", e);
                return;
            }
        };

        if let RemoteCandidateDisposition::Apply(record) = self.ice.queue_remote_candidate(candidate)
        {
            if let Err(e) = self.peer.add_ice_candidate(record.candidate).await {
                tracing::warn!("Failed to apply remote candidate: {}", e);
            }
        }
    }

    async fn on_hangup(&self, msg: SignalingMessage) {
        let cancelled = {
            let mut ctx = self.ctx.lock();
            let cancelled = ctx.take_pending(&msg.session_id);
            if cancelled.is_some() {
                ctx.remember_ended(&msg.session_id);
            }
            cancelled
        };
        if let Some(call) = cancelled {
            self.signaling.clear_call();
            self.ice.reset();
            tracing::info!("Caller {} hung up before answer", call.caller_id);
            self.emit(CallEvent::IncomingCallCancelled {
                session_id: call.session_id,
            });
            return;
        }

        if self.active_session_id().as_deref() != Some(msg.session_id.as_str()) {
            return;
        }

        let connected = self.ctx.lock().has_connected;
        let reason = match msg.hangup_reason() {
            Some(reason) if !connected && REJECTION_REASONS.contains(&reason.as_str()) => {
                TerminationReason::Rejected(reason)
            }
            _ => TerminationReason::RemoteHangup,
        };
        self.teardown(reason).await;
    }

    async fn on_peer_event(&self, notification: PeerNotification) {
        if self.peer.generation() != Some(notification.generation) {
            tracing::debug!(
                "Dropping event from closed connection (generation {})",
                notification.generation
            );
            return;
        }

        match notification.event {
            PeerEvent::LocalCandidate(candidate) => {
                self.ice.collect_local_candidate(candidate.clone());
                if let Err(e) = self.signaling.send_candidate(&candidate).await {
                    self.report_error(&e.into());
                }
            }
            PeerEvent::GatheringComplete => {
                if let Some(timer) = self.ctx.lock().timers.remove(&NegotiationPhase::Gathering) {
                    timer.abort();
                }
                tracing::debug!("ICE gathering complete");
            }
            PeerEvent::ConnectionState(peer_state) => self.on_peer_state(peer_state).await,
            PeerEvent::RemoteTrack(stream) => {
                let info = stream.info.clone();
                self.media.set_remote_stream(stream);
                self.emit(CallEvent::RemoteTrack(info));
            }
            PeerEvent::Data(data) => self.emit(CallEvent::Data(data)),
        }
    }

    async fn on_peer_state(&self, peer_state: PeerState) {
        let current = self.state.state();
        match peer_state {
            PeerState::Connected => self.on_connected(current),
            PeerState::Disconnected => {
                if matches!(
                    current,
                    ConnectionState::Connected | ConnectionState::Reconnecting
                ) {
                    self.begin_reconnection().await;
                }
            }
            PeerState::Failed => match current {
                ConnectionState::Connected | ConnectionState::Reconnecting => {
                    self.begin_reconnection().await
                }
                ConnectionState::Connecting => {
                    let err = CallError::Peer(PeerError::WebRTC(
                        "ICE connection failed".to_string(),
                    ));
                    self.report_error(&err);
                    self.teardown(TerminationReason::Error("ICE connection failed".to_string()))
                        .await;
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn on_connected(&self, current: ConnectionState) {
        if !matches!(
            current,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            return;
        }

        {
            let mut ctx = self.ctx.lock();
            ctx.has_connected = true;
            ctx.cancel_timers();
        }
        self.monitor.reset_reconnection();
        self.transition(ConnectionState::Connected);
        match self.peer.connection() {
            Ok(pc) => self.monitor.start(pc),
            Err(e) => tracing::warn!("Connected without a peer connection: {}", e),
        }

        if current == ConnectionState::Connecting && self.config.auto_record {
            if let Err(e) = self.start_recording() {
                tracing::warn!("Auto-record failed: {}", e);
            }
        }
    }

    /// Zählt einen Versuch und plant den nächsten; bei erschöpftem Budget
    /// wird der Anruf beendet
    async fn begin_reconnection(&self) {
        let session_id = match self.active_session_id() {
            Some(id) => id,
            None => return,
        };
        if self.ctx.lock().reconnect_timer.is_some() {
            return;
        }

        self.monitor.stop();
        if !self.monitor.attempt_reconnection() {
            self.teardown(TerminationReason::ReconnectionExhausted).await;
            return;
        }
        if self.state.state() != ConnectionState::Reconnecting {
            self.transition(ConnectionState::Reconnecting);
        }

        let attempt = self.monitor.reconnect_attempts();
        let delay = self.monitor.backoff_delay(attempt);
        let timer = self.arm_timer(
            delay,
            Inbound::ReconnectDue {
                session_id,
                attempt,
            },
        );
        self.ctx.lock().reconnect_timer = Some(timer);
        tracing::info!("Reconnection attempt {} in {:?}", attempt, delay);
    }

    async fn on_reconnect_due(&self, session_id: &str, attempt: u32) {
        if self.active_session_id().as_deref() != Some(session_id)
            || self.state.state() != ConnectionState::Reconnecting
        {
            return;
        }
        self.ctx.lock().reconnect_timer = None;

        // Nur der Anrufer startet den ICE-Restart, die Gegenseite antwortet
        if self.is_initiator() {
            match self.peer.create_offer_with_restart().await {
                Ok(offer) => {
                    self.ctx.lock().awaiting_answer = true;
                    if let Err(e) = self.signaling.send_offer(&offer).await {
                        self.report_error(&e.into());
                    } else {
                        tracing::info!("ICE restart offer sent (attempt {})", attempt);
                    }
                }
                Err(e) => self.report_error(&e.into()),
            }
        }
        self.begin_reconnection().await;
    }

    /// Niemand hat abgenommen: wie ein Ablehnen mit Grund `timeout`
    async fn on_ring_timeout(&self, session_id: &str) {
        let ringing = self
            .ctx
            .lock()
            .pending_incoming
            .as_ref()
            .map(|p| p.session_id == session_id)
            .unwrap_or(false);
        if !ringing {
            return;
        }

        tracing::info!("Incoming call {} was not answered", session_id);
        if let Err(e) = self.reject_pending("timeout").await {
            tracing::warn!("Failed to reject unanswered call: {}", e);
        }
        self.emit(CallEvent::IncomingCallCancelled {
            session_id: session_id.to_string(),
        });
    }

    /// Verbindungsprobleme des Signalings; eine endgültige Trennung beendet
    /// jede Verhandlung, die noch Nachrichten braucht
    async fn on_transport_error(&self, err: TransportError) {
        let permanent = matches!(err, TransportError::Closed(_));
        self.report_error(&CallError::Transport(err.clone()));
        if !permanent {
            return;
        }

        let cancelled = {
            let mut ctx = self.ctx.lock();
            ctx.cancel_ring_timer();
            let cancelled = ctx.pending_incoming.take();
            if let Some(call) = cancelled.as_ref() {
                ctx.remember_ended(&call.session_id);
            }
            cancelled
        };
        if let Some(call) = cancelled {
            self.signaling.clear_call();
            self.ice.reset();
            self.emit(CallEvent::IncomingCallCancelled {
                session_id: call.session_id,
            });
        }

        if matches!(
            self.state.state(),
            ConnectionState::Connecting | ConnectionState::Reconnecting
        ) {
            self.teardown(TerminationReason::Error(format!("signaling lost: {}", err)))
                .await;
        }
    }

    async fn on_timeout(&self, session_id: &str, phase: NegotiationPhase) {
        if self.active_session_id().as_deref() != Some(session_id) {
            return;
        }
        {
            let mut ctx = self.ctx.lock();
            ctx.timers.remove(&phase);
            if ctx.has_connected {
                return;
            }
        }

        self.report_error(&CallError::NegotiationTimeout { phase });
        self.teardown(TerminationReason::Timeout(phase.to_string()))
            .await;
    }
}

/// Grund im Hangup an die Gegenseite
fn hangup_reason(reason: &TerminationReason) -> Option<&'static str> {
    match reason {
        TerminationReason::LocalHangup | TerminationReason::RemoteHangup => None,
        TerminationReason::Rejected(_) => Some("rejected"),
        TerminationReason::Timeout(_) => Some("timeout"),
        TerminationReason::ReconnectionExhausted => Some("connection_lost"),
        TerminationReason::Replaced => Some("replaced"),
        TerminationReason::Error(_) => Some("error"),
    }
}

// ============================================================================
// TESTS
// ============================================================================
