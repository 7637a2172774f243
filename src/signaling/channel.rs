//! Signaling Channel
//!
//! Transportunabhängige Hülle um Offer/Answer/Candidate/Hangup. Empfängt über
//! die eigene Inbox, filtert Duplikate und Nachrichten fremder Sessions und
//! leitet den Rest an genau einen Handler pro Nachrichtentyp weiter.
//!
//! Kandidaten und Hangups, die vor ihrem Offer eintreffen, werden gepuffert
//! und nach dem Offer in Ankunftsreihenfolge zugestellt.

use super::messages::{inbox_topic, MessageType, SignalingMessage};
use super::transport::{SignalingTransport, TransportError, TransportEvent};
use super::SignalingError;
use crate::monitor::BackoffPolicy;
use crate::peer::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Anzahl gemerkter Nachrichten-IDs für die Duplikaterkennung
const SEEN_CAPACITY: usize = 256;

/// Maximal gepufferte Nachrichten ohne gebundene Session
const EARLY_CAPACITY: usize = SEEN_CAPACITY;

type Handler = Arc<dyn Fn(SignalingMessage) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    offer: Option<Handler>,
    answer: Option<Handler>,
    candidate: Option<Handler>,
    hangup: Option<Handler>,
}

impl Handlers {
    fn slot(&mut self, kind: MessageType) -> &mut Option<Handler> {
        match kind {
            MessageType::Offer => &mut self.offer,
            MessageType::Answer => &mut self.answer,
            MessageType::Candidate => &mut self.candidate,
            MessageType::Hangup => &mut self.hangup,
        }
    }
}

/// Aktuell gebundener Anruf
#[derive(Debug, Clone, PartialEq, Eq)]
struct CallBinding {
    session_id: String,
    remote_id: String,
}

#[derive(Default)]
struct SeenIds {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenIds {
    /// `false` wenn die ID bereits gesehen wurde
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Nachrichten, deren Offer noch fehlt (älteste fallen zuerst heraus)
#[derive(Default)]
struct EarlyMessages {
    queue: VecDeque<SignalingMessage>,
}

impl EarlyMessages {
    fn push(&mut self, message: SignalingMessage) {
        self.queue.push_back(message);
        if self.queue.len() > EARLY_CAPACITY {
            if let Some(oldest) = self.queue.pop_front() {
                tracing::debug!("Early {} for session {} evicted", oldest.kind, oldest.session_id);
            }
        }
    }

    /// Entnimmt alle Nachrichten der Session in Ankunftsreihenfolge
    fn take(&mut self, session_id: &str) -> Vec<SignalingMessage> {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|m| m.session_id == session_id);
        self.queue = rest.into();
        matching
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}

struct ChannelInner {
    local_id: Mutex<Option<String>>,
    handlers: Mutex<Handlers>,
    error_handler: Mutex<Option<ErrorHandler>>,
    binding: Mutex<Option<CallBinding>>,
    seen: Mutex<SeenIds>,
    early: Mutex<EarlyMessages>,
}

impl ChannelInner {
    fn dispatch(&self, message: SignalingMessage) {
        if !self.seen.lock().insert(message.id) {
            tracing::debug!("Duplicate {} message {} dropped", message.kind, message.id);
            return;
        }

        let local_matches = self
            .local_id
            .lock()
            .as_deref()
            .map(|id| id == message.recipient_id)
            .unwrap_or(false);
        if !local_matches {
            tracing::debug!("Message for {} dropped", message.recipient_id);
            return;
        }

        if message.kind == MessageType::Offer {
            self.dispatch_offer(message);
            return;
        }

        let bound = self
            .binding
            .lock()
            .as_ref()
            .map(|b| b.session_id == message.session_id);
        match bound {
            Some(true) => self.deliver(message),
            Some(false) => tracing::debug!(
                "Stale {} for session {} dropped",
                message.kind,
                message.session_id
            ),
            None => {
                tracing::debug!(
                    "Buffered {} for unbound session {}",
                    message.kind,
                    message.session_id
                );
                self.early.lock().push(message);
            }
        }
    }

    /// Offers starten neue Anrufe und kommen immer durch. Ein freier Channel
    /// bindet sich an den Anrufer und stellt danach die vorab gepufferten
    /// Nachrichten dieser Session zu.
    fn dispatch_offer(&self, message: SignalingMessage) {
        let early = {
            let mut binding = self.binding.lock();
            if binding.is_some() {
                None
            } else {
                let early = self.early.lock().take(&message.session_id);
                if early.iter().any(|m| m.kind == MessageType::Hangup) {
                    tracing::info!(
                        "Offer for session {} was cancelled before it arrived",
                        message.session_id
                    );
                    return;
                }
                *binding = Some(CallBinding {
                    session_id: message.session_id.clone(),
                    remote_id: message.sender_id.clone(),
                });
                Some(early)
            }
        };

        self.deliver(message);
        for early in early.into_iter().flatten() {
            self.deliver(early);
        }
    }

    fn deliver(&self, message: SignalingMessage) {
        let handler = self.handlers.lock().slot(message.kind).clone();
        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!("No handler for {} message", message.kind),
        }
    }

    fn report(&self, err: TransportError) {
        tracing::warn!("Signaling transport error: {}", err);
        let handler = self.error_handler.lock().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
    transport: Mutex<Option<Arc<dyn SignalingTransport>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    retry: BackoffPolicy,
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self::with_retry(BackoffPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            max_attempts: 3,
        })
    }

    /// Channel mit eigener Retry-Policy für Publishes
    pub fn with_retry(retry: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                local_id: Mutex::new(None),
                handlers: Mutex::new(Handlers::default()),
                error_handler: Mutex::new(None),
                binding: Mutex::new(None),
                seen: Mutex::new(SeenIds::default()),
                early: Mutex::new(EarlyMessages::default()),
            }),
            transport: Mutex::new(None),
            dispatcher: Mutex::new(None),
            retry,
        }
    }

    /// Abonniert die Inbox des Teilnehmers und startet die Verteilung.
    ///
    /// Verbindungsverluste des Transports gehen an `on_error`; endet die Inbox,
    /// wird das einmalig als `Closed` gemeldet.
    pub async fn initialize(
        &self,
        transport: Arc<dyn SignalingTransport>,
        local_participant_id: &str,
    ) -> Result<(), SignalingError> {
        if self.is_initialized() {
            self.release().await;
        }

        let mut events = transport.events();
        let mut rx = transport.subscribe(&inbox_topic(local_participant_id)).await?;
        *self.inner.local_id.lock() = Some(local_participant_id.to_string());
        *self.transport.lock() = Some(transport);

        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let inner = match weak.upgrade() {
                            Some(inner) => inner,
                            None => break,
                        };
                        match message {
                            Some(message) => inner.dispatch(message),
                            None => {
                                inner.report(TransportError::Closed(
                                    "inbox subscription ended".to_string(),
                                ));
                                break;
                            }
                        }
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(event) => {
                            let inner = match weak.upgrade() {
                                Some(inner) => inner,
                                None => break,
                            };
                            if let Some(err) = event.to_error() {
                                inner.report(err);
                            } else {
                                tracing::info!("Signaling transport recovered");
                            }
                            if matches!(event, TransportEvent::Closed { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Missed {} transport events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    },
                }
            }
        });
        *self.dispatcher.lock() = Some(handle);

        tracing::info!("Signaling channel ready for {}", local_participant_id);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.lock().is_some()
    }

    pub fn local_id(&self) -> Option<String> {
        self.inner.local_id.lock().clone()
    }

    // ========================================================================
    // HANDLERS
    // ========================================================================

    pub fn on_offer<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.set_handler(MessageType::Offer, handler);
    }

    pub fn on_answer<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.set_handler(MessageType::Answer, handler);
    }

    pub fn on_candidate<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.set_handler(MessageType::Candidate, handler);
    }

    pub fn on_hangup<F>(&self, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        self.set_handler(MessageType::Hangup, handler);
    }

    /// Verbindungsfehler des Transports (Abbruch, endgültige Trennung)
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(TransportError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.lock() = Some(Arc::new(handler));
    }

    fn set_handler<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(SignalingMessage) + Send + Sync + 'static,
    {
        *self.inner.handlers.lock().slot(kind) = Some(Arc::new(handler));
    }

    // ========================================================================
    // CALL BINDING
    // ========================================================================

    /// Bindet den Channel an einen Anruf und stellt vorab gepufferte
    /// Nachrichten dieser Session zu
    pub fn bind_call(&self, session_id: &str, remote_id: &str) {
        *self.inner.binding.lock() = Some(CallBinding {
            session_id: session_id.to_string(),
            remote_id: remote_id.to_string(),
        });
        tracing::debug!("Signaling bound to session {}", session_id);

        let early = self.inner.early.lock().take(session_id);
        for message in early {
            self.inner.deliver(message);
        }
    }

    pub fn current_call_id(&self) -> Option<String> {
        self.inner
            .binding
            .lock()
            .as_ref()
            .map(|b| b.session_id.clone())
    }

    pub fn has_active_call(&self) -> bool {
        self.inner.binding.lock().is_some()
    }

    /// Löst die Bindung; der Transport bleibt bestehen
    pub fn clear_call(&self) {
        self.inner.binding.lock().take();
    }

    // ========================================================================
    // SENDING
    // ========================================================================

    pub async fn send_offer(&self, desc: &SessionDescription) -> Result<(), SignalingError> {
        let (session, local, remote) = self.route()?;
        self.publish(SignalingMessage::offer(&session, &local, &remote, desc))
            .await
    }

    pub async fn send_answer(&self, desc: &SessionDescription) -> Result<(), SignalingError> {
        let (session, local, remote) = self.route()?;
        self.publish(SignalingMessage::answer(&session, &local, &remote, desc))
            .await
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SignalingError> {
        let (session, local, remote) = self.route()?;
        self.publish(SignalingMessage::candidate(&session, &local, &remote, candidate))
            .await
    }

    pub async fn send_hangup(&self, reason: Option<&str>) -> Result<(), SignalingError> {
        let (session, local, remote) = self.route()?;
        self.publish(SignalingMessage::hangup(&session, &local, &remote, reason))
            .await
    }

    /// Hangup an eine nicht gebundene Session (z.B. `busy` beim Anklopfen)
    pub async fn send_hangup_to(
        &self,
        session_id: &str,
        remote_id: &str,
        reason: Option<&str>,
    ) -> Result<(), SignalingError> {
        let local = self.local_id().ok_or(SignalingError::NotInitialized)?;
        self.publish(SignalingMessage::hangup(session_id, &local, remote_id, reason))
            .await
    }

    fn route(&self) -> Result<(String, String, String), SignalingError> {
        let local = self.local_id().ok_or(SignalingError::NotInitialized)?;
        let binding = self
            .inner
            .binding
            .lock()
            .clone()
            .ok_or(SignalingError::NoActiveCall)?;
        Ok((binding.session_id, local, binding.remote_id))
    }

    /// Veröffentlicht in die Inbox des Empfängers; vorübergehende Fehler
    /// werden mit Backoff wiederholt
    async fn publish(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(SignalingError::NotInitialized)?;
        let topic = inbox_topic(&message.recipient_id);

        let mut attempt = 0;
        loop {
            match transport.publish(&topic, &message).await {
                Ok(()) => {
                    tracing::debug!("Sent {} for session {}", message.kind, message.session_id);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "Publishing {} failed ({}), retry {} in {:?}",
                        message.kind,
                        e,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Gibt das Abonnement frei; mehrfacher Aufruf ist harmlos
    pub async fn dispose(&self) {
        self.release().await;
        *self.inner.handlers.lock() = Handlers::default();
        self.inner.error_handler.lock().take();
        self.inner.early.lock().clear();
        self.clear_call();
    }

    async fn release(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }

        let transport = self.transport.lock().take();
        let local_id = self.inner.local_id.lock().take();
        if let (Some(transport), Some(local_id)) = (transport, local_id) {
            if let Err(e) = transport.unsubscribe(&inbox_topic(&local_id)).await {
                tracing::warn!("Failed to unsubscribe inbox: {}", e);
            }
        }
    }
}

impl Default for SignalingChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("local_id", &self.local_id())
            .field("call", &self.current_call_id())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::InMemoryBus;
    use tokio::sync::mpsc;

    async fn channel_for(bus: &InMemoryBus, id: &str) -> SignalingChannel {
        let channel = SignalingChannel::new();
        channel.initialize(Arc::new(bus.clone()), id).await.unwrap();
        channel
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SignalingMessage>) -> Option<SignalingMessage> {
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_offer_reaches_remote_handler() {
        let bus = InMemoryBus::new();
        let alice = channel_for(&bus, "alice").await;
        let bob = channel_for(&bus, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_offer(move |msg| {
            let _ = tx.send(msg);
        });

        alice.bind_call("alice-bob-1", "bob");
        alice.send_offer(&SessionDescription::offer("v=0")).await.unwrap();

        let msg = recv(&mut rx).await.unwrap();
        assert_eq!(msg.session_id, "alice-bob-1");
        assert_eq!(msg.sender_id, "alice");
        assert_eq!(msg.description().unwrap().sdp, "v=0");
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;
        bob.bind_call("s1", "alice");

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_hangup(move |msg| {
            let _ = tx.send(msg);
        });

        let msg = SignalingMessage::hangup("s1", "alice", "bob", None);
        bus.publish("inbox/bob", &msg).await.unwrap();
        bus.publish("inbox/bob", &msg).await.unwrap();

        assert!(recv(&mut rx).await.is_some());
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_foreign_session_is_dropped_except_offers() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;
        bob.bind_call("current", "alice");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let answer_tx = tx.clone();
        bob.on_answer(move |msg| {
            let _ = answer_tx.send(msg);
        });
        bob.on_offer(move |msg| {
            let _ = tx.send(msg);
        });

        let stale = SignalingMessage::answer("old", "alice", "bob", &SessionDescription::answer("v=0"));
        bus.publish("inbox/bob", &stale).await.unwrap();
        let offer = SignalingMessage::offer("other", "carol", "bob", &SessionDescription::offer("v=0"));
        bus.publish("inbox/bob", &offer).await.unwrap();

        let received = recv(&mut rx).await.unwrap();
        assert_eq!(received.kind, MessageType::Offer);
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_offer_binds_idle_channel() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_candidate(move |msg| {
            let _ = tx.send(msg);
        });

        let offer = SignalingMessage::offer("s1", "alice", "bob", &SessionDescription::offer("v=0"));
        bus.publish("inbox/bob", &offer).await.unwrap();
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", None, None);
        bus.publish(
            "inbox/bob",
            &SignalingMessage::candidate("s1", "alice", "bob", &candidate),
        )
        .await
        .unwrap();

        assert!(recv(&mut rx).await.is_some());
        assert_eq!(bob.current_call_id().as_deref(), Some("s1"));

        // Ein zweites Offer ändert die Bindung nicht
        let other = SignalingMessage::offer("s2", "carol", "bob", &SessionDescription::offer("v=0"));
        bus.publish("inbox/bob", &other).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bob.current_call_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_replayed() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let candidate_tx = tx.clone();
        bob.on_candidate(move |msg| {
            let _ = candidate_tx.send(msg);
        });
        bob.on_offer(move |msg| {
            let _ = tx.send(msg);
        });

        let first = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", None, None);
        let second = IceCandidate::new("candidate:2 1 udp 1 10.0.0.2 5000 typ host", None, None);
        for candidate in [&first, &second] {
            bus.publish(
                "inbox/bob",
                &SignalingMessage::candidate("s1", "alice", "bob", candidate),
            )
            .await
            .unwrap();
        }
        // Kandidat einer anderen Session bleibt gepuffert
        bus.publish(
            "inbox/bob",
            &SignalingMessage::candidate("s9", "carol", "bob", &first),
        )
        .await
        .unwrap();
        assert!(recv(&mut rx).await.is_none());
        assert!(!bob.has_active_call());

        let offer = SignalingMessage::offer("s1", "alice", "bob", &SessionDescription::offer("v=0"));
        bus.publish("inbox/bob", &offer).await.unwrap();

        assert_eq!(recv(&mut rx).await.unwrap().kind, MessageType::Offer);
        let replayed: Vec<String> = [recv(&mut rx).await.unwrap(), recv(&mut rx).await.unwrap()]
            .iter()
            .map(|m| m.ice_candidate().unwrap().candidate)
            .collect();
        assert_eq!(replayed, vec![first.candidate.clone(), second.candidate.clone()]);
        assert!(recv(&mut rx).await.is_none());
        assert_eq!(bob.current_call_id().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_hangup_before_offer_suppresses_offer() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let hangup_tx = tx.clone();
        bob.on_hangup(move |msg| {
            let _ = hangup_tx.send(msg);
        });
        bob.on_offer(move |msg| {
            let _ = tx.send(msg);
        });

        bus.publish("inbox/bob", &SignalingMessage::hangup("s1", "alice", "bob", None))
            .await
            .unwrap();
        let offer = SignalingMessage::offer("s1", "alice", "bob", &SessionDescription::offer("v=0"));
        bus.publish("inbox/bob", &offer).await.unwrap();

        assert!(recv(&mut rx).await.is_none());
        assert!(!bob.has_active_call());
    }

    #[test]
    fn test_early_buffer_is_bounded() {
        let mut early = EarlyMessages::default();
        for i in 0..EARLY_CAPACITY + 5 {
            early.push(SignalingMessage::hangup(&format!("s{}", i), "alice", "bob", None));
        }
        assert_eq!(early.queue.len(), EARLY_CAPACITY);
        // Die ältesten sind verdrängt
        assert!(early.take("s0").is_empty());
        assert_eq!(early.take("s5").len(), 1);
        assert_eq!(early.queue.len(), EARLY_CAPACITY - 1);
    }

    #[tokio::test]
    async fn test_bind_call_replays_buffered_messages() {
        let bus = InMemoryBus::new();
        let alice = channel_for(&bus, "alice").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        alice.on_answer(move |msg| {
            let _ = tx.send(msg);
        });

        let answer = SignalingMessage::answer("s1", "bob", "alice", &SessionDescription::answer("v=0"));
        bus.publish("inbox/alice", &answer).await.unwrap();
        assert!(recv(&mut rx).await.is_none());

        alice.bind_call("s1", "bob");
        assert_eq!(recv(&mut rx).await.unwrap().id, answer.id);
    }

    #[tokio::test]
    async fn test_transport_loss_reaches_error_handler() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        bob.on_error(move |err| {
            let _ = tx.send(err);
        });

        bus.notify(TransportEvent::Disconnected {
            reason: "reset".to_string(),
        });
        let err = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::Disconnected(_)));

        // Wiederhergestellt: kein Fehler
        bus.notify(TransportEvent::Reconnected);
        bus.close("relay shut down");

        let err = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, TransportError::Closed(_)));
        // Nur eine Meldung für das Ende
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_last_handler_wins() {
        let bus = InMemoryBus::new();
        let bob = channel_for(&bus, "bob").await;
        bob.bind_call("s1", "alice");

        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        bob.on_hangup(move |msg| {
            let _ = first_tx.send(msg);
        });
        bob.on_hangup(move |msg| {
            let _ = second_tx.send(msg);
        });

        bus.publish("inbox/bob", &SignalingMessage::hangup("s1", "alice", "bob", None))
            .await
            .unwrap();
        assert!(recv(&mut second_rx).await.is_some());
        assert!(recv(&mut first_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_send_without_binding_fails() {
        let bus = InMemoryBus::new();
        let alice = channel_for(&bus, "alice").await;
        let err = alice.send_hangup(None).await.unwrap_err();
        assert!(matches!(err, SignalingError::NoActiveCall));

        let uninitialized = SignalingChannel::new();
        uninitialized.bind_call("s", "bob");
        assert!(matches!(
            uninitialized.send_hangup(None).await,
            Err(SignalingError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_publish_failures_are_retried() {
        let bus = InMemoryBus::new();
        let alice = channel_for(&bus, "alice").await;
        alice.bind_call("s1", "bob");

        bus.fail_next_publishes(2);
        alice.send_hangup(Some("done")).await.unwrap();
        assert_eq!(bus.published().len(), 1);

        bus.fail_next_publishes(10);
        assert!(alice.send_hangup(None).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_and_dispose() {
        let bus = InMemoryBus::new();
        let alice = channel_for(&bus, "alice").await;
        alice.bind_call("s1", "bob");
        assert!(alice.has_active_call());
        assert_eq!(alice.current_call_id().as_deref(), Some("s1"));

        alice.clear_call();
        assert!(!alice.has_active_call());
        assert!(alice.is_initialized());

        alice.dispose().await;
        alice.dispose().await;
        assert!(!alice.is_initialized());
        assert_eq!(bus.subscriber_count("inbox/alice"), 0);
    }
}
