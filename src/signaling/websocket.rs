//! WebSocket Transport zum Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Verbindungs-Task verteilt eingehende Nachrichten nach Topic und
//!   serialisiert ausgehende Frames
//! - bei Verbindungsverlust Wiederverbindung mit Backoff, Abos werden erneuert
//! - Heartbeat hält die Verbindung offen

use super::messages::{ClientFrame, RelayFrame, SignalingMessage};
use super::transport::{SignalingTransport, TransportError, TransportEvent};
use crate::monitor::BackoffPolicy;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

/// Heartbeat-Intervall
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Timeout für den Verbindungsaufbau
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Subscribers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SignalingMessage>>>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gemeinsamer Zustand von Transport und Verbindungs-Task
#[derive(Clone)]
struct Link {
    url: String,
    connected: Arc<RwLock<bool>>,
    subscribers: Subscribers,
    events: broadcast::Sender<TransportEvent>,
}

/// Pub/Sub über einen WebSocket-Relay
pub struct WebSocketTransport {
    link: Link,
    tx: mpsc::Sender<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Verbindet mit dem Relay (Standard-Backoff für Wiederverbindungen)
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        Self::connect_with_retry(
            url,
            BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                max_attempts: 5,
            },
        )
        .await
    }

    /// Verbindet mit dem Relay und startet Verbindungs- und Heartbeat-Task.
    ///
    /// Der erste Aufbau schlägt sofort fehl; spätere Abbrüche werden mit
    /// `retry` wiederholt.
    pub async fn connect_with_retry(
        url: &str,
        retry: BackoffPolicy,
    ) -> Result<Self, TransportError> {
        // http(s) URLs werden auf ws(s) umgeschrieben
        let ws_url = if url.starts_with("http") {
            url.replacen("http", "ws", 1)
        } else {
            url.to_string()
        };
        url::Url::parse(&ws_url).map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling relay: {}", ws_url);
        let stream = Self::open(&ws_url).await?;

        let (tx, rx) = mpsc::channel::<String>(100);
        let (events, _) = broadcast::channel(16);
        let link = Link {
            url: ws_url,
            connected: Arc::new(RwLock::new(true)),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            events,
        };

        let supervisor = tokio::spawn(Self::supervise(link.clone(), stream, rx, retry));

        // Heartbeat-Task
        let heartbeat_tx = tx.clone();
        let heartbeat_connected = Arc::clone(&link.connected);
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !*heartbeat_connected.read() {
                    continue;
                }
                let frame = match serde_json::to_string(&ClientFrame::Heartbeat) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if let Err(e) = heartbeat_tx.send(frame).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });

        Ok(Self {
            link,
            tx,
            tasks: Mutex::new(vec![supervisor, heartbeat]),
        })
    }

    async fn open(url: &str) -> Result<WsStream, TransportError> {
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| TransportError::ConnectionFailed("Timeout".to_string()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(stream)
    }

    /// Hält die Verbindung: bedient sie bis zum Abbruch, verbindet dann neu
    /// und meldet beides als `TransportEvent`
    async fn supervise(
        link: Link,
        mut stream: WsStream,
        mut outbound: mpsc::Receiver<String>,
        retry: BackoffPolicy,
    ) {
        loop {
            let reason = match Self::serve(stream, &mut outbound, &link.subscribers).await {
                Some(reason) => reason,
                // Transport wurde verworfen
                None => return,
            };

            *link.connected.write() = false;
            tracing::warn!("Signaling connection lost: {}", reason);
            let _ = link.events.send(TransportEvent::Disconnected {
                reason: reason.clone(),
            });

            stream = match Self::reconnect(&link, &retry).await {
                Some(stream) => stream,
                None => {
                    tracing::error!(
                        "Giving up on signaling relay after {} attempts",
                        retry.max_attempts
                    );
                    let _ = link.events.send(TransportEvent::Closed { reason });
                    // Empfänger sehen das Ende ihres Streams
                    link.subscribers.lock().clear();
                    return;
                }
            };

            *link.connected.write() = true;
            tracing::info!("Reconnected to signaling relay: {}", link.url);
            let _ = link.events.send(TransportEvent::Reconnected);
        }
    }

    /// Liest und schreibt bis die Verbindung abbricht (`Some(grund)`) oder
    /// der Transport verworfen wird (`None`)
    async fn serve(
        stream: WsStream,
        outbound: &mut mpsc::Receiver<String>,
        subscribers: &Subscribers,
    ) -> Option<String> {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(frame) => Self::handle_frame(frame, subscribers),
                        Err(e) => tracing::warn!("Unparseable relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Some("closed by relay".to_string());
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        return Some(e.to_string());
                    }
                    Some(Ok(_)) => {}
                },
                outgoing = outbound.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            return Some(e.to_string());
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        return None;
                    }
                },
            }
        }
    }

    /// Neuer Aufbau mit Backoff; erneuert danach alle Abos
    async fn reconnect(link: &Link, retry: &BackoffPolicy) -> Option<WsStream> {
        for attempt in 1..=retry.max_attempts {
            let delay = retry.delay(attempt);
            tracing::info!(
                "Reconnecting to signaling relay in {:?} (attempt {}/{})",
                delay,
                attempt,
                retry.max_attempts
            );
            tokio::time::sleep(delay).await;

            let mut stream = match Self::open(&link.url).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    continue;
                }
            };

            let topics: Vec<String> = link.subscribers.lock().keys().cloned().collect();
            let mut resubscribed = true;
            for topic in topics {
                let frame = match serde_json::to_string(&ClientFrame::Subscribe { topic }) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if let Err(e) = stream.send(Message::Text(frame)).await {
                    tracing::warn!("Resubscribe failed: {}", e);
                    resubscribed = false;
                    break;
                }
            }
            if resubscribed {
                return Some(stream);
            }
        }
        None
    }

    pub fn is_connected(&self) -> bool {
        *self.link.connected.read()
    }

    /// Beendet alle Tasks und trennt die Verbindung
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.link.connected.write() = false;
        self.link.subscribers.lock().clear();
    }

    fn handle_frame(frame: RelayFrame, subscribers: &Subscribers) {
        match frame {
            RelayFrame::Message { topic, message } => {
                let mut subs = subscribers.lock();
                if let Some(tx) = subs.get(&topic) {
                    if tx.send(message).is_err() {
                        subs.remove(&topic);
                    }
                } else {
                    tracing::debug!("Message for unsubscribed topic {}", topic);
                }
            }
            RelayFrame::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
            }
            RelayFrame::Pong { .. } => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text =
            serde_json::to_string(frame).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn publish(&self, topic: &str, message: &SignalingMessage) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::Publish {
            topic: topic.to_string(),
            message: message.clone(),
        })
        .await
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.subscribers.lock().insert(topic.to_string(), tx);
        self.send_frame(&ClientFrame::Subscribe {
            topic: topic.to_string(),
        })
        .await?;
        tracing::info!("Subscribed to {}", topic);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.link.subscribers.lock().remove(topic);
        if !self.is_connected() {
            return Ok(());
        }
        self.send_frame(&ClientFrame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.events.subscribe()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.link.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_frame_reaches_topic_subscriber() {
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscribers.lock().insert("inbox/alice".to_string(), tx);

        let message = SignalingMessage::hangup("s", "bob", "alice", None);
        let text = serde_json::json!({
            "type": "message",
            "topic": "inbox/alice",
            "message": message,
        })
        .to_string();
        let frame: RelayFrame = serde_json::from_str(&text).unwrap();
        WebSocketTransport::handle_frame(frame, &subscribers);

        assert_eq!(rx.try_recv().unwrap().id, message.id);
    }

    #[test]
    fn test_closed_receiver_is_pruned() {
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        subscribers.lock().insert("inbox/alice".to_string(), tx);
        drop(rx);

        WebSocketTransport::handle_frame(
            RelayFrame::Message {
                topic: "inbox/alice".to_string(),
                message: SignalingMessage::hangup("s", "bob", "alice", None),
            },
            &subscribers,
        );
        assert!(subscribers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let err = WebSocketTransport::connect("not a url").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    fn fast_retry(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts,
        }
    }

    /// Liest Client-Frames bis zum ersten `subscribe` und liefert dessen Topic
    async fn read_subscribe(
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Option<String> {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let frame: serde_json::Value = serde_json::from_str(&text).ok()?;
                if frame["type"] == "subscribe" {
                    return frame["topic"].as_str().map(str::to_string);
                }
            }
        }
        None
    }

    async fn next_event(events: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_dropped_connection_reconnects_and_resubscribes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (topics_tx, mut topics_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            // Erste Verbindung: Abo lesen, dann hart schließen
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let topic = read_subscribe(&mut ws).await.unwrap();
            topics_tx.send(topic).unwrap();
            drop(ws);

            // Zweite Verbindung: erneuertes Abo lesen und beliefern
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let topic = read_subscribe(&mut ws).await.unwrap();
            topics_tx.send(topic.clone()).unwrap();
            let frame = serde_json::json!({
                "type": "message",
                "topic": topic,
                "message": SignalingMessage::hangup("s", "bob", "alice", None),
            });
            ws.send(Message::Text(frame.to_string())).await.unwrap();
            // Verbindung offen halten
            while ws.next().await.is_some() {}
        });

        let transport = WebSocketTransport::connect_with_retry(&url, fast_retry(5))
            .await
            .unwrap();
        let mut events = transport.events();
        let mut inbox = transport.subscribe("inbox/alice").await.unwrap();
        assert_eq!(topics_rx.recv().await.unwrap(), "inbox/alice");

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        assert_eq!(next_event(&mut events).await, TransportEvent::Reconnected);
        assert!(transport.is_connected());
        assert_eq!(topics_rx.recv().await.unwrap(), "inbox/alice");

        let message = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.session_id, "s");
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_close_the_transport() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            read_subscribe(&mut ws).await;
            // Listener und Verbindung verschwinden gemeinsam
        });

        let transport = WebSocketTransport::connect_with_retry(&url, fast_retry(2))
            .await
            .unwrap();
        let mut events = transport.events();
        let mut inbox = transport.subscribe("inbox/alice").await.unwrap();
        server.await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Closed { .. }
        ));
        assert!(!transport.is_connected());
        let end = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(matches!(
            transport.publish("inbox/bob", &SignalingMessage::hangup("s", "alice", "bob", None)).await,
            Err(TransportError::NotConnected)
        ));
    }
}
