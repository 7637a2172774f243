//! Message Types für das Signaling-Protokoll
//!
//! `SignalingMessage` ist die Nachricht zwischen zwei Teilnehmern; die
//! Relay-Frames verpacken sie für den WebSocket-Relay (Pub/Sub nach Topic).

use super::SignalingError;
use crate::peer::{IceCandidate, SessionDescription};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbox-Topic eines Teilnehmers
pub fn inbox_topic(participant_id: &str) -> String {
    format!("inbox/{}", participant_id)
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Offer,
    Answer,
    Candidate,
    Hangup,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Candidate => "candidate",
            MessageType::Hangup => "hangup",
        };
        f.write_str(name)
    }
}

/// Nachricht zwischen zwei Teilnehmern; `payload` ist opakes JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub session_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HangupPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl SignalingMessage {
    pub fn new(
        kind: MessageType,
        session_id: &str,
        sender_id: &str,
        recipient_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn offer(session_id: &str, sender_id: &str, recipient_id: &str, desc: &SessionDescription) -> Self {
        Self::new(MessageType::Offer, session_id, sender_id, recipient_id, to_payload(desc))
    }

    pub fn answer(session_id: &str, sender_id: &str, recipient_id: &str, desc: &SessionDescription) -> Self {
        Self::new(MessageType::Answer, session_id, sender_id, recipient_id, to_payload(desc))
    }

    pub fn candidate(session_id: &str, sender_id: &str, recipient_id: &str, candidate: &IceCandidate) -> Self {
        Self::new(MessageType::Candidate, session_id, sender_id, recipient_id, to_payload(candidate))
    }

    pub fn hangup(session_id: &str, sender_id: &str, recipient_id: &str, reason: Option<&str>) -> Self {
        let payload = to_payload(&HangupPayload {
            reason: reason.map(str::to_string),
        });
        Self::new(MessageType::Hangup, session_id, sender_id, recipient_id, payload)
    }

    /// SDP aus einem Offer/Answer
    pub fn description(&self) -> Result<SessionDescription, SignalingError> {
        self.decode()
    }

    /// ICE Candidate aus einer Candidate-Nachricht
    pub fn ice_candidate(&self) -> Result<IceCandidate, SignalingError> {
        self.decode()
    }

    /// Grund eines Hangups (z.B. `busy`)
    pub fn hangup_reason(&self) -> Option<String> {
        serde_json::from_value::<HangupPayload>(self.payload.clone())
            .ok()
            .and_then(|p| p.reason)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, SignalingError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SignalingError::InvalidPayload(format!("{} payload: {}", self.kind, e))
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ============================================================================
// RELAY FRAMES
// ============================================================================

/// Client → Relay
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, message: SignalingMessage },
    Heartbeat,
}

/// Relay → Client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Nachricht auf einem abonnierten Topic
    Message {
        topic: String,
        message: SignalingMessage,
    },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalingMessage::offer("a-b-1", "a", "b", &SessionDescription::offer("v=0"));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "offer");
        assert_eq!(json["sessionId"], "a-b-1");
        assert_eq!(json["senderId"], "a");
        assert_eq!(json["recipientId"], "b");
        assert_eq!(json["payload"], serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn test_candidate_roundtrip_through_payload() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", Some("0"), Some(0));
        let msg = SignalingMessage::candidate("s", "a", "b", &candidate);
        let text = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.ice_candidate().unwrap(), candidate);
        assert!(parsed.description().is_err());
    }

    #[test]
    fn test_hangup_reason() {
        let busy = SignalingMessage::hangup("s", "a", "b", Some("busy"));
        assert_eq!(busy.hangup_reason().as_deref(), Some("busy"));

        let plain = SignalingMessage::hangup("s", "a", "b", None);
        assert_eq!(plain.payload, serde_json::json!({}));
        assert_eq!(plain.hangup_reason(), None);
    }

    #[test]
    fn test_relay_frames() {
        let frame = ClientFrame::Subscribe {
            topic: inbox_topic("alice"),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            serde_json::json!({"type": "subscribe", "topic": "inbox/alice"})
        );
        assert_eq!(
            serde_json::to_value(&ClientFrame::Heartbeat).unwrap(),
            serde_json::json!({"type": "heartbeat"})
        );

        let pong: RelayFrame = serde_json::from_str(r#"{"type":"pong","timestamp":1}"#).unwrap();
        assert!(matches!(pong, RelayFrame::Pong { .. }));

        let error: RelayFrame =
            serde_json::from_str(r#"{"type":"error","code":403,"message":"forbidden"}"#).unwrap();
        assert!(matches!(error, RelayFrame::Error { code: 403, .. }));
    }
}
