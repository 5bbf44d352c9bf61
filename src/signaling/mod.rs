//! Signaling: the named-event messages exchanged with the room relay, and
//! the channel abstraction both relay flavours (WebSocket, in-memory) share.
//!
//! On the wire every message is a JSON object `{"event": <name>, "data": <payload>}`.
//! Offer, answer and candidate payloads are relayed untouched.

pub mod relay;
pub mod websocket;

pub use relay::{JoinOutcome, MemoryConnector, Relay, RoomRegistry};
pub use websocket::WebSocketConnector;

use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Client asks to enter a room
    Join(String),
    /// Relay: the joiner is alone in a new room
    Created(String),
    /// Relay: the joiner entered a room with one member
    Joined(String),
    /// Relay: the room already has two members
    Full(String),
    /// Relay: someone joined the room this client is waiting in
    NewPeer(String),
    /// Caller's offer
    Invite(SessionDescription),
    /// Callee's answer (`ok` on the wire)
    #[serde(rename = "ok")]
    Accept(SessionDescription),
    IceCandidate(IceCandidate),
    Bye(String),
}

impl SignalingMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingMessage::Join(_) => "join",
            SignalingMessage::Created(_) => "created",
            SignalingMessage::Joined(_) => "joined",
            SignalingMessage::Full(_) => "full",
            SignalingMessage::NewPeer(_) => "new_peer",
            SignalingMessage::Invite(_) => "invite",
            SignalingMessage::Accept(_) => "ok",
            SignalingMessage::IceCandidate(_) => "ice_candidate",
            SignalingMessage::Bye(_) => "bye",
        }
    }

    /// Messages the relay passes between members without reading them
    pub fn is_peer_payload(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Invite(_)
                | SignalingMessage::Accept(_)
                | SignalingMessage::IceCandidate(_)
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Outbound half of a signaling connection
#[derive(Clone, Debug)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingSender {
    pub fn new(tx: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, msg: SignalingMessage) -> Result<()> {
        let event = msg.event_name();
        self.tx
            .send(msg)
            .map_err(|_| Error::Signaling(format!("connection closed, could not send '{}'", event)))
    }
}

pub struct SignalingChannel {
    pub sender: SignalingSender,
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_relay_events() {
        let json = SignalingMessage::NewPeer("r1".into()).to_json().unwrap();
        assert_eq!(json, r#"{"event":"new_peer","data":"r1"}"#);

        let json = SignalingMessage::Accept(SessionDescription::answer("v=0")).to_json().unwrap();
        assert_eq!(json, r#"{"event":"ok","data":{"type":"answer","sdp":"v=0"}}"#);
    }

    #[test]
    fn parses_candidate_message() {
        let msg = SignalingMessage::from_json(
            r#"{"event":"ice_candidate","data":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        match msg {
            SignalingMessage::IceCandidate(c) => assert_eq!(c.sdp_mid.as_deref(), Some("0")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_event_is_an_error() {
        assert!(matches!(
            SignalingMessage::from_json(r#"{"event":"renegotiate","data":null}"#),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn emit_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = SignalingSender::new(tx);
        drop(rx);
        assert!(matches!(
            sender.emit(SignalingMessage::Bye("r1".into())),
            Err(Error::Signaling(_))
        ));
    }
}
