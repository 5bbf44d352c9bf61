//! Room relay: admits at most two members per room and passes offer, answer
//! and candidate payloads between them without looking inside.

use crate::error::Result;
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingMessage, SignalingSender};
use crate::utils::random_id;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub const ROOM_CAPACITY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Created,
    Joined { existing: String },
    Full,
    /// The peer is already a member of that room
    AlreadyMember,
}

/// peer id -> room name
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, String>,
}

impl RoomRegistry {
    pub fn members(&self, room: &str) -> usize {
        self.rooms.values().filter(|r| r.as_str() == room).count()
    }

    pub fn join(&mut self, peer: &str, room: &str) -> JoinOutcome {
        if self.room_of(peer) == Some(room) {
            warn!("Peer {} already in room {}", peer, room);
            return JoinOutcome::AlreadyMember;
        }
        match self.members(room) {
            0 => {
                info!("Received join from user: {} for NEW room: {}", peer, room);
                self.rooms.insert(peer.to_string(), room.to_string());
                JoinOutcome::Created
            }
            n if n < ROOM_CAPACITY => {
                info!("Received join from user: {} for EXISTING room: {}", peer, room);
                let existing = self
                    .peer_in_room(room, peer)
                    .unwrap_or_default();
                self.rooms.insert(peer.to_string(), room.to_string());
                JoinOutcome::Joined { existing }
            }
            _ => {
                info!("Refusing join from user: {} for FULL room: {}", peer, room);
                JoinOutcome::Full
            }
        }
    }

    pub fn room_of(&self, peer: &str) -> Option<&str> {
        self.rooms.get(peer).map(String::as_str)
    }

    /// The other member of `room`, if any
    pub fn peer_in_room(&self, room: &str, excluding: &str) -> Option<String> {
        self.rooms
            .iter()
            .find(|(p, r)| r.as_str() == room && p.as_str() != excluding)
            .map(|(p, _)| p.clone())
    }

    pub fn leave(&mut self, peer: &str) -> Option<String> {
        self.rooms.remove(peer)
    }
}

#[derive(Default)]
struct RelayInner {
    registry: RoomRegistry,
    peers: HashMap<String, mpsc::UnboundedSender<SignalingMessage>>,
}

#[derive(Clone, Default)]
pub struct Relay {
    inner: Arc<Mutex<RelayInner>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client; returns its id and the queue of messages addressed to it
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<SignalingMessage>) {
        let id = random_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().peers.insert(id.clone(), tx);
        info!("Received connect from user: {}", id);
        (id, rx)
    }

    pub fn unregister(&self, peer: &str) {
        let mut inner = self.inner.lock();
        inner.peers.remove(peer);
        if let Some(room) = inner.registry.leave(peer) {
            debug!("User {} left room {} on disconnect", peer, room);
        }
        info!("Received disconnect from user: {}", peer);
    }

    pub fn members(&self, room: &str) -> usize {
        self.inner.lock().registry.members(room)
    }

    pub fn handle(&self, from: &str, msg: SignalingMessage) {
        let mut inner = self.inner.lock();
        match msg {
            SignalingMessage::Join(room) => match inner.registry.join(from, &room) {
                JoinOutcome::Created => inner.send(from, SignalingMessage::Created(room)),
                JoinOutcome::Joined { existing } => {
                    inner.send(from, SignalingMessage::Joined(room.clone()));
                    inner.send(&existing, SignalingMessage::NewPeer(room));
                }
                JoinOutcome::Full => inner.send(from, SignalingMessage::Full(room)),
                JoinOutcome::AlreadyMember => {}
            },
            SignalingMessage::Bye(room) => {
                let other = inner
                    .registry
                    .room_of(from)
                    .and_then(|r| inner.registry.peer_in_room(r, from));
                inner.registry.leave(from);
                info!("User {} said bye to room {}", from, room);
                if let Some(other) = other {
                    inner.send(&other, SignalingMessage::Bye(room));
                }
            }
            msg if msg.is_peer_payload() => {
                let Some(room) = inner.registry.room_of(from).map(str::to_string) else {
                    warn!("Dropping {} from {}: not in a room", msg.event_name(), from);
                    return;
                };
                debug!(
                    "Received {} message from user: {} in room {}",
                    msg.event_name(),
                    from,
                    room
                );
                match inner.registry.peer_in_room(&room, from) {
                    Some(other) => inner.send(&other, msg),
                    None => warn!("Dropping {} in room {}: no peer yet", msg.event_name(), room),
                }
            }
            other => warn!("Ignoring relay-only event {} from {}", other.event_name(), from),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            relay: self.clone(),
        }
    }

    /// Accept WebSocket clients until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("Accepted TCP connection from {}", addr);
            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.serve_client(stream).await {
                    warn!("Relay client {} ended with error: {}", addr, e);
                }
            });
        }
    }

    async fn serve_client(&self, stream: TcpStream) -> Result<()> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| crate::Error::Signaling(format!("WebSocket handshake failed: {}", e)))?;
        let (mut write, mut read) = ws.split();
        let (peer, mut outbound) = self.register();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {}: {}", msg.event_name(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                    Ok(msg) => self.handle(&peer, msg),
                    Err(e) => warn!("Malformed signaling frame from {}: {}", peer, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from {}: {}", peer, e);
                    break;
                }
            }
        }

        self.unregister(&peer);
        writer.abort();
        Ok(())
    }
}

impl RelayInner {
    fn send(&self, to: &str, msg: SignalingMessage) {
        match self.peers.get(to) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!("Peer {} is gone", to);
                }
            }
            None => debug!("No connection for peer {}", to),
        }
    }
}

/// In-process connection to a [`Relay`]
#[derive(Clone)]
pub struct MemoryConnector {
    relay: Relay,
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self) -> Result<SignalingChannel> {
        let (peer, inbound) = self.relay.register();
        let (tx, mut from_client) = mpsc::unbounded_channel();
        let relay = self.relay.clone();

        tokio::spawn(async move {
            while let Some(msg) = from_client.recv().await {
                relay.handle(&peer, msg);
            }
            relay.unregister(&peer);
        });

        Ok(SignalingChannel {
            sender: SignalingSender::new(tx),
            inbound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;

    #[test]
    fn registry_admits_two_members() {
        let mut registry = RoomRegistry::default();
        assert_eq!(registry.join("a", "r1"), JoinOutcome::Created);
        assert_eq!(
            registry.join("b", "r1"),
            JoinOutcome::Joined {
                existing: "a".into()
            }
        );
        assert_eq!(registry.join("c", "r1"), JoinOutcome::Full);
        assert_eq!(registry.members("r1"), 2);
        assert_eq!(registry.room_of("c"), None);

        assert_eq!(registry.leave("a").as_deref(), Some("r1"));
        assert_eq!(registry.peer_in_room("r1", "x").as_deref(), Some("b"));
    }

    #[test]
    fn repeated_join_changes_nothing() {
        let relay = Relay::new();
        let (a, mut rx_a) = relay.register();
        relay.handle(&a, SignalingMessage::Join("r1".into()));
        assert_eq!(rx_a.try_recv().unwrap(), SignalingMessage::Created("r1".into()));

        relay.handle(&a, SignalingMessage::Join("r1".into()));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(relay.members("r1"), 1);

        // the room still has a free seat
        let (b, mut rx_b) = relay.register();
        relay.handle(&b, SignalingMessage::Join("r1".into()));
        assert_eq!(rx_b.try_recv().unwrap(), SignalingMessage::Joined("r1".into()));
        assert_eq!(rx_a.try_recv().unwrap(), SignalingMessage::NewPeer("r1".into()));
    }

    #[test]
    fn relay_routes_join_outcomes_and_payloads() {
        let relay = Relay::new();
        let (a, mut rx_a) = relay.register();
        let (b, mut rx_b) = relay.register();
        let (c, mut rx_c) = relay.register();

        relay.handle(&a, SignalingMessage::Join("r1".into()));
        assert_eq!(rx_a.try_recv().unwrap(), SignalingMessage::Created("r1".into()));

        relay.handle(&b, SignalingMessage::Join("r1".into()));
        assert_eq!(rx_b.try_recv().unwrap(), SignalingMessage::Joined("r1".into()));
        assert_eq!(rx_a.try_recv().unwrap(), SignalingMessage::NewPeer("r1".into()));

        relay.handle(&c, SignalingMessage::Join("r1".into()));
        assert_eq!(rx_c.try_recv().unwrap(), SignalingMessage::Full("r1".into()));

        let offer = SignalingMessage::Invite(SessionDescription::offer("v=0"));
        relay.handle(&a, offer.clone());
        assert_eq!(rx_b.try_recv().unwrap(), offer);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn bye_leaves_room_and_notifies_other_member() {
        let relay = Relay::new();
        let (a, mut rx_a) = relay.register();
        let (b, mut rx_b) = relay.register();
        relay.handle(&a, SignalingMessage::Join("r1".into()));
        relay.handle(&b, SignalingMessage::Join("r1".into()));
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        relay.handle(&b, SignalingMessage::Bye("r1".into()));
        assert_eq!(rx_a.try_recv().unwrap(), SignalingMessage::Bye("r1".into()));
        assert_eq!(relay.members("r1"), 1);

        relay.handle(&a, SignalingMessage::Bye("r1".into()));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(relay.members("r1"), 0);
    }

    #[test]
    fn payload_outside_a_room_is_dropped() {
        let relay = Relay::new();
        let (a, _rx_a) = relay.register();
        let (_b, mut rx_b) = relay.register();
        relay.handle(&a, SignalingMessage::Invite(SessionDescription::offer("v=0")));
        assert!(rx_b.try_recv().is_err());
    }
}
