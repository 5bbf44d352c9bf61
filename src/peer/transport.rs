//! Transport seam: the peer-to-peer engine behind a trait, with its events
//! delivered through a sink registered when the transport is created.

use crate::config::CallConfig;
use crate::error::Result;
use crate::media::LocalStream;
use crate::peer::data_channel::ChannelHandle;
use crate::peer::types::{IceCandidate, RemoteTrackInfo, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// `None` marks end-of-candidates
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrackInfo),
    /// Channel opened by the remote side (Callee only)
    RemoteDataChannel(ChannelHandle),
    StateChanged(PeerState),
}

/// Producer half handed to a transport; drops events once cancelled
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    active: Arc<AtomicBool>,
}

impl EventSink {
    /// Returns false when the subscription is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Cancellation handle for a transport's event registration
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub fn subscribe() -> (
    EventSink,
    Subscription,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicBool::new(true));
    (
        EventSink {
            tx,
            active: Arc::clone(&active),
        },
        Subscription { active },
        rx,
    )
}

/// One negotiation's worth of peer-to-peer transport.
///
/// Each description may be set once. Candidates are rejected with
/// [`crate::Error::Ice`] until a remote description exists; callers buffer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Must happen before the offer is created
    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Caller side only, before the offer
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle>;

    /// Releases tracks, channel and connection; later calls are no-ops
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &CallConfig, events: EventSink) -> Result<Arc<dyn Transport>>;
}
