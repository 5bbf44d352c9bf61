#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomcall::config::CallConfig;
use roomcall::media::LocalStream;
use roomcall::peer::{
    ChannelHandle, EventSink, IceCandidate, LoopbackFactory, LoopbackNetwork, LoopbackTransport,
    SessionDescription, Transport, TransportFactory,
};
use roomcall::signaling::{
    MemoryConnector, Relay, SignalingChannel, SignalingConnector, SignalingMessage,
    SignalingSender,
};
use roomcall::{CallController, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Memory connector that keeps a copy of everything the client sends
#[derive(Clone)]
pub struct RecordingConnector {
    inner: MemoryConnector,
    sent: Arc<Mutex<Vec<SignalingMessage>>>,
}

impl RecordingConnector {
    pub fn new(relay: &Relay) -> Self {
        Self {
            inner: relay.connector(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything sent so far, once the forwarding task has caught up
    pub async fn sent(&self) -> Vec<SignalingMessage> {
        tokio::time::sleep(QUIET).await;
        self.sent.lock().clone()
    }

    pub async fn count(&self, event: &str) -> usize {
        self.sent()
            .await
            .iter()
            .filter(|m| m.event_name() == event)
            .count()
    }
}

#[async_trait]
impl SignalingConnector for RecordingConnector {
    async fn connect(&self) -> Result<SignalingChannel> {
        let upstream = self.inner.connect().await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let sent = Arc::clone(&self.sent);
        let forward = upstream.sender.clone();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                sent.lock().push(msg.clone());
                if forward.emit(msg).is_err() {
                    break;
                }
            }
        });

        Ok(SignalingChannel {
            sender: SignalingSender::new(tx),
            inbound: upstream.inbound,
        })
    }
}

pub struct Peer {
    pub controller: CallController,
    pub transports: Arc<LoopbackFactory>,
    pub signaling: RecordingConnector,
}

pub fn peer(relay: &Relay, network: &LoopbackNetwork, room: &str) -> Peer {
    let transports = Arc::new(LoopbackFactory::new(network.clone()));
    let signaling = RecordingConnector::new(relay);
    let room = room.to_string();
    let controller = CallController::new(
        CallConfig::default(),
        Arc::new(signaling.clone()),
        transports.clone(),
        move || Some(room.clone()),
    );
    Peer {
        controller,
        transports,
        signaling,
    }
}

const QUIET: Duration = Duration::from_millis(20);

/// Pump every controller until none of them has input for a few rounds
pub async fn settle(peers: &mut [&mut Peer]) {
    let mut idle_rounds = 0;
    while idle_rounds < 3 {
        let mut progressed = false;
        for peer in peers.iter_mut() {
            while peer.controller.try_pump(QUIET).await {
                progressed = true;
            }
        }
        if progressed {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
        }
    }
}

/// Loopback transport whose offer/answer steps never finish
pub struct StalledTransport {
    inner: Arc<LoopbackTransport>,
}

#[async_trait]
impl Transport for StalledTransport {
    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        self.inner.attach_local_tracks(stream).await
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        std::future::pending().await
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        std::future::pending().await
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        std::future::pending().await
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        std::future::pending().await
    }

    fn has_remote_description(&self) -> bool {
        false
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.inner.add_ice_candidate(candidate).await
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        self.inner.create_data_channel(label).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[derive(Default)]
pub struct StalledFactory {
    network: LoopbackNetwork,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl StalledFactory {
    /// The loopback transport behind the most recent stalled one
    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for StalledFactory {
    async fn create(&self, _config: &CallConfig, events: EventSink) -> Result<Arc<dyn Transport>> {
        let inner = self.network.create(events);
        self.created.lock().push(Arc::clone(&inner));
        Ok(Arc::new(StalledTransport { inner }))
    }
}

pub struct StalledPeer {
    pub controller: CallController,
    pub transports: Arc<StalledFactory>,
    pub signaling: RecordingConnector,
}

pub fn stalled_peer(relay: &Relay, room: &str, step_timeout_secs: u64) -> StalledPeer {
    let transports = Arc::new(StalledFactory::default());
    let signaling = RecordingConnector::new(relay);
    let mut config = CallConfig::default();
    config.description_timeout_secs = step_timeout_secs;
    let room = room.to_string();
    let controller = CallController::new(
        config,
        Arc::new(signaling.clone()),
        transports.clone(),
        move || Some(room.clone()),
    );
    StalledPeer {
        controller,
        transports,
        signaling,
    }
}
