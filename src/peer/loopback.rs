//! In-process transport pair.
//!
//! Two [`LoopbackTransport`]s created on the same [`LoopbackNetwork`] find
//! each other through the origin line of the offer they exchange, and connect
//! once the offering side applies the answer. The same ordering rules as the
//! WebRTC transport apply: each description once, candidates only after the
//! remote description, data channel and tracks before the offer.

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::LocalStream;
use crate::peer::data_channel::{ChannelEvent, ChannelHandle, ChannelState, SideChannel};
use crate::peer::transport::{EventSink, PeerState, Transport, TransportEvent, TransportFactory};
use crate::peer::types::{IceCandidate, RemoteTrackInfo, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    endpoints: HashMap<u64, Weak<LoopbackTransport>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, events: EventSink) -> Arc<LoopbackTransport> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let transport = Arc::new(LoopbackTransport {
            id,
            network: self.clone(),
            events,
            state: Mutex::new(LoopbackState::default()),
        });
        inner.endpoints.insert(id, Arc::downgrade(&transport));
        transport
    }

    fn endpoint(&self, id: u64) -> Option<Arc<LoopbackTransport>> {
        self.inner.lock().endpoints.get(&id).and_then(Weak::upgrade)
    }

    fn connect(&self, offerer: &LoopbackTransport, answerer_id: u64) -> Result<()> {
        let answerer = self.endpoint(answerer_id).ok_or_else(|| {
            Error::Negotiation(format!("no loopback endpoint {} to connect to", answerer_id))
        })?;

        let (offer_channel, offer_tracks) = {
            let state = offerer.state.lock();
            (state.channel.clone(), state.tracks.clone())
        };
        let answer_tracks = answerer.state.lock().tracks.clone();

        if let Some(offer_channel) = offer_channel {
            let (answer_channel, events) = LoopbackChannel::new(&offer_channel.label);
            *offer_channel.peer.lock() = Arc::downgrade(&answer_channel);
            *answer_channel.peer.lock() = Arc::downgrade(&offer_channel);
            answerer.state.lock().channel = Some(Arc::clone(&answer_channel));

            offer_channel.open();
            answer_channel.open();
            answerer.events.emit(TransportEvent::RemoteDataChannel(ChannelHandle {
                channel: answer_channel,
                events,
            }));
        }

        for track in offer_tracks {
            answerer.events.emit(TransportEvent::RemoteTrack(track));
        }
        for track in answer_tracks {
            offerer.events.emit(TransportEvent::RemoteTrack(track));
        }

        offerer.events.emit(TransportEvent::StateChanged(PeerState::Connected));
        answerer.events.emit(TransportEvent::StateChanged(PeerState::Connected));
        info!(
            "Loopback endpoints {} and {} connected",
            offerer.id, answerer_id
        );
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    peer: Option<u64>,
    tracks: Vec<RemoteTrackInfo>,
    channel: Option<Arc<LoopbackChannel>>,
    applied: Vec<IceCandidate>,
    gathered: Vec<IceCandidate>,
    closed: bool,
}

pub struct LoopbackTransport {
    id: u64,
    network: LoopbackNetwork,
    events: EventSink,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    /// Remote candidates accepted so far, in order
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Local candidates this endpoint produced
    pub fn gathered_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().gathered.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::Negotiation("transport already closed".into()));
        }
        Ok(())
    }

    fn render_sdp(&self) -> String {
        let state = self.state.lock();
        let channel = state
            .channel
            .as_ref()
            .map(|c| c.label.clone())
            .unwrap_or_else(|| "-".into());
        format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=loopback\r\na=tracks:{}\r\na=channel:{}\r\n",
            self.id,
            state.tracks.len(),
            channel
        )
    }

    fn gather(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(format!("lb{}", self.id)),
        };
        self.state.lock().gathered.push(candidate.clone());
        self.events.emit(TransportEvent::LocalCandidate(Some(candidate)));
        self.events.emit(TransportEvent::LocalCandidate(None));
    }
}

fn origin_id(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed || state.local.is_some() {
            return Err(Error::Negotiation(
                "local tracks must be attached before the offer".into(),
            ));
        }
        state
            .tracks
            .extend(stream.tracks.iter().map(|t| RemoteTrackInfo {
                id: t.id.clone(),
                stream_id: stream.id.clone(),
                kind: t.kind,
            }));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.render_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = matches!(
            self.state.lock().remote,
            Some(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        );
        if !has_offer {
            return Err(Error::Negotiation(
                "cannot answer before a remote offer is set".into(),
            ));
        }
        Ok(SessionDescription::answer(self.render_sdp()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Negotiation("transport already closed".into()));
            }
            if state.local.is_some() {
                return Err(Error::Negotiation("local description already set".into()));
            }
            match desc.kind {
                SdpKind::Offer if state.remote.is_some() => {
                    return Err(Error::Negotiation(
                        "cannot apply a local offer after a remote offer".into(),
                    ))
                }
                SdpKind::Answer if state.remote.is_none() => {
                    return Err(Error::Negotiation(
                        "cannot apply a local answer without a remote offer".into(),
                    ))
                }
                _ => {}
            }
            state.local = Some(desc);
        }
        self.gather();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let peer = origin_id(&desc.sdp)
            .ok_or_else(|| Error::Negotiation("description has no loopback origin".into()))?;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Negotiation("transport already closed".into()));
            }
            if state.remote.is_some() {
                return Err(Error::Negotiation("remote description already set".into()));
            }
            match desc.kind {
                SdpKind::Offer if state.local.is_some() => {
                    return Err(Error::Negotiation(
                        "cannot apply a remote offer after a local offer".into(),
                    ))
                }
                SdpKind::Answer if state.local.is_none() => {
                    return Err(Error::Negotiation(
                        "cannot apply a remote answer without a local offer".into(),
                    ))
                }
                _ => {}
            }
            state.remote = Some(desc.clone());
            state.peer = Some(peer);
        }

        if desc.kind == SdpKind::Answer {
            self.network.connect(self, peer)?;
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::Negotiation("transport already closed".into()));
        }
        if state.remote.is_none() {
            return Err(Error::Ice("remote description not set".into()));
        }
        debug!("Loopback {} applied candidate {}", self.id, candidate.candidate);
        state.applied.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        let mut state = self.state.lock();
        if state.closed || state.local.is_some() {
            return Err(Error::Negotiation(
                "data channel must be created before the offer".into(),
            ));
        }
        if state.channel.is_some() {
            return Err(Error::Negotiation("data channel already created".into()));
        }
        let (channel, events) = LoopbackChannel::new(label);
        state.channel = Some(Arc::clone(&channel));
        Ok(ChannelHandle { channel, events })
    }

    async fn close(&self) -> Result<()> {
        let (channel, peer) = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.tracks.clear();
            (state.channel.take(), state.peer)
        };

        if let Some(channel) = channel {
            channel.close().await?;
        }
        self.events.emit(TransportEvent::StateChanged(PeerState::Closed));
        if let Some(peer) = peer.and_then(|id| self.network.endpoint(id)) {
            peer.events
                .emit(TransportEvent::StateChanged(PeerState::Disconnected));
        }
        info!("Loopback endpoint {} closed", self.id);
        Ok(())
    }
}

pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    peer: Mutex<Weak<LoopbackChannel>>,
}

impl LoopbackChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            events: tx,
            peer: Mutex::new(Weak::new()),
        });
        (channel, rx)
    }

    fn open(&self) {
        *self.state.lock() = ChannelState::Open;
        let _ = self.events.send(ChannelEvent::Open);
    }

    fn shut(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            let _ = self.events.send(ChannelEvent::Closed);
        }
    }
}

#[async_trait]
impl SideChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(Error::ChannelState(format!("'{}' is {:?}", self.label, state)));
        }
        let peer = self
            .peer
            .lock()
            .upgrade()
            .ok_or_else(|| Error::ChannelState(format!("'{}' has no remote end", self.label)))?;
        let _ = peer.events.send(ChannelEvent::Message(text.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.shut();
        }
        Ok(())
    }
}

/// Factory that keeps every transport it hands out for later inspection
#[derive(Default)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
}

impl LoopbackFactory {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self {
            network,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(&self, _config: &CallConfig, events: EventSink) -> Result<Arc<dyn Transport>> {
        let transport = self.network.create(events);
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
