//! [`Transport`] over a webrtc-rs peer connection.
//!
//! Local tracks are static-sample tracks fed with filler frames once the
//! connection is up: the capture devices are simulated, and the far side only
//! reports a remote track after RTP for it arrives.

use crate::config::{CallConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaKind};
use crate::peer::data_channel::{attach_dc, ChannelHandle, SideChannel};
use crate::peer::transport::{EventSink, PeerState, Transport, TransportEvent, TransportFactory};
use crate::peer::types::{IceCandidate, RemoteTrackInfo, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// VP8 keyframe header for a 2x2 frame
const VIDEO_FILLER: &[u8] = &[0x50, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x02, 0x00, 0x02, 0x00];
// Opus silence
const AUDIO_FILLER: &[u8] = &[0xf8, 0xff, 0xfe];

type LocalTracks = Arc<Mutex<Vec<(Arc<TrackLocalStaticSample>, MediaKind)>>>;

/// [`Transport`] backed by a webrtc-rs peer connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: Arc<AtomicBool>,
    channels: Mutex<Vec<Arc<dyn SideChannel>>>,
    tracks: LocalTracks,
}

impl WebRtcTransport {
    pub async fn new(config: &CallConfig, events: EventSink) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&config.ice_servers))
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to create peer connection: {}", e)))?,
        );

        let closed = Arc::new(AtomicBool::new(false));
        let tracks = LocalTracks::default();
        wire_handlers(&pc, events, &tracks, &closed);

        Ok(Self {
            pc,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed,
            channels: Mutex::new(Vec::new()),
            tracks,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Negotiation("transport already closed".into()));
        }
        Ok(())
    }
}

/// Write filler samples to `track` until `closed` is set or the track
/// refuses a write. Unbound tracks swallow samples.
fn spawn_filler(
    track: Arc<TrackLocalStaticSample>,
    kind: MediaKind,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let (payload, period) = match kind {
        MediaKind::Video => (VIDEO_FILLER, Duration::from_millis(33)),
        MediaKind::Audio => (AUDIO_FILLER, Duration::from_millis(20)),
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        while !closed.load(Ordering::SeqCst) {
            ticker.tick().await;
            let sample = Sample {
                data: payload.to_vec().into(),
                duration: period,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("Stopped filler for track {}: {}", track.id(), e);
                break;
            }
        }
    })
}

fn wire_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: EventSink,
    tracks: &LocalTracks,
    closed: &Arc<AtomicBool>,
) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => {
                    candidate_events.emit(TransportEvent::LocalCandidate(Some(init.into())));
                }
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            },
            None => {
                candidate_events.emit(TransportEvent::LocalCandidate(None));
            }
        }
        Box::pin(async {})
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let track_events = events.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            let info = RemoteTrackInfo {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            };
            info!("Received remote track: {:?}", info);
            track_events.emit(TransportEvent::RemoteTrack(info));
            Box::pin(async {})
        },
    ));

    let channel_events = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        info!("Received remote data channel '{}'", dc.label());
        channel_events.emit(TransportEvent::RemoteDataChannel(attach_dc(dc)));
        Box::pin(async {})
    }));

    let tracks = Arc::clone(tracks);
    let closed = Arc::clone(closed);
    let feeding = Arc::new(AtomicBool::new(false));
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {:?}", st);
        // start feeding local tracks on the first connect only
        if st == RTCPeerConnectionState::Connected && !feeding.swap(true, Ordering::SeqCst) {
            for (track, kind) in tracks.lock().iter() {
                spawn_filler(Arc::clone(track), *kind, Arc::clone(&closed));
            }
        }
        let state = match st {
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        };
        events.emit(TransportEvent::StateChanged(state));
        Box::pin(async {})
    }));
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.normalized_url()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        self.ensure_open()?;
        if self.local_set.load(Ordering::SeqCst) {
            return Err(Error::Negotiation(
                "local tracks must be attached before the offer".into(),
            ));
        }

        for local in &stream.tracks {
            let mime_type = match local.kind {
                MediaKind::Video => MIME_TYPE_VP8,
                MediaKind::Audio => MIME_TYPE_OPUS,
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                local.id.clone(),
                stream.id.clone(),
            ));

            self.pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::WebRtc(format!("Failed to add {:?} track: {}", local.kind, e)))?;
            self.tracks.lock().push((track, local.kind));
        }

        info!(
            "Attached {} local tracks from stream {}",
            stream.tracks.len(),
            stream.id
        );
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::Negotiation(
                "cannot answer before a remote offer is set".into(),
            ));
        }
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let rtc = desc.to_rtc()?;
        if self.local_set.swap(true, Ordering::SeqCst) {
            return Err(Error::Negotiation("local description already set".into()));
        }
        if let Err(e) = self.pc.set_local_description(rtc).await {
            self.local_set.store(false, Ordering::SeqCst);
            return Err(Error::Negotiation(format!(
                "Failed to set local description: {}",
                e
            )));
        }
        debug!("Local {:?} description set", desc.kind);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        let rtc = desc.to_rtc()?;
        if self.remote_set.swap(true, Ordering::SeqCst) {
            return Err(Error::Negotiation("remote description already set".into()));
        }
        if let Err(e) = self.pc.set_remote_description(rtc).await {
            self.remote_set.store(false, Ordering::SeqCst);
            return Err(Error::Negotiation(format!(
                "Failed to set remote description: {}",
                e
            )));
        }
        debug!("Remote {:?} description set", desc.kind);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(Error::Ice("remote description not set".into()));
        }
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
        self.ensure_open()?;
        if self.local_set.load(Ordering::SeqCst) {
            return Err(Error::Negotiation(
                "data channel must be created before the offer".into(),
            ));
        }
        info!("Creating data channel '{}'", label);
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to create data channel: {}", e)))?;
        let handle = attach_dc(dc);
        self.channels.lock().push(Arc::clone(&handle.channel));
        Ok(handle)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            if let Err(e) = channel.close().await {
                warn!("Failed to close data channel: {}", e);
            }
        }
        self.tracks.lock().clear();

        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection closed");
        Ok(())
    }
}

pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, config: &CallConfig, events: EventSink) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(WebRtcTransport::new(config, events).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::subscribe;

    fn offline_config() -> CallConfig {
        CallConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let (sink, _sub, _rx) = subscribe();
        let transport = WebRtcTransport::new(&offline_config(), sink).await.unwrap();

        let err = transport.add_ice_candidate(host_candidate()).await.unwrap_err();
        assert!(matches!(err, Error::Ice(_)));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn descriptions_are_set_once() {
        let (sink_a, _sub_a, _rx_a) = subscribe();
        let (sink_b, _sub_b, _rx_b) = subscribe();
        let a = WebRtcTransport::new(&offline_config(), sink_a).await.unwrap();
        let b = WebRtcTransport::new(&offline_config(), sink_b).await.unwrap();

        let _channel = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.kind, crate::peer::types::SdpKind::Offer);
        a.set_local_description(offer.clone()).await.unwrap();
        assert!(matches!(
            a.set_local_description(offer.clone()).await,
            Err(Error::Negotiation(_))
        ));

        b.set_remote_description(offer.clone()).await.unwrap();
        assert!(b.has_remote_description());
        assert!(matches!(
            b.set_remote_description(offer).await,
            Err(Error::Negotiation(_))
        ));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn answer_requires_remote_offer() {
        let (sink, _sub, _rx) = subscribe();
        let transport = WebRtcTransport::new(&offline_config(), sink).await.unwrap();
        assert!(matches!(
            transport.create_answer().await,
            Err(Error::Negotiation(_))
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn filler_stops_once_closed() {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".into(),
            "camera".into(),
        ));
        let closed = Arc::new(AtomicBool::new(false));
        let filler = spawn_filler(track, MediaKind::Audio, Arc::clone(&closed));

        tokio::time::sleep(Duration::from_millis(60)).await;
        closed.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), filler)
            .await
            .expect("filler exits after close")
            .unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (sink, _sub, _rx) = subscribe();
        let transport = WebRtcTransport::new(&offline_config(), sink).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.create_offer().await,
            Err(Error::Negotiation(_))
        ));
    }
}
