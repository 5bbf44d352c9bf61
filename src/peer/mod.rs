pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod loopback;
pub mod transport;
pub mod types;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use data_channel::{ChannelEvent, ChannelHandle, ChannelState, SideChannel};
pub use ice::CandidateBuffer;
pub use loopback::{LoopbackFactory, LoopbackNetwork, LoopbackTransport};
pub use transport::{
    subscribe, EventSink, PeerState, Subscription, Transport, TransportEvent, TransportFactory,
};
pub use types::{IceCandidate, RemoteTrackInfo, SdpKind, SessionDescription};
