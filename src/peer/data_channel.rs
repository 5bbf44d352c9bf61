//! Side channel seam.
//!
//! [`attach_dc`] hooks a webrtc-rs data channel's callbacks into an event
//! queue created together with the channel, for both the channel the Caller
//! opens and the one the Callee receives.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::data_channel::{
    data_channel_message::DataChannelMessage, data_channel_state::RTCDataChannelState,
    RTCDataChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// Ordered text channel riding on the transport
#[async_trait]
pub trait SideChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Fails with [`Error::ChannelState`] unless the channel is open
    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// A channel plus the queue its events land in from the moment it exists,
/// so nothing sent before the consumer subscribes is lost.
pub struct ChannelHandle {
    pub channel: Arc<dyn SideChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("label", &self.channel.label())
            .field("state", &self.channel.state())
            .finish()
    }
}

pub struct WebRtcSideChannel {
    dc: Arc<RTCDataChannel>,
}

/// Wire open/message/close handlers onto a data channel
pub fn attach_dc(dc: Arc<RTCDataChannel>) -> ChannelHandle {
    info!("attach_dc called for channel '{}'", dc.label());
    // the queue exists before any callback can fire
    let (tx, rx) = mpsc::unbounded_channel();

    let open_tx = tx.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        info!("Data channel '{}' opened", label);
        let _ = open_tx.send(ChannelEvent::Open);
        Box::pin(async {})
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        debug!("Received message, length: {}", msg.data.len());
        // binary frames are shown as text too
        let text = String::from_utf8_lossy(&msg.data).into_owned();
        let _ = message_tx.send(ChannelEvent::Message(text));
        Box::pin(async {})
    }));

    // takes the last sender
    dc.on_close(Box::new(move || {
        info!("Data channel closed");
        let _ = tx.send(ChannelEvent::Closed);
        Box::pin(async {})
    }));

    ChannelHandle {
        channel: Arc::new(WebRtcSideChannel { dc }),
        events: rx,
    }
}

#[async_trait]
impl SideChannel for WebRtcSideChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn state(&self) -> ChannelState {
        match self.dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
            _ => ChannelState::Closed,
        }
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        // open channels only
        let state = self.state();
        if state != ChannelState::Open {
            return Err(Error::ChannelState(format!(
                "'{}' is {:?}",
                self.label(),
                state
            )));
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to send on data channel: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.state() == ChannelState::Closed {
            return Ok(());
        }
        self.dc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close data channel: {}", e)))
    }
}
