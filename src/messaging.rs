//! Text chat over the side channel.
//!
//! Caller and Callee wire the same handlers: on open the ready notice goes to
//! the peer, inbound text lands in the transcript tagged `PEER: `.

use crate::error::Result;
use crate::peer::data_channel::{ChannelEvent, ChannelHandle, ChannelState, SideChannel};
use crate::surface::{CallEvent, CallSurface};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const READY_NOTICE: &str = "*** Channel is ready ***";
pub const CLOSED_NOTICE: &str = "*** Channel is closed ***";
pub const ME_PREFIX: &str = "ME: ";
pub const PEER_PREFIX: &str = "PEER: ";

pub struct Messenger {
    channel: Arc<dyn SideChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    drained: bool,
    closed: bool,
}

impl Messenger {
    pub fn attach(handle: ChannelHandle) -> Self {
        info!("Side channel '{}' attached", handle.channel.label());
        Self {
            channel: handle.channel,
            events: handle.events,
            drained: false,
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        self.channel.label()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Next channel event. Yields `None` once when the channel side is
    /// gone, then never resolves.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.drained {
            return std::future::pending().await;
        }
        let event = self.events.recv().await;
        self.drained = event.is_none();
        event
    }

    pub async fn handle(&mut self, event: ChannelEvent, surface: &mut CallSurface) {
        match event {
            ChannelEvent::Open => {
                info!("Side channel '{}' is open", self.label());
                surface.notify(CallEvent::ChannelReady);
                if let Err(e) = self.channel.send_text(READY_NOTICE).await {
                    warn!("Could not send ready notice: {}", e);
                }
            }
            ChannelEvent::Message(text) => {
                debug!("Side channel message, {} bytes", text.len());
                surface.append(format!("{}{}", PEER_PREFIX, text));
            }
            ChannelEvent::Closed => {
                info!("Side channel '{}' closed by transport", self.label());
            }
        }
    }

    /// Fails with [`crate::Error::ChannelState`] unless the channel is open
    pub async fn send(&self, text: &str, surface: &mut CallSurface) -> Result<()> {
        self.channel.send_text(text).await?;
        surface.append(format!("{}{}", ME_PREFIX, text));
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::peer::loopback::LoopbackNetwork;
    use crate::peer::transport::{subscribe, Transport, TransportEvent};

    async fn open_pair() -> (Messenger, Messenger) {
        let network = LoopbackNetwork::new();
        let (sink_a, _sub_a, _rx_a) = subscribe();
        let (sink_b, _sub_b, mut rx_b) = subscribe();
        let a = network.create(sink_a);
        let b = network.create(sink_b);

        let handle = a.create_data_channel("chat").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut remote = None;
        while let Ok(event) = rx_b.try_recv() {
            if let TransportEvent::RemoteDataChannel(h) = event {
                remote = Some(h);
            }
        }
        (
            Messenger::attach(handle),
            Messenger::attach(remote.expect("remote channel")),
        )
    }

    #[tokio::test]
    async fn open_sends_ready_notice_to_peer() {
        let (mut caller, mut callee) = open_pair().await;
        let mut caller_surface = CallSurface::new();
        let mut callee_surface = CallSurface::new();

        let ev = caller.next_event().await.unwrap();
        caller.handle(ev, &mut caller_surface).await;

        // callee: Open, then the notice
        let ev = callee.next_event().await.unwrap();
        assert_eq!(ev, ChannelEvent::Open);
        callee.handle(ev, &mut callee_surface).await;
        let ev = callee.next_event().await.unwrap();
        callee.handle(ev, &mut callee_surface).await;

        assert_eq!(
            callee_surface.transcript().texts(),
            vec!["PEER: *** Channel is ready ***"]
        );
    }

    #[tokio::test]
    async fn send_appends_only_after_delivery() {
        let (mut caller, _callee) = open_pair().await;
        let mut surface = CallSurface::new();

        caller.send("hello", &mut surface).await.unwrap();
        assert_eq!(surface.transcript().texts(), vec!["ME: hello"]);

        caller.close().await.unwrap();
        caller.close().await.unwrap();
        assert!(matches!(
            caller.send("late", &mut surface).await,
            Err(Error::ChannelState(_))
        ));
        assert_eq!(surface.transcript().len(), 1);
    }
}
