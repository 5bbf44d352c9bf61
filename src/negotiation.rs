//! Offer/answer state machine.
//!
//! The role is never transmitted: a peer that hears `new_peer` becomes the
//! Caller, a peer that receives `invite` becomes the Callee. The role is
//! assigned once; events that contradict it are rejected, duplicates are
//! ignored. Remote candidates that arrive before the remote description are
//! buffered and replayed right after it is applied.

use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::peer::data_channel::ChannelHandle;
use crate::peer::ice::{analyze_candidates, CandidateBuffer};
use crate::peer::transport::Transport;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::{SignalingMessage, SignalingSender};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingPeer,
    /// Offer sent, waiting for `ok`
    Offering,
    Answering,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Caller,
    Callee,
}

pub struct Negotiator {
    state: NegotiationState,
    role: Role,
    room: String,
    transport: Arc<dyn Transport>,
    signaling: SignalingSender,
    pending: CandidateBuffer,
    sent: Vec<IceCandidate>,
    channel_label: String,
    step_timeout: Duration,
}

impl Negotiator {
    pub fn new(
        room: &str,
        transport: Arc<dyn Transport>,
        signaling: SignalingSender,
        channel_label: &str,
        step_timeout: Duration,
    ) -> Self {
        Self {
            state: NegotiationState::Idle,
            role: Role::Unassigned,
            room: room.to_string(),
            transport,
            signaling,
            pending: CandidateBuffer::default(),
            sent: Vec::new(),
            channel_label: channel_label.to_string(),
            step_timeout,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    /// Local candidates forwarded to the peer
    pub fn sent_candidates(&self) -> &[IceCandidate] {
        &self.sent
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn join(&mut self) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(Error::Negotiation(format!(
                "join requested in state {:?}",
                self.state
            )));
        }
        info!("Joining room {}", self.room);
        self.signaling
            .emit(SignalingMessage::Join(self.room.clone()))?;
        self.state = NegotiationState::AwaitingPeer;
        Ok(())
    }

    /// Become the Caller: create the side channel, then offer.
    ///
    /// Returns the channel handle, or `None` when the event was ignored.
    pub async fn on_new_peer(&mut self, room: &str) -> Result<Option<ChannelHandle>> {
        match (self.state, self.role) {
            (NegotiationState::Closed, _) => return Ok(None),
            (_, Role::Caller) => {
                warn!("Ignoring duplicate new_peer for room {}", room);
                return Ok(None);
            }
            (_, Role::Callee) => {
                return Err(Error::Negotiation(format!(
                    "new_peer for room {} while already Callee",
                    room
                )))
            }
            (NegotiationState::AwaitingPeer, Role::Unassigned) => {}
            (state, _) => {
                return Err(Error::Negotiation(format!(
                    "new_peer in state {:?}",
                    state
                )))
            }
        }

        info!("Peer joined room {}; acting as Caller", room);
        self.role = Role::Caller;

        let handle = self
            .transport
            .create_data_channel(&self.channel_label)
            .await?;
        let offer = self
            .bounded("create offer", self.transport.create_offer())
            .await?;
        self.bounded(
            "set local offer",
            self.transport.set_local_description(offer.clone()),
        )
        .await?;
        self.signaling.emit(SignalingMessage::Invite(offer))?;

        self.state = NegotiationState::Offering;
        Ok(Some(handle))
    }

    /// Become the Callee: apply the offer and reply with `ok`
    pub async fn on_invite(&mut self, offer: SessionDescription) -> Result<()> {
        match (self.state, self.role) {
            (NegotiationState::Closed, _) => return Ok(()),
            (_, Role::Callee) => {
                warn!("Ignoring duplicate invite in room {}", self.room);
                return Ok(());
            }
            (_, Role::Caller) => {
                return Err(Error::Negotiation(
                    "invite received while acting as Caller".into(),
                ))
            }
            (NegotiationState::Idle | NegotiationState::AwaitingPeer, Role::Unassigned) => {}
            (state, _) => {
                return Err(Error::Negotiation(format!("invite in state {:?}", state)))
            }
        }

        info!("Received invite in room {}; acting as Callee", self.room);
        self.role = Role::Callee;
        self.state = NegotiationState::Answering;

        self.bounded(
            "set remote offer",
            self.transport.set_remote_description(offer),
        )
        .await?;
        self.flush_pending().await;

        let answer = self
            .bounded("create answer", self.transport.create_answer())
            .await?;
        self.bounded(
            "set local answer",
            self.transport.set_local_description(answer.clone()),
        )
        .await?;
        self.signaling.emit(SignalingMessage::Accept(answer))?;

        self.state = NegotiationState::Connected;
        Ok(())
    }

    pub async fn on_ok(&mut self, answer: SessionDescription) -> Result<()> {
        match (self.state, self.role) {
            (NegotiationState::Closed, _) => return Ok(()),
            (NegotiationState::Connected, Role::Caller) => {
                warn!("Ignoring duplicate ok in room {}", self.room);
                return Ok(());
            }
            (NegotiationState::Offering, Role::Caller) => {}
            (state, role) => {
                return Err(Error::Negotiation(format!(
                    "ok received in state {:?} as {:?}",
                    state, role
                )))
            }
        }

        self.bounded(
            "set remote answer",
            self.transport.set_remote_description(answer),
        )
        .await?;
        self.flush_pending().await;

        info!("Answer applied; room {} connected", self.room);
        self.state = NegotiationState::Connected;
        Ok(())
    }

    pub async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        dump_candidate("remote", &candidate);

        if !self.transport.has_remote_description() {
            self.pending.push(candidate);
            debug!(
                "Buffered remote candidate until remote description is set ({} pending)",
                self.pending.len()
            );
            return Ok(());
        }

        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
        Ok(())
    }

    /// Forward a gathered candidate; `None` or an empty one ends gathering
    pub fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match candidate {
            Some(c) if !c.is_end_of_candidates() => {
                dump_candidate("local", &c);
                self.signaling
                    .emit(SignalingMessage::IceCandidate(c.clone()))?;
                self.sent.push(c);
            }
            _ => {
                info!("End of local candidates");
                analyze_candidates(&self.sent);
            }
        }
        Ok(())
    }

    /// Returns false if already closed
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        if !self.pending.is_empty() {
            debug!("Discarding {} buffered candidates", self.pending.len());
        }
        self.pending.clear();
        self.state = NegotiationState::Closed;
        true
    }

    async fn flush_pending(&mut self) {
        for candidate in self.pending.drain() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Failed to replay buffered candidate: {}", e);
            }
        }
    }

    async fn bounded<T>(&self, step: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.step_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout(format!(
                "{} did not complete within {:?}",
                step, self.step_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalStream;
    use crate::peer::loopback::{LoopbackNetwork, LoopbackTransport};
    use crate::peer::transport::subscribe;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    const STEP: Duration = Duration::from_secs(5);

    fn negotiator(
        transport: Arc<dyn Transport>,
    ) -> (Negotiator, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Negotiator::new("r1", transport, SignalingSender::new(tx), "chat", STEP),
            rx,
        )
    }

    fn loopback_pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let network = LoopbackNetwork::new();
        let (sink_a, _, _) = subscribe();
        let (sink_b, _, _) = subscribe();
        (network.create(sink_a), network.create(sink_b))
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn caller_and_callee_reach_connected() {
        let (a, b) = loopback_pair();
        let (mut caller, mut out_a) = negotiator(a.clone());
        let (mut callee, mut out_b) = negotiator(b.clone());

        caller.join().unwrap();
        callee.join().unwrap();
        assert!(matches!(out_a.try_recv(), Ok(SignalingMessage::Join(r)) if r == "r1"));
        assert!(matches!(out_b.try_recv(), Ok(SignalingMessage::Join(_))));

        let handle = caller.on_new_peer("r1").await.unwrap();
        assert!(handle.is_some());
        assert_eq!(caller.role(), Role::Caller);
        assert_eq!(caller.state(), NegotiationState::Offering);
        let offer = match out_a.try_recv().unwrap() {
            SignalingMessage::Invite(offer) => offer,
            other => panic!("expected invite, got {:?}", other),
        };

        callee.on_invite(offer).await.unwrap();
        assert_eq!(callee.role(), Role::Callee);
        assert_eq!(callee.state(), NegotiationState::Connected);
        let answer = match out_b.try_recv().unwrap() {
            SignalingMessage::Accept(answer) => answer,
            other => panic!("expected ok, got {:?}", other),
        };

        caller.on_ok(answer).await.unwrap();
        assert_eq!(caller.state(), NegotiationState::Connected);
        assert!(a.remote_description().is_some());
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_then_replayed() {
        let (a, b) = loopback_pair();
        let (mut caller, mut out_a) = negotiator(a.clone());
        let (mut callee, _out_b) = negotiator(b.clone());
        caller.join().unwrap();
        callee.join().unwrap();
        let _ = out_a.try_recv();

        callee.on_remote_candidate(candidate(1)).await.unwrap();
        callee.on_remote_candidate(candidate(2)).await.unwrap();
        assert_eq!(callee.pending_candidates(), 2);
        assert!(b.applied_candidates().is_empty());

        caller.on_new_peer("r1").await.unwrap();
        let Ok(SignalingMessage::Invite(offer)) = out_a.try_recv() else {
            panic!("expected invite");
        };
        callee.on_invite(offer).await.unwrap();

        assert_eq!(callee.pending_candidates(), 0);
        assert_eq!(b.applied_candidates(), vec![candidate(1), candidate(2)]);

        callee.on_remote_candidate(candidate(3)).await.unwrap();
        assert_eq!(b.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn conflicting_role_events_are_rejected() {
        let (a, b) = loopback_pair();
        let (mut caller, mut out_a) = negotiator(a);
        caller.join().unwrap();
        let _ = out_a.try_recv();
        caller.on_new_peer("r1").await.unwrap();
        let Ok(SignalingMessage::Invite(offer)) = out_a.try_recv() else {
            panic!("expected invite");
        };

        // duplicate new_peer is ignored
        assert!(caller.on_new_peer("r1").await.unwrap().is_none());
        assert!(matches!(
            caller.on_invite(offer.clone()).await,
            Err(Error::Negotiation(_))
        ));

        let (mut callee, _out_b) = negotiator(b);
        callee.join().unwrap();
        callee.on_invite(offer.clone()).await.unwrap();
        callee.on_invite(offer).await.unwrap();
        assert!(matches!(
            callee.on_new_peer("r1").await,
            Err(Error::Negotiation(_))
        ));
        assert!(matches!(
            callee.on_ok(SessionDescription::answer("v=0")).await,
            Err(Error::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_until_end_marker() {
        let (a, _b) = loopback_pair();
        let (mut negotiator, mut out) = negotiator(a);

        negotiator.on_local_candidate(Some(candidate(1))).unwrap();
        negotiator
            .on_local_candidate(Some(IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            }))
            .unwrap();
        negotiator.on_local_candidate(None).unwrap();

        assert_eq!(
            out.try_recv().unwrap(),
            SignalingMessage::IceCandidate(candidate(1))
        );
        assert!(out.try_recv().is_err());
        assert_eq!(negotiator.sent_candidates().len(), 1);
    }

    #[tokio::test]
    async fn closed_negotiator_ignores_late_events() {
        let (a, _b) = loopback_pair();
        let (mut negotiator, mut out) = negotiator(a.clone());
        negotiator.join().unwrap();
        let _ = out.try_recv();

        assert!(negotiator.close());
        assert!(!negotiator.close());
        negotiator
            .on_ok(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        negotiator.on_remote_candidate(candidate(1)).await.unwrap();
        assert!(negotiator.on_new_peer("r1").await.unwrap().is_none());
        assert!(a.local_description().is_none());
        assert!(out.try_recv().is_err());
    }

    /// Never resolves any description step
    struct StalledTransport {
        inner: Arc<LoopbackTransport>,
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn attach_local_tracks(&self, _stream: &LocalStream) -> Result<()> {
            Ok(())
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

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Err(Error::Ice("remote description not set".into()))
        }

        async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle> {
            self.inner.create_data_channel(label).await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stalled_transport_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (inner, _) = loopback_pair();
        let mut negotiator = Negotiator::new(
            "r1",
            Arc::new(StalledTransport { inner }),
            SignalingSender::new(tx),
            "chat",
            Duration::from_millis(50),
        );
        negotiator.join().unwrap();

        let err = negotiator.on_new_peer("r1").await.unwrap_err();
        assert!(matches!(err, Error::OperationTimeout(_)));
        assert!(err.ends_call());
    }
}
