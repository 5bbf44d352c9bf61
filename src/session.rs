//! Call lifecycle: at most one [`ActiveSession`] at a time, owned by the
//! [`CallController`] and torn down through a single idempotent hang-up path.
//!
//! Everything runs on one task. Relay messages, transport events, channel
//! events and user commands are multiplexed with `tokio::select!`; each input
//! is handled to completion before the next is taken. The one exception is a
//! negotiation step waiting on the transport: a relay `bye` or a user hang-up
//! abandons it.

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaAcquirer};
use crate::messaging::{Messenger, CLOSED_NOTICE};
use crate::negotiation::{NegotiationState, Negotiator, Role};
use crate::peer::data_channel::{ChannelEvent, ChannelState};
use crate::peer::transport::{
    subscribe, PeerState, Subscription, Transport, TransportEvent, TransportFactory,
};
use crate::room::RoomTracker;
use crate::signaling::{SignalingConnector, SignalingMessage, SignalingSender};
use crate::surface::{CallEvent, CallSurface};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Call,
    Send(String),
    HangUp,
    Shutdown,
}

/// Asks the user which room to join; `None` means cancelled
pub trait RoomPrompt: Send {
    fn room_name(&mut self) -> Option<String>;
}

impl<F> RoomPrompt for F
where
    F: FnMut() -> Option<String> + Send,
{
    fn room_name(&mut self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStart {
    Joined { room: String },
    /// Empty or cancelled room name; nothing was joined
    Aborted,
}

/// Relay messages for one session, plus whatever arrived while a
/// negotiation step was in flight
struct Inbox {
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    backlog: VecDeque<SignalingMessage>,
    hang_ups: mpsc::UnboundedReceiver<()>,
}

impl Inbox {
    fn new(
        inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> (Self, mpsc::UnboundedSender<()>) {
        let (tx, hang_ups) = mpsc::unbounded_channel();
        let inbox = Self {
            inbound,
            backlog: VecDeque::new(),
            hang_ups,
        };
        (inbox, tx)
    }

    async fn recv(&mut self) -> Option<SignalingMessage> {
        if let Some(msg) = self.backlog.pop_front() {
            return Some(msg);
        }
        self.inbound.recv().await
    }

    /// Run a negotiation step unless the peer leaves or the user hangs up
    /// first. `Ok(None)` means the step was abandoned; a `bye` that caused it
    /// is the next message handed out.
    async fn guard<T>(&mut self, step: impl Future<Output = Result<T>>) -> Result<Option<T>> {
        tokio::pin!(step);
        let mut relay_open = true;
        loop {
            tokio::select! {
                result = &mut step => return result.map(Some),
                _ = self.hang_ups.recv() => {
                    info!("Negotiation step abandoned on hang-up");
                    return Ok(None);
                }
                msg = self.inbound.recv(), if relay_open => match msg {
                    Some(SignalingMessage::Bye(room)) => {
                        info!("Peer left room {} mid-negotiation", room);
                        self.backlog.push_front(SignalingMessage::Bye(room));
                        return Ok(None);
                    }
                    Some(other) => self.backlog.push_back(other),
                    // surfaces again once the step is done
                    None => relay_open = false,
                },
            }
        }
    }
}

pub struct ActiveSession {
    room: String,
    signaling: SignalingSender,
    inbox: Inbox,
    hang_up_tx: mpsc::UnboundedSender<()>,
    tracker: RoomTracker,
    negotiator: Negotiator,
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    messenger: Option<Messenger>,
    local_stream: LocalStream,
}

enum SessionInput {
    Signal(Option<SignalingMessage>),
    Transport(Option<TransportEvent>),
    Channel(Option<ChannelEvent>),
}

impl ActiveSession {
    async fn next_input(&mut self) -> SessionInput {
        tokio::select! {
            msg = self.inbox.recv() => SessionInput::Signal(msg),
            ev = self.transport_events.recv() => SessionInput::Transport(ev),
            ev = next_channel_event(&mut self.messenger) => SessionInput::Channel(ev),
        }
    }
}

async fn next_channel_event(messenger: &mut Option<Messenger>) -> Option<ChannelEvent> {
    match messenger {
        Some(m) => m.next_event().await,
        None => std::future::pending().await,
    }
}

enum Step {
    Command(Option<UserCommand>),
    Input(SessionInput),
}

pub struct CallController {
    config: CallConfig,
    connector: Arc<dyn SignalingConnector>,
    transports: Arc<dyn TransportFactory>,
    media: MediaAcquirer,
    prompt: Box<dyn RoomPrompt>,
    surface: CallSurface,
    session: Option<ActiveSession>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        connector: Arc<dyn SignalingConnector>,
        transports: Arc<dyn TransportFactory>,
        prompt: impl RoomPrompt + 'static,
    ) -> Self {
        let media = MediaAcquirer::from_config(&config.media);
        Self {
            config,
            connector,
            transports,
            media,
            prompt: Box::new(prompt),
            surface: CallSurface::new(),
            session: None,
        }
    }

    pub fn with_media(mut self, media: MediaAcquirer) -> Self {
        self.media = media;
        self
    }

    pub fn subscribe_events(&mut self) -> mpsc::UnboundedReceiver<CallEvent> {
        self.surface.subscribe_events()
    }

    pub fn surface(&self) -> &CallSurface {
        &self.surface
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn room(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.room.as_str())
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.session.as_ref().map(|s| s.negotiator.state())
    }

    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.negotiator.role())
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.session
            .as_ref()
            .and_then(|s| s.messenger.as_ref())
            .map(Messenger::state)
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.session.as_ref().map(|s| &s.local_stream)
    }

    /// Acquire media, connect to the relay, ask for a room and join it
    pub async fn start_call(&mut self) -> Result<CallStart> {
        if let Some(session) = &self.session {
            return Err(Error::SessionActive(session.room.clone()));
        }

        let stream = match self.media.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot start call: {}", e);
                self.surface.notify(CallEvent::Error(e.to_string()));
                return Err(e);
            }
        };
        self.surface.show_local(&stream);

        match self.open_session(&stream).await {
            Ok(Some(session)) => {
                let room = session.room.clone();
                self.session = Some(session);
                Ok(CallStart::Joined { room })
            }
            Ok(None) => {
                info!("No room given; call not started");
                stream.stop();
                self.surface.clear_videos();
                Ok(CallStart::Aborted)
            }
            Err(e) => {
                error!("Cannot start call: {}", e);
                stream.stop();
                self.surface.clear_videos();
                self.surface.notify(CallEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_session(&mut self, stream: &LocalStream) -> Result<Option<ActiveSession>> {
        let channel = self.connector.connect().await?;

        let room = match self.prompt.room_name() {
            Some(room) if !room.trim().is_empty() => room.trim().to_string(),
            _ => return Ok(None),
        };

        let (sink, subscription, transport_events) = subscribe();
        let transport = self.transports.create(&self.config, sink).await?;

        let mut negotiator = Negotiator::new(
            &room,
            Arc::clone(&transport),
            channel.sender.clone(),
            &self.config.data_channel_label,
            self.config.description_timeout(),
        );
        let joined = match transport.attach_local_tracks(stream).await {
            Ok(()) => negotiator.join(),
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            subscription.cancel();
            if let Err(close_err) = transport.close().await {
                warn!("Failed to close transport: {}", close_err);
            }
            return Err(e);
        }

        let (inbox, hang_up_tx) = Inbox::new(channel.inbound);
        Ok(Some(ActiveSession {
            tracker: RoomTracker::new(&room),
            room,
            signaling: channel.sender,
            inbox,
            hang_up_tx,
            negotiator,
            transport,
            subscription,
            transport_events,
            messenger: None,
            local_stream: stream.clone(),
        }))
    }

    /// Tear down the active call. Returns false when there was none.
    pub async fn hang_up(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            debug!("Hang up with no active call");
            return false;
        };
        info!("Hanging up room {}", session.room);

        if let Err(e) = session
            .signaling
            .emit(SignalingMessage::Bye(session.room.clone()))
        {
            warn!("Could not notify peer: {}", e);
        }

        session.subscription.cancel();
        session.local_stream.stop();
        self.surface.clear_videos();

        if let Err(e) = session.transport.close().await {
            warn!("Failed to close transport: {}", e);
        }
        if let Some(mut messenger) = session.messenger.take() {
            if let Err(e) = messenger.close().await {
                warn!("Failed to close side channel: {}", e);
            }
        }
        session.negotiator.close();

        self.surface.append(CLOSED_NOTICE);
        self.surface.notify(CallEvent::Disconnected);
        true
    }

    pub async fn send_message(&mut self, text: &str) -> Result<()> {
        let result = match self.session.as_ref() {
            None => Err(Error::ChannelState("no active call".into())),
            Some(ActiveSession {
                messenger: None, ..
            }) => Err(Error::ChannelState("side channel not established".into())),
            Some(ActiveSession {
                messenger: Some(messenger),
                ..
            }) => messenger.send(text, &mut self.surface).await,
        };
        if let Err(e) = &result {
            warn!("Message not sent: {}", e);
            self.surface.notify(CallEvent::Error(e.to_string()));
        }
        result
    }

    /// Handle the next session input. Returns false when no call is active.
    pub async fn pump(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let input = session.next_input().await;
        self.dispatch(input).await;
        true
    }

    /// Like [`pump`](Self::pump), giving up if nothing arrives within `wait`
    pub async fn try_pump(&mut self, wait: Duration) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let input = tokio::time::timeout(wait, session.next_input()).await;
        match input {
            Ok(input) => {
                self.dispatch(input).await;
                true
            }
            Err(_) => false,
        }
    }

    /// Drive the controller until the command stream ends or `Shutdown`.
    /// Either way the active call is hung up.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<UserCommand>) {
        let mut deferred = VecDeque::new();
        loop {
            let step = match (deferred.pop_front(), self.session.as_mut()) {
                (Some(cmd), _) => Step::Command(Some(cmd)),
                (None, Some(session)) => tokio::select! {
                    cmd = commands.recv() => Step::Command(cmd),
                    input = session.next_input() => Step::Input(input),
                },
                (None, None) => Step::Command(commands.recv().await),
            };

            let cmd = match step {
                Step::Command(cmd) => cmd,
                Step::Input(input) => {
                    match self
                        .dispatch_interruptible(input, &mut commands, &mut deferred)
                        .await
                    {
                        Some(teardown) => teardown,
                        None => continue,
                    }
                }
            };
            match cmd {
                None | Some(UserCommand::Shutdown) => {
                    info!("Shutting down");
                    self.hang_up().await;
                    return;
                }
                Some(cmd) => self.execute(cmd).await,
            }
        }
    }

    /// Dispatch one input while still listening for commands. A hang-up or
    /// shutdown cuts a waiting negotiation step short and is returned for the
    /// caller to carry out; other commands queue up in `deferred`.
    async fn dispatch_interruptible(
        &mut self,
        input: SessionInput,
        commands: &mut mpsc::UnboundedReceiver<UserCommand>,
        deferred: &mut VecDeque<UserCommand>,
    ) -> Option<Option<UserCommand>> {
        let hang_up_tx = self.session.as_ref().map(|s| s.hang_up_tx.clone());
        let dispatch = self.dispatch(input);
        tokio::pin!(dispatch);

        let mut teardown = None;
        loop {
            tokio::select! {
                _ = &mut dispatch => return teardown,
                cmd = commands.recv(), if teardown.is_none() => match cmd {
                    Some(UserCommand::Call) | Some(UserCommand::Send(_)) => {
                        deferred.extend(cmd);
                    }
                    cmd => {
                        if let Some(tx) = &hang_up_tx {
                            let _ = tx.send(());
                        }
                        teardown = Some(cmd);
                    }
                },
            }
        }
    }

    async fn execute(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::Call => match self.start_call().await {
                Ok(CallStart::Joined { room }) => info!("Waiting in room {}", room),
                Ok(CallStart::Aborted) => info!("Call start aborted"),
                Err(e) => warn!("Call not started: {}", e),
            },
            UserCommand::Send(text) => {
                let _ = self.send_message(&text).await;
            }
            UserCommand::HangUp => {
                self.hang_up().await;
            }
            UserCommand::Shutdown => {
                self.hang_up().await;
            }
        }
    }

    async fn dispatch(&mut self, input: SessionInput) {
        let result = match input {
            SessionInput::Signal(Some(msg)) => self.on_signal(msg).await,
            SessionInput::Signal(None) => Err(Error::Signaling("relay connection lost".into())),
            SessionInput::Transport(Some(event)) => self.on_transport_event(event).await,
            SessionInput::Transport(None) => {
                Err(Error::WebRtc("transport event stream ended".into()))
            }
            SessionInput::Channel(Some(event)) => {
                if let Some(messenger) = self.session.as_mut().and_then(|s| s.messenger.as_mut())
                {
                    messenger.handle(event, &mut self.surface).await;
                }
                Ok(())
            }
            SessionInput::Channel(None) => Ok(()),
        };

        if let Err(e) = result {
            self.report(e).await;
        }
    }

    async fn report(&mut self, e: Error) {
        if e.is_informational() {
            info!("{}", e);
            self.surface.notify(CallEvent::RoomNotice(e.to_string()));
        } else if e.ends_call() {
            error!("Call failed: {}", e);
            self.surface.notify(CallEvent::Error(e.to_string()));
            self.hang_up().await;
        } else {
            warn!("{}", e);
            self.surface.notify(CallEvent::Error(e.to_string()));
        }
    }

    async fn on_signal(&mut self, msg: SignalingMessage) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        debug!("Relay event {}", msg.event_name());

        match msg {
            SignalingMessage::Created(room) => session.tracker.on_created(&room),
            SignalingMessage::Joined(room) => session.tracker.on_joined(&room),
            SignalingMessage::Full(room) => session.tracker.on_full(&room)?,
            SignalingMessage::NewPeer(room) => {
                session.tracker.on_new_peer(&room);
                let step = session.negotiator.on_new_peer(&room);
                if let Some(Some(handle)) = session.inbox.guard(step).await? {
                    session.messenger = Some(Messenger::attach(handle));
                }
            }
            SignalingMessage::Invite(offer) => {
                let step = session.negotiator.on_invite(offer);
                session.inbox.guard(step).await?;
            }
            SignalingMessage::Accept(answer) => {
                let step = session.negotiator.on_ok(answer);
                session.inbox.guard(step).await?;
            }
            SignalingMessage::IceCandidate(candidate) => {
                let step = session.negotiator.on_remote_candidate(candidate);
                session.inbox.guard(step).await?;
            }
            SignalingMessage::Bye(room) => {
                info!("Peer left room {}", room);
                session.tracker.on_bye(&room);
                self.surface
                    .notify(CallEvent::RoomNotice(format!("peer left room {}", room)));
                self.hang_up().await;
            }
            SignalingMessage::Join(room) => {
                warn!("Unexpected join for room {} from relay", room)
            }
        }
        Ok(())
    }

    async fn on_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                session.negotiator.on_local_candidate(candidate)?
            }
            TransportEvent::RemoteTrack(track) => {
                info!("Remote {:?} track {} arrived", track.kind, track.id);
                self.surface.show_remote(track);
            }
            TransportEvent::RemoteDataChannel(handle) => {
                if session.negotiator.role() == Role::Caller || session.messenger.is_some() {
                    warn!(
                        "Ignoring unexpected remote data channel '{}'",
                        handle.channel.label()
                    );
                } else {
                    session.messenger = Some(Messenger::attach(handle));
                }
            }
            TransportEvent::StateChanged(state) => match state {
                PeerState::Connected => {
                    info!("Peer connection established in room {}", session.room);
                    self.surface.notify(CallEvent::Connected);
                }
                PeerState::Failed => {
                    return Err(Error::WebRtc("peer connection failed".into()));
                }
                PeerState::Disconnected => warn!("Peer connection disconnected"),
                other => debug!("Peer connection state {:?}", other),
            },
        }
        Ok(())
    }
}
