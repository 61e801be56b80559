//! Dialogue lifecycle.
//!
//! [`DialogOrchestrator`] is a handle to an actor task that owns the
//! transport and both coordinators. Commands from the handle and events from
//! the response coordinator are processed on that one task, so lifecycle
//! transitions never race each other.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rtdialog_frame::event_name;
use rtdialog_transport::{ConnectionState, Connector, TransportClient, TransportError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioSink, AudioSource};
use crate::config::DialogConfig;
use crate::error::{DialogError, Result};
use crate::event::Event;
use crate::payload::StartSessionPayload;
use crate::request::{AckKind, OutboundStats, PendingAck, RequestCoordinator};
use crate::response::{InboundStats, ResponseCoordinator};

/// Lifecycle of one dialogue. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Idle,
    Connecting,
    Connected,
    SessionStarting,
    SessionActive,
    Stopping,
    Closed,
    Failed,
}

impl DialogState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SessionStarting => "session_starting",
            Self::SessionActive => "session_active",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receives a human-readable line on every lifecycle transition.
pub trait StatusListener: Send + Sync + 'static {
    fn on_status_update(&self, status: &str);
}

impl<F> StatusListener for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn on_status_update(&self, status: &str) {
        self(status)
    }
}

/// Point-in-time counters for a dialogue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialogStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_chunks_dropped: u64,
    pub audio_chunks_received: u64,
    pub audio_chunks_played: u64,
}

enum Command {
    Start {
        session_id: String,
    },
    Stop(oneshot::Sender<()>),
    SayHello {
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ChatTtsText {
        start: bool,
        end: bool,
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Runs one dialogue: connect, handshake, session, audio, teardown.
///
/// Construction wires every collaborator and spawns the actor, so it must
/// happen inside a tokio runtime. Dropping the handle stops the dialogue.
pub struct DialogOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<DialogState>>,
    failure: Arc<Mutex<Option<DialogError>>>,
    transport: Arc<TransportClient>,
    outbound: Arc<OutboundStats>,
    inbound: Arc<InboundStats>,
    connect_id: String,
    stopped: AtomicBool,
}

impl DialogOrchestrator {
    pub fn new(
        config: DialogConfig,
        connector: Arc<dyn Connector>,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
        listener: Option<Arc<dyn StatusListener>>,
    ) -> Result<Self> {
        config.validate()?;

        let connect_id = uuid::Uuid::new_v4().to_string();
        let (transport, transport_events) = TransportClient::new(
            connector,
            config.connect_target(&connect_id),
            config.transport_config(),
        );
        let transport = Arc::new(transport);

        let requests =
            RequestCoordinator::new(Arc::clone(&transport), source, config.capture_backlog);
        let mut responses = ResponseCoordinator::new(sink, config.playback_backlog);
        responses.set_audio_recording_controller(requests.recording_control());
        let events = responses.start(transport_events);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(DialogState::Idle);
        let state = Arc::new(state);
        let failure = Arc::new(Mutex::new(None));

        let handle = Self {
            commands: commands_tx,
            state: Arc::clone(&state),
            failure: Arc::clone(&failure),
            transport: Arc::clone(&transport),
            outbound: requests.stats(),
            inbound: responses.stats(),
            connect_id: connect_id.clone(),
            stopped: AtomicBool::new(false),
        };

        let actor = Actor {
            config,
            transport,
            requests,
            responses,
            events,
            events_open: true,
            inbox: Inbox {
                commands,
                stop_waiters: Vec::new(),
            },
            state,
            failure,
            listener,
        };
        info!(connect_id = %connect_id, "dialog created");
        tokio::spawn(actor.run());
        Ok(handle)
    }

    /// Begin the dialogue as `session_id`.
    ///
    /// Returns `false` without side effects unless the dialogue is idle.
    pub fn start(&self, session_id: impl Into<String>) -> bool {
        let claimed = self.state.send_if_modified(|state| {
            if *state == DialogState::Idle {
                *state = DialogState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            warn!(state = %self.state(), "start rejected, dialog not idle");
            return false;
        }
        self.commands
            .send(Command::Start {
                session_id: session_id.into(),
            })
            .is_ok()
    }

    /// Stop the dialogue and wait until every resource is released.
    ///
    /// Safe from any state and idempotent. Requests made afterwards fail
    /// with [`DialogError::Stopped`].
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if self.state().is_terminal() {
            return;
        }
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Stop(done)).is_err() {
            return;
        }
        // Dropped without a reply when the actor was already finishing.
        let _ = stopped.await;
    }

    /// Ask the bot to speak `content`. Requires an active session.
    pub async fn say_hello(&self, content: impl Into<String>) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.request(
            Command::SayHello {
                content: content.into(),
                reply,
            },
            result,
        )
        .await
    }

    /// Have the bot speak `content` verbatim. Requires an active session.
    pub async fn chat_tts_text(
        &self,
        start: bool,
        end: bool,
        content: impl Into<String>,
    ) -> Result<()> {
        let (reply, result) = oneshot::channel();
        self.request(
            Command::ChatTtsText {
                start,
                end,
                content: content.into(),
                reply,
            },
            result,
        )
        .await
    }

    async fn request(&self, command: Command, result: oneshot::Receiver<Result<()>>) -> Result<()> {
        let not_running = || {
            if self.stopped.load(Ordering::Acquire) {
                DialogError::Stopped
            } else {
                DialogError::InvalidState("dialog is not running".to_string())
            }
        };
        if self.stopped.load(Ordering::Acquire) {
            return Err(DialogError::Stopped);
        }
        self.commands.send(command).map_err(|_| not_running())?;
        result.await.map_err(|_| not_running())?
    }

    pub fn state(&self) -> DialogState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<DialogState> {
        self.state.subscribe()
    }

    /// Wait for `Closed` or `Failed`.
    pub async fn wait_terminal(&self) -> DialogState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// The error that failed the dialogue, once.
    pub fn take_error(&self) -> Option<DialogError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    pub fn stats(&self) -> DialogStats {
        DialogStats {
            frames_sent: self.transport.frames_sent(),
            frames_received: self.transport.frames_received(),
            audio_chunks_sent: self.outbound.chunks_sent(),
            audio_chunks_dropped: self.outbound.chunks_dropped(),
            audio_chunks_received: self.inbound.audio_received(),
            audio_chunks_played: self.inbound.audio_played(),
        }
    }
}

enum Abort {
    Stopped,
    Failed(DialogError),
}

impl From<DialogError> for Abort {
    fn from(err: DialogError) -> Self {
        Self::Failed(err)
    }
}

struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl Inbox {
    /// Handle a command outside the active session. Returns `true` when the
    /// dialogue must stop.
    fn interrupt(&mut self, command: Option<Command>) -> bool {
        match command {
            None => true,
            Some(Command::Stop(done)) => {
                self.stop_waiters.push(done);
                true
            }
            Some(Command::Start { .. }) => {
                debug!("start ignored, dialog already started");
                false
            }
            Some(Command::SayHello { reply, .. }) | Some(Command::ChatTtsText { reply, .. }) => {
                let _ = reply.send(Err(DialogError::InvalidState(
                    "session not active".to_string(),
                )));
                false
            }
        }
    }

    /// Run `fut` unless a stop arrives first.
    async fn guard<T>(
        &mut self,
        fut: impl Future<Output = Result<T>>,
    ) -> std::result::Result<T, Abort> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if self.interrupt(command) {
                        return Err(Abort::Stopped);
                    }
                }
                result = &mut fut => return result.map_err(Abort::Failed),
            }
        }
    }
}

struct Actor {
    config: DialogConfig,
    transport: Arc<TransportClient>,
    requests: RequestCoordinator,
    responses: ResponseCoordinator,
    events: mpsc::UnboundedReceiver<Event>,
    events_open: bool,
    inbox: Inbox,
    state: Arc<watch::Sender<DialogState>>,
    failure: Arc<Mutex<Option<DialogError>>>,
    listener: Option<Arc<dyn StatusListener>>,
}

impl Actor {
    async fn run(mut self) {
        let session_id = loop {
            match self.inbox.commands.recv().await {
                Some(Command::Start { session_id }) => break session_id,
                other => {
                    if self.inbox.interrupt(other) {
                        self.shutdown().await;
                        return;
                    }
                }
            }
        };

        self.announce(DialogState::Connecting, "connecting");
        match self.establish(&session_id).await {
            Ok(()) => self.steady().await,
            Err(Abort::Stopped) => self.shutdown().await,
            Err(Abort::Failed(err)) => self.fail(err).await,
        }
    }

    async fn establish(&mut self, session_id: &str) -> std::result::Result<(), Abort> {
        self.transport.connect().map_err(DialogError::from)?;
        let transport = Arc::clone(&self.transport);
        let connect_timeout = self.config.timeouts.connect();
        self.inbox
            .guard(async move {
                transport
                    .wait_for_connection(connect_timeout)
                    .await
                    .map_err(|err| match err {
                        TransportError::ConnectTimeout(limit) => DialogError::ConnectTimeout(limit),
                        other => DialogError::Transport(other),
                    })
            })
            .await?;
        self.announce(DialogState::Connected, "connected");

        let pending = self.requests.start_connection().await?;
        self.await_ack(pending, self.config.timeouts.handshake()).await?;

        self.announce(DialogState::SessionStarting, "starting session");
        let payload = StartSessionPayload::from(&self.config);
        let pending = self.requests.start_session(session_id, &payload).await?;
        self.await_ack(pending, self.config.timeouts.session()).await?;

        self.responses.start_audio_output();
        self.requests.start_sending_audio(session_id)?;
        self.announce(DialogState::SessionActive, "session active");

        if let Some(greeting) = self.config.greeting.clone() {
            self.requests.say_hello(&greeting).await?;
        }
        Ok(())
    }

    /// Wait for the acknowledgement in `pending`, routing inbound events
    /// meanwhile.
    async fn await_ack(
        &mut self,
        pending: PendingAck,
        timeout: Duration,
    ) -> std::result::Result<(), Abort> {
        let PendingAck { ack, resolver } = pending;
        let kind = ack.kind();
        let mut resolver = Some(resolver);
        let wait = ack.wait(timeout);
        tokio::pin!(wait);

        loop {
            tokio::select! {
                biased;
                command = self.inbox.commands.recv() => {
                    if self.inbox.interrupt(command) {
                        return Err(Abort::Stopped);
                    }
                }
                result = &mut wait => return result.map_err(Abort::Failed),
                event = self.events.recv(), if self.events_open => {
                    let Some(event) = event else {
                        self.events_open = false;
                        if let Some(resolver) = resolver.take() {
                            resolver.reject(DialogError::Disconnected(
                                "event stream ended".to_string(),
                            ));
                        }
                        continue;
                    };
                    match settle(kind, &event) {
                        InboundAck::Accepted => {
                            if let Some(resolver) = resolver.take() {
                                resolver.resolve();
                            }
                        }
                        InboundAck::Rejected(err) => {
                            if let Some(resolver) = resolver.take() {
                                resolver.reject(err);
                            }
                        }
                        InboundAck::Unrelated => self.observe(event),
                    }
                }
            }
        }
    }

    async fn steady(&mut self) {
        loop {
            tokio::select! {
                biased;
                command = self.inbox.commands.recv() => match command {
                    Some(Command::SayHello { content, reply }) => {
                        let _ = reply.send(self.requests.say_hello(&content).await);
                    }
                    Some(Command::ChatTtsText { start, end, content, reply }) => {
                        let _ = reply.send(self.requests.chat_tts_text(start, end, &content).await);
                    }
                    Some(Command::Start { .. }) => debug!("start ignored, dialog already started"),
                    Some(Command::Stop(done)) => {
                        self.inbox.stop_waiters.push(done);
                        return self.shutdown().await;
                    }
                    None => return self.shutdown().await,
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(Event::SessionError { code, message }) => {
                        return self.fail(DialogError::Server { code, message }).await;
                    }
                    Some(Event::ConnectionFailed { message }) => {
                        return self.fail(DialogError::Server { code: 0, message }).await;
                    }
                    Some(Event::ConnectionClosed(reason)) => {
                        return self.fail(DialogError::Disconnected(reason.to_string())).await;
                    }
                    Some(Event::SessionFinished { session_id }) => {
                        info!(session_id = ?session_id, "session ended by server");
                        self.requests.clear_session();
                        return self.shutdown().await;
                    }
                    Some(Event::ConnectionFinished) => {
                        self.requests.clear_session();
                        return self.shutdown().await;
                    }
                    Some(other) => self.observe(other),
                    None => {
                        self.events_open = false;
                        return self
                            .fail(DialogError::Disconnected("event stream ended".to_string()))
                            .await;
                    }
                },
            }
        }
    }

    fn observe(&self, event: Event) {
        match event {
            Event::AudioOutputChunk(pcm) => trace!(len = pcm.len(), "speech chunk"),
            Event::UserSpeechDetected => debug!("user speech detected"),
            Event::ServerMessage { event, payload } => {
                debug!(event, name = event_name(event), len = payload.len(), "server message");
            }
            other => debug!(event = ?other, "event ignored in current state"),
        }
    }

    /// Caller-requested or server-initiated end: finish politely, then close.
    async fn shutdown(&mut self) {
        self.announce(DialogState::Stopping, "stopping");
        self.teardown(true).await;
        self.announce(DialogState::Closed, "closed");
        self.release_stop_waiters();
    }

    async fn fail(&mut self, err: DialogError) {
        warn!(error = %err, "dialog failed");
        let status = format!("failed: {err}");
        self.teardown(false).await;
        if let Ok(mut slot) = self.failure.lock() {
            *slot = Some(err);
        }
        self.announce(DialogState::Failed, &status);
        self.release_stop_waiters();
    }

    /// Release everything in a fixed order. Every step is idempotent.
    async fn teardown(&mut self, graceful: bool) {
        self.requests.stop_sending_audio().await;

        if graceful
            && self.config.graceful_finish
            && self.transport.state() == ConnectionState::Connected
        {
            let connection_active = self.responses.is_connection_active();
            let requests = &mut self.requests;
            let finish = async move {
                if requests.active_session().is_some() {
                    if let Err(err) = requests.finish_session().await {
                        debug!(error = %err, "FinishSession not sent");
                    }
                }
                if connection_active {
                    if let Err(err) = requests.finish_connection().await {
                        debug!(error = %err, "FinishConnection not sent");
                    }
                }
            };
            if tokio::time::timeout(self.config.timeouts.close(), finish)
                .await
                .is_err()
            {
                debug!("finish requests timed out");
            }
        }

        self.requests.clear_session();
        self.requests.release().await;
        self.responses.release().await;
        self.transport.close().await;
    }

    fn announce(&self, next: DialogState, status: &str) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "dialog state changed");
        }
        if let Some(listener) = &self.listener {
            listener.on_status_update(status);
        }
    }

    fn release_stop_waiters(&mut self) {
        for done in self.inbox.stop_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}

/// How an inbound event bears on the acknowledgement being awaited.
enum InboundAck {
    Accepted,
    Rejected(DialogError),
    Unrelated,
}

fn settle(kind: AckKind, event: &Event) -> InboundAck {
    match (kind, event) {
        (AckKind::Connection, Event::ConnectionAckReceived { .. }) => InboundAck::Accepted,
        (AckKind::Session, Event::SessionStarted { .. }) => InboundAck::Accepted,
        (AckKind::Session, Event::SessionFinished { .. }) => InboundAck::Rejected(
            DialogError::Disconnected("session finished before it started".to_string()),
        ),
        (_, Event::ConnectionFailed { message }) => InboundAck::Rejected(DialogError::Server {
            code: 0,
            message: message.clone(),
        }),
        (_, Event::SessionError { code, message }) => InboundAck::Rejected(DialogError::Server {
            code: *code,
            message: message.clone(),
        }),
        (_, Event::ConnectionFinished) => InboundAck::Rejected(DialogError::Disconnected(
            "connection finished by server".to_string(),
        )),
        (_, Event::ConnectionClosed(reason)) => {
            InboundAck::Rejected(DialogError::Disconnected(reason.to_string()))
        }
        _ => InboundAck::Unrelated,
    }
}
