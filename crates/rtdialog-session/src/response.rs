use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rtdialog_frame::{event, event_name, Frame, MessageType};
use rtdialog_transport::TransportEvent;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioChunk, AudioSink, RecordingControl};
use crate::event::Event;
use crate::payload::{error_message, SessionStartedPayload};

/// Outcome of offering a chunk to the playback queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queued {
    /// Output is not started; the chunk was not kept.
    Rejected,
    Accepted,
    /// Accepted after evicting the oldest queued chunk.
    Evicted,
}

/// Synthesized speech waiting for the playback device. Holds at most
/// `capacity` chunks; the oldest is evicted first.
#[derive(Debug)]
struct PlaybackQueue {
    chunks: Mutex<VecDeque<AudioChunk>>,
    capacity: usize,
    ready: Notify,
    accepting: AtomicBool,
}

impl PlaybackQueue {
    fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            accepting: AtomicBool::new(false),
        }
    }

    fn push(&self, chunk: AudioChunk) -> Queued {
        if !self.accepting.load(Ordering::Acquire) {
            return Queued::Rejected;
        }
        let mut outcome = Queued::Accepted;
        if let Ok(mut chunks) = self.chunks.lock() {
            if chunks.len() >= self.capacity {
                chunks.pop_front();
                outcome = Queued::Evicted;
            }
            chunks.push_back(chunk);
        }
        self.ready.notify_one();
        outcome
    }

    fn pop(&self) -> Option<AudioChunk> {
        self.chunks.lock().ok().and_then(|mut chunks| chunks.pop_front())
    }

    fn clear(&self) -> usize {
        self.chunks
            .lock()
            .map(|mut chunks| chunks.drain(..).count())
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.chunks.lock().map(|chunks| chunks.len()).unwrap_or(0)
    }
}

/// Inbound counters.
#[derive(Debug, Default)]
pub struct InboundStats {
    audio_received: AtomicU64,
    audio_played: AtomicU64,
    audio_discarded: AtomicU64,
    audio_dropped: AtomicU64,
}

impl InboundStats {
    pub fn audio_received(&self) -> u64 {
        self.audio_received.load(Ordering::Relaxed)
    }

    pub fn audio_played(&self) -> u64 {
        self.audio_played.load(Ordering::Relaxed)
    }

    /// Chunks dropped from the playback queue when the user barged in.
    pub fn audio_discarded(&self) -> u64 {
        self.audio_discarded.load(Ordering::Relaxed)
    }

    /// Chunks evicted because the playback device fell behind.
    pub fn audio_dropped(&self) -> u64 {
        self.audio_dropped.load(Ordering::Relaxed)
    }
}

struct Shared {
    connection_active: AtomicBool,
    session_active: AtomicBool,
    queue: PlaybackQueue,
    controller: Mutex<Option<Arc<dyn RecordingControl>>>,
    stats: Arc<InboundStats>,
}

impl Shared {
    fn controller(&self) -> Option<Arc<dyn RecordingControl>> {
        self.controller.lock().ok().and_then(|slot| slot.clone())
    }
}

struct PlaybackTask {
    stop: CancellationToken,
    handle: JoinHandle<Box<dyn AudioSink>>,
}

/// Interprets inbound frames and owns the playback device.
///
/// Frames are dispatched on one task in arrival order. Synthesized speech is
/// queued for a separate playback task that pauses capture while it plays.
pub struct ResponseCoordinator {
    shared: Arc<Shared>,
    sink: Option<Box<dyn AudioSink>>,
    playback: Option<PlaybackTask>,
    dispatch: Option<JoinHandle<()>>,
    released: bool,
}

impl ResponseCoordinator {
    /// `backlog` bounds the chunks waiting for the playback device.
    pub fn new(sink: Box<dyn AudioSink>, backlog: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection_active: AtomicBool::new(false),
                session_active: AtomicBool::new(false),
                queue: PlaybackQueue::new(backlog),
                controller: Mutex::new(None),
                stats: Arc::new(InboundStats::default()),
            }),
            sink: Some(sink),
            playback: None,
            dispatch: None,
            released: false,
        }
    }

    /// Start dispatching `transport` events. The returned receiver yields one
    /// [`Event`] per interpreted frame and ends after
    /// [`Event::ConnectionClosed`].
    pub fn start(
        &mut self,
        transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        self.dispatch = Some(tokio::spawn(dispatch_loop(shared, transport, tx)));
        rx
    }

    /// Register the capability used to silence capture during playback.
    pub fn set_audio_recording_controller(&self, controller: Arc<dyn RecordingControl>) {
        if let Ok(mut slot) = self.shared.controller.lock() {
            *slot = Some(controller);
        }
    }

    pub fn is_connection_active(&self) -> bool {
        self.shared.connection_active.load(Ordering::Acquire)
    }

    pub fn is_session_active(&self) -> bool {
        self.shared.session_active.load(Ordering::Acquire)
    }

    /// Begin playing queued speech. No-op if already playing or released.
    pub fn start_audio_output(&mut self) {
        if self.playback.is_some() {
            return;
        }
        let Some(sink) = self.sink.take() else {
            return;
        };
        self.shared.queue.accepting.store(true, Ordering::Release);
        let stop = CancellationToken::new();
        let handle = tokio::spawn(playback_loop(sink, Arc::clone(&self.shared), stop.clone()));
        self.playback = Some(PlaybackTask { stop, handle });
        info!("audio output started");
    }

    /// Stop playback and discard anything still queued.
    pub async fn stop_audio_output(&mut self) {
        self.shared.queue.accepting.store(false, Ordering::Release);
        let Some(task) = self.playback.take() else {
            return;
        };
        task.stop.cancel();
        match task.handle.await {
            Ok(sink) => self.sink = Some(sink),
            Err(err) => warn!(error = %err, "playback task failed"),
        }
        let discarded = self.shared.queue.clear();
        debug!(discarded, "audio output stopped");
    }

    /// Stop playback and release the playback device. Idempotent.
    pub async fn release(&mut self) {
        self.stop_audio_output().await;
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.close().await {
                warn!(error = %err, "closing playback device failed");
            }
        }
        debug!("playback device released");
    }

    /// Chunks waiting for the playback device.
    pub fn queued_chunks(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn stats(&self) -> Arc<InboundStats> {
        Arc::clone(&self.shared.stats)
    }
}

impl Drop for ResponseCoordinator {
    fn drop(&mut self) {
        if let Some(task) = &self.playback {
            task.stop.cancel();
        }
        if let Some(dispatch) = &self.dispatch {
            dispatch.abort();
        }
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(item) = transport.recv().await {
        match item {
            TransportEvent::Frame(frame) => {
                if let Some(event) = interpret(&shared, frame) {
                    // A dropped receiver only means nobody is listening.
                    let _ = events.send(event);
                }
            }
            TransportEvent::Closed(reason) => {
                shared.connection_active.store(false, Ordering::Release);
                shared.session_active.store(false, Ordering::Release);
                let _ = events.send(Event::ConnectionClosed(reason));
                break;
            }
        }
    }
    debug!("response dispatch finished");
}

fn interpret(shared: &Shared, frame: Frame) -> Option<Event> {
    trace!(
        message_type = frame.message_type.name(),
        event = ?frame.event,
        payload_len = frame.payload.len(),
        "inbound frame"
    );

    match frame.message_type {
        MessageType::Error => {
            let code = frame.error_code.unwrap_or_default();
            let message = error_message(&frame.payload);
            warn!(code, message = %message, "server error");
            return Some(Event::SessionError { code, message });
        }
        MessageType::AudioOnlyServerResponse => return Some(audio(shared, frame.payload)),
        MessageType::FullServerResponse | MessageType::FrontEndResultServer => {}
        other => {
            warn!(message_type = other.name(), "unexpected message type from server");
            return None;
        }
    }

    let Some(id) = frame.event else {
        warn!("server frame without event id");
        return None;
    };

    let event = match id {
        event::CONNECTION_STARTED => {
            shared.connection_active.store(true, Ordering::Release);
            info!(connect_id = ?frame.connect_id, "connection started");
            Event::ConnectionAckReceived {
                connect_id: frame.connect_id,
            }
        }
        event::CONNECTION_FAILED => {
            shared.connection_active.store(false, Ordering::Release);
            Event::ConnectionFailed {
                message: error_message(&frame.payload),
            }
        }
        event::CONNECTION_FINISHED => {
            shared.connection_active.store(false, Ordering::Release);
            info!("connection finished by server");
            Event::ConnectionFinished
        }
        event::SESSION_STARTED => {
            shared.session_active.store(true, Ordering::Release);
            let payload: SessionStartedPayload =
                serde_json::from_slice(&frame.payload).unwrap_or_default();
            info!(
                session_id = ?frame.session_id,
                dialog_id = ?payload.dialog_id,
                "session started"
            );
            Event::SessionStarted {
                session_id: frame.session_id,
                dialog_id: payload.dialog_id,
            }
        }
        event::SESSION_FINISHED => {
            shared.session_active.store(false, Ordering::Release);
            info!(session_id = ?frame.session_id, "session finished");
            Event::SessionFinished {
                session_id: frame.session_id,
            }
        }
        event::SESSION_FAILED => {
            shared.session_active.store(false, Ordering::Release);
            Event::SessionError {
                code: frame.error_code.unwrap_or_default(),
                message: error_message(&frame.payload),
            }
        }
        event::TTS_RESPONSE => audio(shared, frame.payload),
        event::ASR_INFO => {
            let discarded = shared.queue.clear() as u64;
            shared
                .stats
                .audio_discarded
                .fetch_add(discarded, Ordering::Relaxed);
            debug!(discarded, "user speech detected, playback cleared");
            Event::UserSpeechDetected
        }
        other => {
            debug!(event = other, name = event_name(other), "server message");
            Event::ServerMessage {
                event: other,
                payload: frame.payload,
            }
        }
    };
    Some(event)
}

fn audio(shared: &Shared, payload: Bytes) -> Event {
    shared.stats.audio_received.fetch_add(1, Ordering::Relaxed);
    match shared.queue.push(AudioChunk::new(payload.clone())) {
        Queued::Accepted => {}
        Queued::Rejected => trace!("audio output not started, chunk not queued"),
        Queued::Evicted => {
            shared.stats.audio_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("playback behind, oldest chunk dropped");
        }
    }
    Event::AudioOutputChunk(payload)
}

async fn playback_loop(
    mut sink: Box<dyn AudioSink>,
    shared: Arc<Shared>,
    stop: CancellationToken,
) -> Box<dyn AudioSink> {
    let mut playing = false;

    loop {
        let Some(chunk) = shared.queue.pop() else {
            if playing {
                playing = false;
                if let Some(controller) = shared.controller() {
                    controller.resume();
                }
                trace!("playback drained");
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = shared.queue.ready.notified() => continue,
            }
        };

        if !playing {
            playing = true;
            if let Some(controller) = shared.controller() {
                controller.pause();
            }
            trace!("playback started");
        }

        let played = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            played = sink.play(chunk) => played,
        };
        match played {
            Ok(()) => {
                shared.stats.audio_played.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(error = %err, "playback failed"),
        }
    }

    if playing {
        if let Some(controller) = shared.controller() {
            controller.resume();
        }
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{ChannelSink, PauseSwitch};
    use rtdialog_transport::CloseReason;

    fn server_event(id: u32, payload: &'static [u8]) -> Frame {
        Frame::new(MessageType::FullServerResponse)
            .with_event(id)
            .with_payload(payload)
    }

    fn speech(marker: u8) -> Frame {
        Frame::new(MessageType::AudioOnlyServerResponse)
            .with_serialization(rtdialog_frame::Serialization::Raw)
            .with_event(event::TTS_RESPONSE)
            .with_session_id("s-1")
            .with_payload(vec![marker; 4])
    }

    fn coordinator() -> (
        ResponseCoordinator,
        mpsc::UnboundedReceiver<AudioChunk>,
        mpsc::UnboundedSender<TransportEvent>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (sink, played) = ChannelSink::new();
        let mut coordinator = ResponseCoordinator::new(Box::new(sink), 16);
        let (tx, rx) = mpsc::unbounded_channel();
        let events = coordinator.start(rx);
        (coordinator, played, tx, events)
    }

    #[tokio::test]
    async fn test_handshake_events_update_flags() {
        let (coordinator, _played, tx, mut events) = coordinator();

        tx.send(TransportEvent::Frame(
            server_event(event::CONNECTION_STARTED, b"{}").with_connect_id("c-1"),
        ))
        .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::ConnectionAckReceived {
                connect_id: Some("c-1".to_string())
            }
        );
        assert!(coordinator.is_connection_active());

        tx.send(TransportEvent::Frame(
            server_event(event::SESSION_STARTED, br#"{"dialog_id":"d-7"}"#).with_session_id("s-1"),
        ))
        .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::SessionStarted {
                session_id: Some("s-1".to_string()),
                dialog_id: Some("d-7".to_string()),
            }
        );
        assert!(coordinator.is_session_active());

        tx.send(TransportEvent::Closed(CloseReason::Local)).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::ConnectionClosed(CloseReason::Local)
        );
        assert!(events.recv().await.is_none());
        assert!(!coordinator.is_connection_active());
        assert!(!coordinator.is_session_active());
    }

    #[tokio::test]
    async fn test_error_frame_becomes_session_error() {
        let (_coordinator, _played, tx, mut events) = coordinator();
        let frame = Frame::new(MessageType::Error)
            .with_error_code(45000001)
            .with_payload(&br#"{"error":"bad app key"}"#[..]);
        tx.send(TransportEvent::Frame(frame)).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::SessionError {
                code: 45000001,
                message: "bad app key".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_audio_plays_in_order_and_pauses_capture() {
        let (mut coordinator, mut played, tx, mut events) = coordinator();
        let pause = Arc::new(PauseSwitch::new());
        let mut paused = pause.subscribe();
        coordinator.set_audio_recording_controller(pause.clone());
        coordinator.start_audio_output();

        for i in 0..3u8 {
            let frame = Frame::new(MessageType::AudioOnlyServerResponse)
                .with_serialization(rtdialog_frame::Serialization::Raw)
                .with_event(event::TTS_RESPONSE)
                .with_session_id("s-1")
                .with_payload(vec![i; 4]);
            tx.send(TransportEvent::Frame(frame)).unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(
                events.recv().await.unwrap(),
                Event::AudioOutputChunk(Bytes::from(vec![i; 4]))
            );
            assert_eq!(played.recv().await.unwrap().data.as_ref(), &[i; 4]);
        }

        // Capture resumes once the queue drains.
        paused.wait_for(|p| !*p).await.unwrap();
        assert_eq!(coordinator.stats().audio_received(), 3);

        coordinator.release().await;
        coordinator.release().await;
        assert!(played.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_audio_before_output_started_is_not_queued() {
        let (coordinator, _played, tx, mut events) = coordinator();
        let frame = Frame::new(MessageType::AudioOnlyServerResponse)
            .with_serialization(rtdialog_frame::Serialization::Raw)
            .with_event(event::TTS_RESPONSE)
            .with_session_id("s-1")
            .with_payload(&b"pcm"[..]);
        tx.send(TransportEvent::Frame(frame)).unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::AudioOutputChunk(_)
        ));
        assert_eq!(coordinator.queued_chunks(), 0);
    }

    #[tokio::test]
    async fn test_user_speech_clears_playback_queue() {
        let (coordinator, _played, tx, mut events) = coordinator();
        coordinator.shared.queue.accepting.store(true, Ordering::Release);
        coordinator.shared.queue.push(AudioChunk::new(&b"a"[..]));
        coordinator.shared.queue.push(AudioChunk::new(&b"b"[..]));

        tx.send(TransportEvent::Frame(
            server_event(event::ASR_INFO, b"{}").with_session_id("s-1"),
        ))
        .unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::UserSpeechDetected);
        assert_eq!(coordinator.queued_chunks(), 0);
        assert_eq!(coordinator.stats().audio_discarded(), 2);
    }

    #[tokio::test]
    async fn test_unknown_event_passes_through() {
        let (_coordinator, _played, tx, mut events) = coordinator();
        tx.send(TransportEvent::Frame(
            server_event(event::CHAT_RESPONSE, br#"{"content":"hi"}"#).with_session_id("s-1"),
        ))
        .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::ServerMessage {
                event: event::CHAT_RESPONSE,
                payload: Bytes::from_static(br#"{"content":"hi"}"#),
            }
        );
    }

    #[tokio::test]
    async fn test_slow_playback_drops_oldest_chunks() {
        let (sink, _played) = ChannelSink::new();
        let mut coordinator = ResponseCoordinator::new(Box::new(sink), 2);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = coordinator.start(rx);
        // Accept audio without a playback task draining the queue.
        coordinator.shared.queue.accepting.store(true, Ordering::Release);

        for marker in 0..5u8 {
            tx.send(TransportEvent::Frame(speech(marker))).unwrap();
            assert!(matches!(
                events.recv().await.unwrap(),
                Event::AudioOutputChunk(_)
            ));
        }

        assert_eq!(coordinator.queued_chunks(), 2);
        assert_eq!(coordinator.stats().audio_received(), 5);
        assert_eq!(coordinator.stats().audio_dropped(), 3);
        assert_eq!(coordinator.shared.queue.pop().unwrap().data.as_ref(), &[3; 4]);
        assert_eq!(coordinator.shared.queue.pop().unwrap().data.as_ref(), &[4; 4]);
    }
}
