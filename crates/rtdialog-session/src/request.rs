use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rtdialog_frame::{event, Frame};
use rtdialog_transport::{TransportClient, TransportError};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioChunk, AudioSource, PauseSwitch, RecordingControl};
use crate::error::{DialogError, Result};
use crate::payload::{ChatTtsTextPayload, SayHelloPayload, StartSessionPayload};

/// Which handshake step an [`Ack`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Connection,
    Session,
}

/// Completes when the orchestrator observes the matching server event.
#[derive(Debug)]
pub struct Ack {
    kind: AckKind,
    rx: oneshot::Receiver<Result<()>>,
}

impl Ack {
    pub fn kind(&self) -> AckKind {
        self.kind
    }

    /// Wait at most `timeout` for the acknowledgement.
    pub async fn wait(self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => Err(match self.kind {
                AckKind::Connection => DialogError::HandshakeTimeout(timeout),
                AckKind::Session => DialogError::SessionTimeout(timeout),
            }),
            Ok(Err(_)) => Err(DialogError::Disconnected(
                "acknowledgement abandoned".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

/// The completing half of an [`Ack`].
#[derive(Debug)]
pub struct AckResolver {
    tx: oneshot::Sender<Result<()>>,
}

impl AckResolver {
    pub fn resolve(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn reject(self, err: DialogError) {
        let _ = self.tx.send(Err(err));
    }
}

/// A sent request awaiting acknowledgement.
#[derive(Debug)]
pub struct PendingAck {
    pub ack: Ack,
    pub resolver: AckResolver,
}

impl PendingAck {
    fn new(kind: AckKind) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            ack: Ack { kind, rx },
            resolver: AckResolver { tx },
        }
    }
}

/// Outbound audio counters.
#[derive(Debug, Default)]
pub struct OutboundStats {
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
}

impl OutboundStats {
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Captured chunks discarded because the writer fell behind.
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
}

struct CaptureTask {
    stop: CancellationToken,
    handle: JoinHandle<Box<dyn AudioSource>>,
}

/// Drives the client-to-server direction and owns the capture device.
///
/// Control requests go out through [`TransportClient::send`]; captured audio
/// goes through [`TransportClient::try_send`] from a dedicated task, with a
/// bounded backlog that drops the oldest chunk when the writer is behind.
pub struct RequestCoordinator {
    transport: Arc<TransportClient>,
    source: Option<Box<dyn AudioSource>>,
    capture: Option<CaptureTask>,
    pause: Arc<PauseSwitch>,
    active_session: Option<String>,
    backlog_limit: usize,
    stats: Arc<OutboundStats>,
    released: bool,
}

impl RequestCoordinator {
    pub fn new(
        transport: Arc<TransportClient>,
        source: Box<dyn AudioSource>,
        backlog_limit: usize,
    ) -> Self {
        Self {
            transport,
            source: Some(source),
            capture: None,
            pause: Arc::new(PauseSwitch::new()),
            active_session: None,
            backlog_limit: backlog_limit.max(1),
            stats: Arc::new(OutboundStats::default()),
            released: false,
        }
    }

    /// Send StartConnection.
    pub async fn start_connection(&mut self) -> Result<PendingAck> {
        let frame = Frame::client_event(event::START_CONNECTION, None, &b"{}"[..]);
        self.transport.send(&frame).await?;
        info!("sent StartConnection");
        Ok(PendingAck::new(AckKind::Connection))
    }

    /// Send StartSession and register `session_id` as the active session.
    ///
    /// Rejected while another session is registered.
    pub async fn start_session(
        &mut self,
        session_id: &str,
        payload: &StartSessionPayload,
    ) -> Result<PendingAck> {
        if let Some(active) = &self.active_session {
            return Err(DialogError::SessionAlreadyActive(active.clone()));
        }
        let body = serde_json::to_vec(payload)?;
        let frame = Frame::client_event(event::START_SESSION, Some(session_id), body);
        self.transport.send(&frame).await?;
        self.active_session = Some(session_id.to_string());
        info!(session_id, "sent StartSession");
        Ok(PendingAck::new(AckKind::Session))
    }

    /// The registered session, if any.
    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Forget the registered session without telling the server.
    pub fn clear_session(&mut self) {
        self.active_session = None;
    }

    /// Send FinishSession for the registered session and forget it.
    pub async fn finish_session(&mut self) -> Result<()> {
        let Some(session_id) = self.active_session.take() else {
            return Ok(());
        };
        let frame = Frame::client_event(event::FINISH_SESSION, Some(&session_id), &b"{}"[..]);
        self.transport.send(&frame).await?;
        info!(session_id = %session_id, "sent FinishSession");
        Ok(())
    }

    /// Send FinishConnection.
    pub async fn finish_connection(&mut self) -> Result<()> {
        let frame = Frame::client_event(event::FINISH_CONNECTION, None, &b"{}"[..]);
        self.transport.send(&frame).await?;
        info!("sent FinishConnection");
        Ok(())
    }

    /// Ask the bot to speak `content`.
    pub async fn say_hello(&mut self, content: &str) -> Result<()> {
        let session_id = self.require_session()?;
        let body = serde_json::to_vec(&SayHelloPayload {
            content: content.to_string(),
        })?;
        let frame = Frame::client_event(event::SAY_HELLO, Some(session_id), body);
        self.transport.send(&frame).await?;
        Ok(())
    }

    /// Have the bot speak `content` verbatim; `start`/`end` bracket a stream.
    pub async fn chat_tts_text(&mut self, start: bool, end: bool, content: &str) -> Result<()> {
        let session_id = self.require_session()?;
        let body = serde_json::to_vec(&ChatTtsTextPayload {
            start,
            end,
            content: content.to_string(),
        })?;
        let frame = Frame::client_event(event::CHAT_TTS_TEXT, Some(session_id), body);
        self.transport.send(&frame).await?;
        Ok(())
    }

    fn require_session(&self) -> Result<&str> {
        self.active_session
            .as_deref()
            .ok_or_else(|| DialogError::InvalidState("no active session".to_string()))
    }

    /// Start streaming captured audio tagged to `session_id`.
    pub fn start_sending_audio(&mut self, session_id: &str) -> Result<()> {
        if self.active_session.as_deref() != Some(session_id) {
            return Err(DialogError::InvalidState(format!(
                "session {session_id} is not active"
            )));
        }
        if self.capture.is_some() {
            return Err(DialogError::InvalidState(
                "audio already streaming".to_string(),
            ));
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| DialogError::InvalidState("capture device released".to_string()))?;

        let stop = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            source,
            CaptureContext {
                transport: Arc::clone(&self.transport),
                session_id: session_id.to_string(),
                paused: self.pause.subscribe(),
                stop: stop.clone(),
                backlog_limit: self.backlog_limit,
                stats: Arc::clone(&self.stats),
            },
        ));
        self.capture = Some(CaptureTask { stop, handle });
        info!(session_id, "audio capture started");
        Ok(())
    }

    pub fn is_sending_audio(&self) -> bool {
        self.capture
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop the capture loop and wait for it to exit. Leaves the connection open.
    pub async fn stop_sending_audio(&mut self) {
        let Some(task) = self.capture.take() else {
            return;
        };
        task.stop.cancel();
        match task.handle.await {
            Ok(source) => self.source = Some(source),
            Err(err) => warn!(error = %err, "capture task failed"),
        }
        debug!("audio capture stopped");
    }

    /// Stop capture and release the capture device. Idempotent.
    pub async fn release(&mut self) {
        self.stop_sending_audio().await;
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut source) = self.source.take() {
            if let Err(err) = source.close().await {
                warn!(error = %err, "closing capture device failed");
            }
        }
        debug!("capture device released");
    }

    /// The capability handed to the response coordinator.
    pub fn recording_control(&self) -> Arc<dyn RecordingControl> {
        self.pause.clone()
    }

    pub fn stats(&self) -> Arc<OutboundStats> {
        Arc::clone(&self.stats)
    }
}

impl Drop for RequestCoordinator {
    fn drop(&mut self) {
        if let Some(task) = &self.capture {
            task.stop.cancel();
        }
    }
}

struct CaptureContext {
    transport: Arc<TransportClient>,
    session_id: String,
    paused: watch::Receiver<bool>,
    stop: CancellationToken,
    backlog_limit: usize,
    stats: Arc<OutboundStats>,
}

enum Flush {
    Drained,
    Behind,
    Closed,
}

async fn capture_loop(
    mut source: Box<dyn AudioSource>,
    mut ctx: CaptureContext,
) -> Box<dyn AudioSource> {
    let mut backlog: VecDeque<AudioChunk> = VecDeque::with_capacity(ctx.backlog_limit);

    loop {
        if *ctx.paused.borrow() {
            tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => break,
                resumed = async { ctx.paused.wait_for(|paused| !*paused).await.is_ok() } => {
                    if !resumed {
                        break;
                    }
                }
            }
            continue;
        }

        let next = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => break,
            next = source.next_chunk() => next,
        };
        match next {
            Ok(Some(chunk)) => {
                if backlog.len() >= ctx.backlog_limit {
                    backlog.pop_front();
                    ctx.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("capture backlog full, dropped oldest chunk");
                }
                backlog.push_back(chunk);
            }
            Ok(None) => {
                info!("capture source exhausted");
                drain(&ctx, &mut backlog).await;
                break;
            }
            Err(err) => {
                warn!(error = %err, "capture failed");
                break;
            }
        }

        if let Flush::Closed = flush(&ctx, &mut backlog) {
            break;
        }
    }
    source
}

/// Hand queued chunks to the writer until it pushes back.
fn flush(ctx: &CaptureContext, backlog: &mut VecDeque<AudioChunk>) -> Flush {
    while let Some(chunk) = backlog.front() {
        let frame = Frame::audio(&ctx.session_id, chunk.data.clone());
        match ctx.transport.try_send(&frame) {
            Ok(()) => {
                backlog.pop_front();
                ctx.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TransportError::WriteQueueFull) => return Flush::Behind,
            Err(err) => {
                debug!(error = %err, "audio send stopped");
                return Flush::Closed;
            }
        }
    }
    Flush::Drained
}

/// Deliver whatever is left once capture has ended.
async fn drain(ctx: &CaptureContext, backlog: &mut VecDeque<AudioChunk>) {
    while let Some(chunk) = backlog.pop_front() {
        let frame = Frame::audio(&ctx.session_id, chunk.data);
        let sent = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return,
            sent = ctx.transport.send(&frame) => sent,
        };
        if sent.is_err() {
            return;
        }
        ctx.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use rtdialog_frame::MessageType;
    use rtdialog_transport::{ConnectTarget, MemoryConnector, ServerConnection, TransportConfig};
    use tokio::time::Instant;

    use crate::audio::ChannelSource;

    async fn connected(
        connector: MemoryConnector,
        mut server: rtdialog_transport::MemoryServer,
        write_queue_depth: usize,
    ) -> (Arc<TransportClient>, ServerConnection) {
        let config = TransportConfig {
            write_queue_depth,
            ..TransportConfig::default()
        };
        let (client, _events) = TransportClient::new(
            Arc::new(connector),
            ConnectTarget::new("wss://dialog.test/api", "c-1"),
            config,
        );
        client.connect().unwrap();
        let conn = server.accept().await.unwrap();
        client
            .wait_for_connection(Duration::from_secs(1))
            .await
            .unwrap();
        (Arc::new(client), conn)
    }

    struct CountingSource {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AudioSource for CountingSource {
        async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (Box<dyn AudioSource>, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Box::new(CountingSource {
                closes: Arc::clone(&closes),
            }),
            closes,
        )
    }

    #[tokio::test]
    async fn test_start_session_rejects_second_session() {
        let (connector, server) = MemoryConnector::new();
        let (transport, mut conn) = connected(connector, server, 8).await;
        let (source, _) = counting();
        let mut requests = RequestCoordinator::new(transport, source, 4);
        let payload = StartSessionPayload::from(&crate::config::DialogConfig::default());

        requests.start_session("s-1", &payload).await.unwrap();
        let err = requests.start_session("s-2", &payload).await.unwrap_err();
        assert!(matches!(err, DialogError::SessionAlreadyActive(ref id) if id == "s-1"));
        assert_eq!(requests.active_session(), Some("s-1"));

        let sent = conn.recv_frame().await.unwrap().unwrap();
        assert_eq!(sent.message_type, MessageType::FullClientRequest);
        assert_eq!(sent.event, Some(event::START_SESSION));
        assert_eq!(sent.session_id.as_deref(), Some("s-1"));
        let body: serde_json::Value = serde_json::from_slice(&sent.payload).unwrap();
        assert_eq!(body["tts"]["audio_config"]["sample_rate"], 24000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ack_times_out() {
        let (connector, server) = MemoryConnector::new();
        let (transport, _conn) = connected(connector, server, 8).await;
        let (source, _) = counting();
        let mut requests = RequestCoordinator::new(transport, source, 4);

        let PendingAck {
            ack,
            resolver: _resolver,
        } = requests.start_connection().await.unwrap();
        let started = Instant::now();
        let err = ack.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DialogError::HandshakeTimeout(d) if d == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ack_resolution() {
        let resolved = PendingAck::new(AckKind::Session);
        resolved.resolver.resolve();
        assert!(resolved.ack.wait(Duration::from_secs(1)).await.is_ok());

        let rejected = PendingAck::new(AckKind::Connection);
        rejected.resolver.reject(DialogError::Server {
            code: 3,
            message: "denied".to_string(),
        });
        assert!(matches!(
            rejected.ack.wait(Duration::from_secs(1)).await,
            Err(DialogError::Server { code: 3, .. })
        ));

        let abandoned = PendingAck::new(AckKind::Connection);
        drop(abandoned.resolver);
        assert!(matches!(
            abandoned.ack.wait(Duration::from_secs(1)).await,
            Err(DialogError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_audio_requires_active_session() {
        let (connector, server) = MemoryConnector::new();
        let (transport, _conn) = connected(connector, server, 8).await;
        let (source, _) = counting();
        let mut requests = RequestCoordinator::new(transport, source, 4);

        assert!(matches!(
            requests.start_sending_audio("s-1"),
            Err(DialogError::InvalidState(_))
        ));
        assert!(matches!(
            requests.say_hello("hi").await,
            Err(DialogError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_release_closes_source_once() {
        let (connector, server) = MemoryConnector::new();
        let (transport, _conn) = connected(connector, server, 8).await;
        let (source, closes) = counting();
        let mut requests = RequestCoordinator::new(transport, source, 4);
        let payload = StartSessionPayload::from(&crate::config::DialogConfig::default());
        requests.start_session("s-1", &payload).await.unwrap();
        requests.start_sending_audio("s-1").unwrap();
        assert!(requests.is_sending_audio());

        requests.release().await;
        requests.release().await;
        assert!(!requests.is_sending_audio());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(requests.start_sending_audio("s-1").is_err());
    }

    #[tokio::test]
    async fn test_stalled_writer_drops_oldest_chunks() {
        let (connector, server) = MemoryConnector::new();
        let connector = connector.with_wire_capacity(1);
        let (transport, mut conn) = connected(connector, server, 1).await;
        let (source, feed) = ChannelSource::new(16);
        let mut requests = RequestCoordinator::new(transport, Box::new(source), 2);
        let payload = StartSessionPayload::from(&crate::config::DialogConfig::default());
        requests.start_session("s-1", &payload).await.unwrap();
        let start = conn.recv_frame().await.unwrap().unwrap();
        assert_eq!(start.event, Some(event::START_SESSION));

        for i in 0..10u8 {
            feed.send(bytes::Bytes::from(vec![i; 8])).await.unwrap();
        }
        drop(feed);
        requests.start_sending_audio("s-1").unwrap();

        let mut received = Vec::new();
        while received.last() != Some(&9u8) {
            let frame = conn.recv_frame().await.unwrap().unwrap();
            assert_eq!(frame.message_type, MessageType::AudioOnlyClientRequest);
            assert_eq!(frame.session_id.as_deref(), Some("s-1"));
            received.push(frame.payload[0]);
        }
        while requests.is_sending_audio() {
            tokio::task::yield_now().await;
        }

        assert!(received.windows(2).all(|pair| pair[0] < pair[1]));
        let stats = requests.stats();
        assert!(stats.chunks_dropped() > 0);
        assert_eq!(stats.chunks_sent(), received.len() as u64);
        assert_eq!(stats.chunks_sent() + stats.chunks_dropped(), 10);
    }
}
