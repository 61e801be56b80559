//! Audio device collaborators.
//!
//! Capture and playback devices sit behind [`AudioSource`] and
//! [`AudioSink`]. PCM is opaque: chunks are moved through unchanged.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::error::{DialogError, Result};

/// Capture sample rate expected by the service (16 kHz mono, 16-bit).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// 160 frames of 16-bit mono PCM: 10 ms at 16 kHz.
pub const DEFAULT_CHUNK_BYTES: usize = 320;

/// Playback duration of `chunk_bytes` of 16-bit mono PCM at `sample_rate`.
pub fn chunk_period(chunk_bytes: usize, sample_rate: u32) -> Duration {
    let samples = (chunk_bytes / 2) as u64;
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
}

/// A timestamped buffer of PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
    pub captured_at: Instant,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Microphone side. Owned exclusively by the request coordinator.
#[async_trait]
pub trait AudioSource: Send + 'static {
    /// Next captured chunk; `Ok(None)` once the source is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>>;

    /// Release the capture device.
    async fn close(&mut self) -> Result<()>;
}

/// Speaker side. Owned exclusively by the response coordinator.
#[async_trait]
pub trait AudioSink: Send + 'static {
    async fn play(&mut self, chunk: AudioChunk) -> Result<()>;

    /// Release the playback device.
    async fn close(&mut self) -> Result<()>;
}

/// Pause/resume capability over the capture loop.
pub trait RecordingControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

/// [`RecordingControl`] backed by a watch channel the capture loop observes.
#[derive(Debug)]
pub struct PauseSwitch {
    tx: watch::Sender<bool>,
}

impl PauseSwitch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PauseSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingControl for PauseSwitch {
    fn pause(&self) {
        self.tx.send_replace(true);
    }

    fn resume(&self) {
        self.tx.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Reads fixed-size PCM chunks from any async reader, paced in real time.
pub struct ReaderSource<R> {
    reader: Option<R>,
    chunk_bytes: usize,
    pacing: Option<Interval>,
}

impl<R: AsyncRead + Unpin + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R, chunk_bytes: usize) -> Self {
        Self {
            reader: Some(reader),
            chunk_bytes: chunk_bytes.max(2),
            pacing: None,
        }
    }

    /// Release one chunk per `period` to mimic a live device.
    pub fn paced(mut self, period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.pacing = Some(interval);
        self
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> AudioSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.tick().await;
        }

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .await
                .map_err(|e| DialogError::Audio(format!("capture read failed: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.reader = None;
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(AudioChunk::new(buf)))
    }

    async fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

/// Writes played chunks to any async writer.
pub struct WriterSink<W> {
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AudioSink for WriterSink<W> {
    async fn play(&mut self, chunk: AudioChunk) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DialogError::Audio("playback device closed".to_string()))?;
        writer
            .write_all(&chunk.data)
            .await
            .map_err(|e| DialogError::Audio(format!("playback write failed: {e}")))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .await
                .map_err(|e| DialogError::Audio(format!("playback flush failed: {e}")))?;
            writer
                .shutdown()
                .await
                .map_err(|e| DialogError::Audio(format!("playback close failed: {e}")))?;
        }
        Ok(())
    }
}

/// Capture fed by an application through a channel.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    /// Returns the source and the sender that feeds it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { rx }, tx)
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn next_chunk(&mut self) -> Result<Option<AudioChunk>> {
        Ok(self.rx.recv().await.map(AudioChunk::new))
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

/// Playback forwarded to an application through a channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<AudioChunk>>,
}

impl ChannelSink {
    /// Returns the sink and the receiver of played chunks.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AudioChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl AudioSink for ChannelSink {
    async fn play(&mut self, chunk: AudioChunk) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DialogError::Audio("playback device closed".to_string()))?;
        tx.send(chunk)
            .map_err(|_| DialogError::Audio("playback receiver dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}
