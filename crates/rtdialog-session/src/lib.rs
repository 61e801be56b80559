//! Realtime dialogue sessions.
//!
//! This crate sits on top of [`rtdialog_transport`] and runs one spoken
//! dialogue end to end:
//!
//! - [`RequestCoordinator`] sends control requests and streams captured
//!   audio, dropping the oldest chunk when the writer falls behind.
//! - [`ResponseCoordinator`] interprets server frames into [`Event`]s and
//!   plays synthesized speech, pausing capture while it plays.
//! - [`DialogOrchestrator`] drives the lifecycle: connect, handshake,
//!   session start, steady state, and an ordered teardown.
//!
//! Audio devices are supplied by the caller through [`AudioSource`] and
//! [`AudioSink`].

pub mod audio;
pub mod config;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod payload;
pub mod request;
pub mod response;

pub use audio::{
    chunk_period, AudioChunk, AudioSink, AudioSource, ChannelSink, ChannelSource, PauseSwitch,
    ReaderSource, RecordingControl, WriterSink, CAPTURE_SAMPLE_RATE, DEFAULT_CHUNK_BYTES,
};
pub use config::{AudioFormat, BotPersona, Credentials, DialogConfig, Timeouts, DEFAULT_ENDPOINT};
pub use error::{DialogError, Result};
pub use event::Event;
pub use orchestrator::{DialogOrchestrator, DialogState, DialogStats, StatusListener};
pub use payload::StartSessionPayload;
pub use request::{Ack, AckKind, AckResolver, OutboundStats, PendingAck, RequestCoordinator};
pub use response::{InboundStats, ResponseCoordinator};
