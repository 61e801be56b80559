use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use rtdialog_session::{
    chunk_period, AudioChunk, AudioSource, DialogConfig, DialogError, DialogOrchestrator,
    DialogState, DialogStats, ReaderSource, StatusListener, WriterSink, CAPTURE_SAMPLE_RATE,
};
use rtdialog_transport::WebSocketConnector;

use crate::cmd::{parse_duration, DialArgs};
use crate::exit::{dialog_error, io_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{or_dash, print_fields, print_json, print_pretty, OutputFormat};

#[derive(Serialize)]
struct DialSummary {
    schema_id: &'static str,
    connect_id: String,
    session_id: String,
    state: &'static str,
    error: Option<String>,
    frames_sent: u64,
    frames_received: u64,
    audio_chunks_sent: u64,
    audio_chunks_dropped: u64,
    audio_chunks_received: u64,
    audio_chunks_played: u64,
}

impl DialSummary {
    fn new(
        connect_id: &str,
        session_id: &str,
        state: DialogState,
        error: Option<&DialogError>,
        stats: DialogStats,
    ) -> Self {
        Self {
            schema_id: "https://schemas.rtdialog.dev/cli/v1/dial-summary.schema.json",
            connect_id: connect_id.to_string(),
            session_id: session_id.to_string(),
            state: state.name(),
            error: error.map(ToString::to_string),
            frames_sent: stats.frames_sent,
            frames_received: stats.frames_received,
            audio_chunks_sent: stats.audio_chunks_sent,
            audio_chunks_dropped: stats.audio_chunks_dropped,
            audio_chunks_received: stats.audio_chunks_received,
            audio_chunks_played: stats.audio_chunks_played,
        }
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("connect_id", self.connect_id.clone()),
            ("session_id", self.session_id.clone()),
            ("state", self.state.to_string()),
            ("error", or_dash(self.error.as_deref())),
            ("frames_sent", self.frames_sent.to_string()),
            ("frames_received", self.frames_received.to_string()),
            ("audio_sent", self.audio_chunks_sent.to_string()),
            ("audio_dropped", self.audio_chunks_dropped.to_string()),
            ("audio_received", self.audio_chunks_received.to_string()),
            ("audio_played", self.audio_chunks_played.to_string()),
        ]
    }
}

pub fn run(args: DialArgs, format: OutputFormat) -> CliResult<i32> {
    let linger = parse_duration(&args.linger)?;
    let config = load_config(&args)?;
    config
        .validate()
        .map_err(|e| dialog_error("config", e))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_error("start runtime", e))?;
    let (summary, failure) = runtime.block_on(dial(args, config, linger))?;

    match format {
        OutputFormat::Json | OutputFormat::Raw => print_json(&summary),
        OutputFormat::Table => print_fields(&summary.rows()),
        OutputFormat::Pretty => print_pretty(&summary.rows()),
    }

    match (summary.state, failure) {
        ("failed", Some(err)) => Err(dialog_error("dial", err)),
        ("failed", None) => Err(CliError::new(FAILURE, "dial: dialogue failed")),
        _ => Ok(SUCCESS),
    }
}

fn load_config(args: &DialArgs) -> CliResult<DialogConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| io_error(&format!("read {}", path.display()), e))?;
            DialogConfig::from_json(&text).map_err(|e| dialog_error("config", e))?
        }
        None => DialogConfig::default(),
    };

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    let creds = &mut config.credentials;
    for (slot, value) in [
        (&mut creds.app_id, &args.app_id),
        (&mut creds.access_key, &args.access_key),
        (&mut creds.app_key, &args.app_key),
        (&mut creds.resource_id, &args.resource_id),
    ] {
        if let Some(value) = value {
            *slot = value.clone();
        }
    }
    if let Some(name) = &args.bot_name {
        config.persona.bot_name = name.clone();
    }
    if args.greeting.is_some() {
        config.greeting = args.greeting.clone();
    }
    Ok(config)
}

async fn dial(
    args: DialArgs,
    config: DialogConfig,
    linger: Duration,
) -> CliResult<(DialSummary, Option<DialogError>)> {
    let chunk_bytes = args.chunk_bytes.max(2);
    let source: Box<dyn AudioSource> = if args.input.as_os_str() == "-" {
        Box::new(paced(
            ReaderSource::new(tokio::io::stdin(), chunk_bytes),
            chunk_bytes,
            args.no_pacing,
        ))
    } else {
        let file = tokio::fs::File::open(&args.input)
            .await
            .map_err(|e| io_error(&format!("open {}", args.input.display()), e))?;
        Box::new(paced(
            ReaderSource::new(file, chunk_bytes),
            chunk_bytes,
            args.no_pacing,
        ))
    };
    let output = tokio::fs::File::create(&args.output)
        .await
        .map_err(|e| io_error(&format!("create {}", args.output.display()), e))?;

    let (input_done, input_ended) = oneshot::channel();
    let source = NotifyOnEnd {
        inner: source,
        ended: Some(input_done),
    };
    let listener: Arc<dyn StatusListener> =
        Arc::new(|status: &str| info!(status, "dialog status"));

    let dialog = DialogOrchestrator::new(
        config,
        Arc::new(WebSocketConnector::new()),
        Box::new(source),
        Box::new(WriterSink::new(output)),
        Some(listener),
    )
    .map_err(|e| dialog_error("dial", e))?;

    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    begin(&dialog, &session_id)?;

    let drained = async {
        if input_ended.await.is_ok() {
            info!(linger_ms = linger.as_millis() as u64, "input finished");
            tokio::time::sleep(linger).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        state = dialog.wait_terminal() => {
            info!(state = %state, "dialog ended");
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stopping dialog");
            dialog.stop().await;
        }
        _ = drained => {
            dialog.stop().await;
        }
    }

    let state = dialog.wait_terminal().await;
    let failure = dialog.take_error();
    let summary = DialSummary::new(
        dialog.connect_id(),
        &session_id,
        state,
        failure.as_ref(),
        dialog.stats(),
    );
    Ok((summary, failure))
}

fn begin(dialog: &DialogOrchestrator, session_id: &str) -> CliResult<()> {
    if dialog.start(session_id) {
        info!(connect_id = dialog.connect_id(), session_id, "dialing");
        Ok(())
    } else {
        Err(CliError::new(
            INTERNAL,
            format!("dial: dialogue not startable from state {}", dialog.state()),
        ))
    }
}

fn paced<R>(source: ReaderSource<R>, chunk_bytes: usize, no_pacing: bool) -> ReaderSource<R>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    if no_pacing {
        source
    } else {
        source.paced(chunk_period(chunk_bytes, CAPTURE_SAMPLE_RATE))
    }
}

/// Signals once when the wrapped source runs dry.
struct NotifyOnEnd {
    inner: Box<dyn AudioSource>,
    ended: Option<oneshot::Sender<()>>,
}

#[async_trait]
impl AudioSource for NotifyOnEnd {
    async fn next_chunk(&mut self) -> rtdialog_session::Result<Option<AudioChunk>> {
        let chunk = self.inner.next_chunk().await?;
        if chunk.is_none() {
            if let Some(ended) = self.ended.take() {
                let _ = ended.send(());
            }
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> rtdialog_session::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: DialArgs,
    }

    fn args(extra: &[&str]) -> DialArgs {
        let mut argv = vec!["dial"];
        argv.extend_from_slice(extra);
        Harness::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn flags_override_defaults() {
        let args = args(&[
            "--endpoint",
            "wss://dialog.test/api",
            "--app-id",
            "app-1",
            "--access-key",
            "ak",
            "--app-key",
            "sk",
            "--bot-name",
            "Doc",
            "--greeting",
            "hello",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.endpoint, "wss://dialog.test/api");
        assert_eq!(config.credentials.app_id, "app-1");
        assert_eq!(config.credentials.access_key, "ak");
        assert_eq!(config.credentials.app_key, "sk");
        assert_eq!(config.persona.bot_name, "Doc");
        assert_eq!(config.greeting.as_deref(), Some("hello"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn summary_rows_render_missing_error_as_dash() {
        let summary = DialSummary::new(
            "c-1",
            "s-1",
            DialogState::Closed,
            None,
            DialogStats {
                audio_chunks_sent: 4,
                ..DialogStats::default()
            },
        );
        let rows = summary.rows();
        assert!(rows.contains(&("state", "closed".to_string())));
        assert!(rows.contains(&("error", "-".to_string())));
        assert!(rows.contains(&("audio_sent", "4".to_string())));
    }

    #[tokio::test]
    async fn begin_rejects_a_stopped_dialogue() {
        use rtdialog_session::{ChannelSink, ChannelSource, Credentials};
        use rtdialog_transport::MemoryConnector;

        let (connector, _server) = MemoryConnector::new();
        let (source, _mic) = ChannelSource::new(1);
        let (sink, _speaker) = ChannelSink::new();
        let config = DialogConfig {
            credentials: Credentials {
                access_key: "ak".to_string(),
                app_key: "sk".to_string(),
                app_id: "app-1".to_string(),
                ..Credentials::default()
            },
            ..DialogConfig::default()
        };
        let dialog = DialogOrchestrator::new(
            config,
            Arc::new(connector),
            Box::new(source),
            Box::new(sink),
            None,
        )
        .unwrap();

        dialog.stop().await;
        let err = begin(&dialog, "s-1").unwrap_err();
        assert_eq!(err.code, INTERNAL);
        assert!(err.message.contains("closed"));
    }

    #[tokio::test]
    async fn notify_on_end_fires_once() {
        let reader: &'static [u8] = &[1, 2, 3, 4];
        let (tx, mut rx) = oneshot::channel();
        let mut source = NotifyOnEnd {
            inner: Box::new(ReaderSource::new(reader, 4)),
            ended: Some(tx),
        };

        assert!(source.next_chunk().await.unwrap().is_some());
        assert!(rx.try_recv().is_err());
        assert!(source.next_chunk().await.unwrap().is_none());
        assert!(rx.try_recv().is_ok());
        assert!(source.next_chunk().await.unwrap().is_none());
    }
}
