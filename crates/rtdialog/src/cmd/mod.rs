use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod dial;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one spoken dialogue, streaming PCM in and out.
    Dial(DialArgs),
    /// Decode a single binary frame and print its fields.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Dial(args) => dial::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DialArgs {
    /// JSON dialogue config. Flags and RTDIALOG_* variables override it.
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Service endpoint URL.
    #[arg(long, env = "RTDIALOG_ENDPOINT")]
    pub endpoint: Option<String>,
    #[arg(long, env = "RTDIALOG_APP_ID")]
    pub app_id: Option<String>,
    #[arg(long, env = "RTDIALOG_ACCESS_KEY", hide_env_values = true)]
    pub access_key: Option<String>,
    #[arg(long, env = "RTDIALOG_APP_KEY", hide_env_values = true)]
    pub app_key: Option<String>,
    #[arg(long, env = "RTDIALOG_RESOURCE_ID")]
    pub resource_id: Option<String>,
    /// Bot display name.
    #[arg(long)]
    pub bot_name: Option<String>,
    /// Greeting spoken once the session is active.
    #[arg(long)]
    pub greeting: Option<String>,
    /// Session id. Default: random UUID.
    #[arg(long)]
    pub session_id: Option<String>,
    /// 16 kHz mono 16-bit PCM to send ("-" for stdin).
    #[arg(long, short = 'i', default_value = "-")]
    pub input: PathBuf,
    /// File receiving synthesized PCM.
    #[arg(long, short = 'o', default_value = "output.pcm")]
    pub output: PathBuf,
    /// Bytes per captured chunk.
    #[arg(long, default_value_t = rtdialog_session::DEFAULT_CHUNK_BYTES)]
    pub chunk_bytes: usize,
    /// Send input as fast as it can be read instead of in real time.
    #[arg(long)]
    pub no_pacing: bool,
    /// How long to keep listening after input ends (e.g. 3s, 500ms).
    #[arg(long, default_value = "3s")]
    pub linger: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex.
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub hex: Option<String>,
    /// Read frame bytes from file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Maximum payload size in bytes after decompression.
    #[arg(long, default_value_t = rtdialog_frame::DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended version information.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `150ms`, or bare seconds.
pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;

    if millis {
        Ok(Duration::from_millis(value))
    } else {
        Ok(Duration::from_secs(value))
    }
}
