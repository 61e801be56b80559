mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "rtdialog", version, about = "Realtime spoken-dialogue client")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "RTDIALOG_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dial_subcommand() {
        let cli = Cli::try_parse_from([
            "rtdialog",
            "dial",
            "--input",
            "mic.pcm",
            "--output",
            "bot.pcm",
            "--linger",
            "2s",
        ])
        .expect("dial args should parse");

        match cli.command {
            Command::Dial(args) => {
                assert_eq!(args.input.to_str(), Some("mic.pcm"));
                assert_eq!(args.linger, "2s");
                assert!(!args.no_pacing);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_hex_and_file_together() {
        let err = Cli::try_parse_from(["rtdialog", "decode", "11100000", "--file", "frame.bin"])
            .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn decode_requires_input() {
        let err = Cli::try_parse_from(["rtdialog", "decode"]).expect_err("input is required");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "rtdialog",
            "version",
            "--format",
            "json",
            "--log-format",
            "json",
        ])
        .expect("global flags should parse after the subcommand");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.log_format, LogFormat::Json));
    }
}
