use std::fmt;
use std::io;

use rtdialog_frame::FrameError;
use rtdialog_session::DialogError;
use rtdialog_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => USAGE,
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Frame(err) => frame_error(context, err),
        TransportError::InvalidRequest(_) => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::ConnectTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn dialog_error(context: &str, err: DialogError) -> CliError {
    match err {
        DialogError::Transport(err) => transport_error(context, err),
        DialogError::Frame(err) => frame_error(context, err),
        DialogError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        DialogError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        DialogError::ConnectTimeout(_)
        | DialogError::HandshakeTimeout(_)
        | DialogError::SessionTimeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        DialogError::Disconnected(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        DialogError::Server { .. } | DialogError::Audio(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeouts_map_to_124() {
        let err = dialog_error(
            "dial",
            DialogError::HandshakeTimeout(Duration::from_secs(5)),
        );
        assert_eq!(err.code, TIMEOUT);
        let err = dialog_error(
            "dial",
            DialogError::Transport(TransportError::ConnectTimeout(Duration::from_secs(10))),
        );
        assert_eq!(err.code, TIMEOUT);
    }

    #[test]
    fn config_and_decode_errors() {
        assert_eq!(
            dialog_error("load", DialogError::Config("missing credential".into())).code,
            USAGE
        );
        assert_eq!(
            transport_error("read", TransportError::Frame(FrameError::UnsupportedVersion(2))).code,
            DATA_INVALID
        );
        assert_eq!(
            transport_error("dial", TransportError::NotConnected).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn server_rejection_is_plain_failure() {
        let err = dialog_error(
            "dial",
            DialogError::Server {
                code: 45000001,
                message: "bad key".into(),
            },
        );
        assert_eq!(err.code, FAILURE);
        assert!(err.message.contains("bad key"));
    }
}
