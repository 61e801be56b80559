use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rtdialog_transport::{ConnectTarget, TransportConfig};
use serde::{Deserialize, Serialize};

use crate::error::{DialogError, Result};

/// Default dialogue endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://openspeech.bytedance.com/api/v3/realtime/dialogue";

/// Resource id for the realtime dialogue service.
pub const DEFAULT_RESOURCE_ID: &str = "volc.speech.dialog";

pub const HEADER_RESOURCE_ID: &str = "X-Api-Resource-Id";
pub const HEADER_ACCESS_KEY: &str = "X-Api-Access-Key";
pub const HEADER_APP_KEY: &str = "X-Api-App-Key";
pub const HEADER_APP_ID: &str = "X-Api-App-ID";
pub const HEADER_CONNECT_ID: &str = "X-Api-Connect-Id";

/// Opaque service credentials, sent as upgrade headers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub resource_id: String,
    /// Treated as secret; redacted in debug output.
    pub access_key: String,
    /// Treated as secret; redacted in debug output.
    pub app_key: String,
    pub app_id: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            resource_id: DEFAULT_RESOURCE_ID.to_string(),
            access_key: String::new(),
            app_key: String::new(),
            app_id: String::new(),
        }
    }
}

impl Credentials {
    /// Fail if any credential is empty.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("resource_id", &self.resource_id),
            ("access_key", &self.access_key),
            ("app_key", &self.app_key),
            ("app_id", &self.app_id),
        ] {
            if value.trim().is_empty() {
                return Err(DialogError::Config(format!("missing credential: {name}")));
            }
        }
        Ok(())
    }

    /// Upgrade headers for one connection attempt.
    pub fn headers(&self, connect_id: &str) -> Vec<(String, String)> {
        vec![
            (HEADER_RESOURCE_ID.to_string(), self.resource_id.clone()),
            (HEADER_ACCESS_KEY.to_string(), self.access_key.clone()),
            (HEADER_APP_KEY.to_string(), self.app_key.clone()),
            (HEADER_APP_ID.to_string(), self.app_id.clone()),
            (HEADER_CONNECT_ID.to_string(), connect_id.to_string()),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("resource_id", &self.resource_id)
            .field(
                "access_key",
                &format_args!("<redacted:{} bytes>", self.access_key.len()),
            )
            .field(
                "app_key",
                &format_args!("<redacted:{} bytes>", self.app_key.len()),
            )
            .field("app_id", &self.app_id)
            .finish()
    }
}

/// Bounds on each blocking step, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Socket open.
    pub connect_ms: u64,
    /// StartConnection acknowledgement.
    pub handshake_ms: u64,
    /// StartSession acknowledgement.
    pub session_ms: u64,
    /// Close handshake flush.
    pub close_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            handshake_ms: 5_000,
            session_ms: 5_000,
            close_ms: 2_000,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn session(&self) -> Duration {
        Duration::from_millis(self.session_ms)
    }

    pub fn close(&self) -> Duration {
        Duration::from_millis(self.close_ms)
    }
}

/// Who the bot is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotPersona {
    pub bot_name: String,
    pub system_role: String,
    pub speaking_style: String,
    /// Continue an earlier dialogue.
    pub dialog_id: Option<String>,
    /// Passed through to the service untouched.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for BotPersona {
    fn default() -> Self {
        let mut extra = BTreeMap::new();
        extra.insert("strict_audit".to_string(), serde_json::Value::Bool(false));
        Self {
            bot_name: "Assistant".to_string(),
            system_role: String::new(),
            speaking_style: String::new(),
            dialog_id: None,
            extra,
        }
    }
}

/// Synthesized speech format requested from the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    pub channels: u16,
    pub encoding: String,
    pub sample_rate_hz: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            channels: 1,
            encoding: "pcm".to_string(),
            sample_rate_hz: 24_000,
        }
    }
}

/// Everything needed to run one dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub timeouts: Timeouts,
    pub persona: BotPersona,
    pub output_audio: AudioFormat,
    /// Captured chunks held while the writer is behind; oldest dropped first.
    pub capture_backlog: usize,
    /// Synthesized chunks held while playback is behind; oldest dropped first.
    pub playback_backlog: usize,
    /// Outbound frames buffered ahead of the writer.
    pub write_queue_depth: usize,
    /// Send FinishSession/FinishConnection before closing on stop.
    pub graceful_finish: bool,
    /// Sent as SayHello once the session is active.
    pub greeting: Option<String>,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            credentials: Credentials::default(),
            timeouts: Timeouts::default(),
            persona: BotPersona::default(),
            output_audio: AudioFormat::default(),
            capture_backlog: 32,
            playback_backlog: 512,
            write_queue_depth: 64,
            graceful_finish: true,
            greeting: None,
        }
    }
}

impl DialogConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(DialogError::Config("endpoint must not be empty".to_string()));
        }
        if self.capture_backlog == 0 {
            return Err(DialogError::Config(
                "capture_backlog must be at least 1".to_string(),
            ));
        }
        if self.playback_backlog == 0 {
            return Err(DialogError::Config(
                "playback_backlog must be at least 1".to_string(),
            ));
        }
        self.credentials.validate()
    }

    /// Connect target for one attempt identified by `connect_id`.
    pub fn connect_target(&self, connect_id: &str) -> ConnectTarget {
        let mut target = ConnectTarget::new(self.endpoint.clone(), connect_id);
        target.headers = self.credentials.headers(connect_id);
        target
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            write_queue_depth: self.write_queue_depth.max(1),
            close_timeout: self.timeouts.close(),
            ..TransportConfig::default()
        }
    }
}
