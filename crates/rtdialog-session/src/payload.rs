//! JSON bodies of control frames.
//!
//! Field names follow the service's wire schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{AudioFormat, BotPersona, DialogConfig};

/// Body of StartSession.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSessionPayload {
    pub tts: TtsPayload,
    pub dialog: DialogPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsPayload {
    pub audio_config: AudioConfigPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfigPayload {
    pub channel: u16,
    pub format: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogPayload {
    pub bot_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_id: Option<String>,
    pub system_role: String,
    pub speaking_style: String,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StartSessionPayload {
    pub fn new(persona: &BotPersona, audio: &AudioFormat) -> Self {
        Self {
            tts: TtsPayload {
                audio_config: AudioConfigPayload {
                    channel: audio.channels,
                    format: audio.encoding.clone(),
                    sample_rate: audio.sample_rate_hz,
                },
            },
            dialog: DialogPayload {
                bot_name: persona.bot_name.clone(),
                dialog_id: persona.dialog_id.clone(),
                system_role: persona.system_role.clone(),
                speaking_style: persona.speaking_style.clone(),
                extra: persona.extra.clone(),
            },
        }
    }
}

impl From<&DialogConfig> for StartSessionPayload {
    fn from(config: &DialogConfig) -> Self {
        Self::new(&config.persona, &config.output_audio)
    }
}

/// Body of SayHello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SayHelloPayload {
    pub content: String,
}

/// Body of ChatTTSText. `start`/`end` bracket a streamed utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTtsTextPayload {
    pub start: bool,
    pub end: bool,
    pub content: String,
}

/// Body of SessionStarted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionStartedPayload {
    #[serde(default)]
    pub dialog_id: Option<String>,
}

/// Best-effort error text from a server payload.
///
/// Uses the `error` field of a JSON object when present, the UTF-8 text
/// otherwise.
pub fn error_message(payload: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    if let Ok(body) = serde_json::from_slice::<ErrorBody>(payload) {
        return body.error;
    }
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
