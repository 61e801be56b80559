//! Protocol event identifiers.
//!
//! Events 1..=99 are connection-scoped and never carry a session id.
//! Everything else is session-scoped.

/// Client: open the logical connection.
pub const START_CONNECTION: u32 = 1;
/// Client: close the logical connection.
pub const FINISH_CONNECTION: u32 = 2;

/// Server: connection accepted.
pub const CONNECTION_STARTED: u32 = 50;
/// Server: connection rejected.
pub const CONNECTION_FAILED: u32 = 51;
/// Server: connection finished.
pub const CONNECTION_FINISHED: u32 = 52;

/// Client: open a dialogue session.
pub const START_SESSION: u32 = 100;
/// Client: close the dialogue session.
pub const FINISH_SESSION: u32 = 102;

/// Server: session accepted.
pub const SESSION_STARTED: u32 = 150;
/// Server: session finished.
pub const SESSION_FINISHED: u32 = 152;
/// Server: session failed.
pub const SESSION_FAILED: u32 = 153;

/// Client: captured audio chunk.
pub const TASK_REQUEST: u32 = 200;

/// Client: ask the bot to speak a greeting.
pub const SAY_HELLO: u32 = 300;

/// Server: synthesized sentence begins.
pub const TTS_SENTENCE_START: u32 = 350;
/// Server: synthesized sentence ends.
pub const TTS_SENTENCE_END: u32 = 351;
/// Server: synthesized audio.
pub const TTS_RESPONSE: u32 = 352;
/// Server: synthesis for the current turn is done.
pub const TTS_ENDED: u32 = 359;

/// Server: user speech detected; pending playback should be discarded.
pub const ASR_INFO: u32 = 450;
/// Server: recognition result.
pub const ASR_RESPONSE: u32 = 451;
/// Server: user finished speaking.
pub const ASR_ENDED: u32 = 459;

/// Client: text to synthesize directly.
pub const CHAT_TTS_TEXT: u32 = 500;

/// Server: chat reply text.
pub const CHAT_RESPONSE: u32 = 550;
/// Server: chat reply complete.
pub const CHAT_ENDED: u32 = 559;

/// Returns a human-readable name for an event ID.
pub fn event_name(id: u32) -> &'static str {
    match id {
        START_CONNECTION => "StartConnection",
        FINISH_CONNECTION => "FinishConnection",
        CONNECTION_STARTED => "ConnectionStarted",
        CONNECTION_FAILED => "ConnectionFailed",
        CONNECTION_FINISHED => "ConnectionFinished",
        START_SESSION => "StartSession",
        FINISH_SESSION => "FinishSession",
        SESSION_STARTED => "SessionStarted",
        SESSION_FINISHED => "SessionFinished",
        SESSION_FAILED => "SessionFailed",
        TASK_REQUEST => "TaskRequest",
        SAY_HELLO => "SayHello",
        TTS_SENTENCE_START => "TTSSentenceStart",
        TTS_SENTENCE_END => "TTSSentenceEnd",
        TTS_RESPONSE => "TTSResponse",
        TTS_ENDED => "TTSEnded",
        ASR_INFO => "ASRInfo",
        ASR_RESPONSE => "ASRResponse",
        ASR_ENDED => "ASREnded",
        CHAT_TTS_TEXT => "ChatTTSText",
        CHAT_RESPONSE => "ChatResponse",
        CHAT_ENDED => "ChatEnded",
        _ => "Unknown",
    }
}

/// Returns true if frames carrying this event include a session id field.
pub fn carries_session_id(event: u32) -> bool {
    !matches!(
        event,
        START_CONNECTION
            | FINISH_CONNECTION
            | CONNECTION_STARTED
            | CONNECTION_FAILED
            | CONNECTION_FINISHED
    )
}

/// Returns true if frames carrying this event include a connect id field.
pub fn carries_connect_id(event: u32) -> bool {
    matches!(
        event,
        CONNECTION_STARTED | CONNECTION_FAILED | CONNECTION_FINISHED
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_events_have_no_session_id() {
        for id in [1, 2, 50, 51, 52] {
            assert!(!carries_session_id(id), "event {id}");
        }
        for id in [100, 150, 200, 352, 450, 550] {
            assert!(carries_session_id(id), "event {id}");
        }
    }

    #[test]
    fn test_connect_id_only_on_server_connection_events() {
        assert!(carries_connect_id(CONNECTION_STARTED));
        assert!(carries_connect_id(CONNECTION_FINISHED));
        assert!(!carries_connect_id(START_CONNECTION));
        assert!(!carries_connect_id(SESSION_STARTED));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(event_name(ASR_INFO), "ASRInfo");
        assert_eq!(event_name(9999), "Unknown");
    }
}
