use serde::Serialize;

use rtdialog_frame::{decode_frame, event_name, Frame};

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{
    or_dash, payload_preview, print_fields, print_json, print_pretty, print_raw, OutputFormat,
};

#[derive(Serialize)]
struct DecodedFrame<'a> {
    schema_id: &'static str,
    version: u8,
    header_size_words: u8,
    message_type: &'static str,
    flags: u8,
    serialization: &'static str,
    compression: &'static str,
    sequence: Option<i32>,
    error_code: Option<u32>,
    event: Option<u32>,
    event_name: Option<&'static str>,
    session_id: Option<&'a str>,
    connect_id: Option<&'a str>,
    payload_size: usize,
    payload_preview: String,
}

impl<'a> DecodedFrame<'a> {
    fn from_frame(frame: &'a Frame) -> Self {
        Self {
            schema_id: "https://schemas.rtdialog.dev/cli/v1/decode-frame.schema.json",
            version: frame.version,
            header_size_words: frame.header_size_words,
            message_type: frame.message_type.name(),
            flags: frame.flags.bits(),
            serialization: frame.serialization.name(),
            compression: frame.compression.name(),
            sequence: frame.sequence,
            error_code: frame.error_code,
            event: frame.event,
            event_name: frame.event.map(event_name),
            session_id: frame.session_id.as_deref(),
            connect_id: frame.connect_id.as_deref(),
            payload_size: frame.payload.len(),
            payload_preview: payload_preview(&frame.payload),
        }
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.to_string()),
            ("header_words", self.header_size_words.to_string()),
            ("message_type", self.message_type.to_string()),
            ("flags", format!("0b{:04b}", self.flags)),
            ("serialization", self.serialization.to_string()),
            ("compression", self.compression.to_string()),
            ("sequence", or_dash(self.sequence)),
            ("error_code", or_dash(self.error_code)),
            (
                "event",
                or_dash(self.event.map(|id| format!("{id} ({})", event_name(id)))),
            ),
            ("session_id", or_dash(self.session_id)),
            ("connect_id", or_dash(self.connect_id)),
            ("payload_size", self.payload_size.to_string()),
            ("payload", self.payload_preview.clone()),
        ]
    }
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = read_input(&args)?;
    let frame = decode_frame(&bytes, args.max_payload).map_err(|e| frame_error("decode", e))?;
    let decoded = DecodedFrame::from_frame(&frame);

    match format {
        OutputFormat::Json => print_json(&decoded),
        OutputFormat::Table => print_fields(&decoded.rows()),
        OutputFormat::Pretty => print_pretty(&decoded.rows()),
        OutputFormat::Raw => print_raw(&frame.payload),
    }

    Ok(SUCCESS)
}

fn read_input(args: &DecodeArgs) -> CliResult<Vec<u8>> {
    if let Some(path) = &args.file {
        return std::fs::read(path).map_err(|e| io_error(&format!("read {}", path.display()), e));
    }

    let text = args.hex.as_deref().unwrap_or_default();
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).map_err(|e| CliError::new(USAGE, format!("invalid hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtdialog_frame::event;

    #[test]
    fn decoded_fields_name_the_event() {
        let frame = Frame::client_event(event::START_SESSION, Some("s-1"), &b"{}"[..]);
        let bytes = frame.encode().unwrap();
        let decoded_frame = Frame::decode(&bytes).unwrap();
        let decoded = DecodedFrame::from_frame(&decoded_frame);

        assert_eq!(decoded.event, Some(event::START_SESSION));
        assert_eq!(decoded.event_name, Some("StartSession"));
        assert_eq!(decoded.session_id, Some("s-1"));
        assert_eq!(decoded.message_type, "FULL_CLIENT_REQUEST");

        let rows = decoded.rows();
        assert!(rows
            .iter()
            .any(|(name, value)| *name == "event" && value == "100 (StartSession)"));
    }

    #[test]
    fn hex_input_ignores_whitespace() {
        let args = DecodeArgs {
            hex: Some("11 10\n00 00".to_string()),
            file: None,
            max_payload: 1024,
        };
        assert_eq!(read_input(&args).unwrap(), vec![0x11, 0x10, 0x00, 0x00]);
    }
}
