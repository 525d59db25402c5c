//! The control-frame envelope: `channel-or-blank LF payload`.
//!
//! Each message handed to us by a socket or transport is already a discrete
//! unit (a WebSocket TEXT frame, or one read from the agent conduit) — there
//! is no further byte-stream framing to do, so unlike the teacher's
//! `TcpCodec` this is a set of plain parsing/building functions rather than
//! a `tokio_util::codec::{Decoder, Encoder}` pair.

use serde_json::{Map, Value};

/// A parsed control command: the command name, the channel it addresses (if
/// any), and the full JSON object it was decoded from (so callers can read
/// additional fields like `resources` or rewrite `channel` in place before
/// re-serializing).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command: String,
    pub channel: Option<String>,
    pub options: Map<String, Value>,
}

/// Split a raw frame into its channel header (if non-empty) and payload.
/// Returns `None` on malformed input (no `LF` separator at all).
pub fn parse_frame(bytes: &[u8]) -> Option<(Option<String>, &[u8])> {
    let idx = bytes.iter().position(|&b| b == b'\n')?;
    let (channel, rest) = bytes.split_at(idx);
    let payload = &rest[1..];
    let channel = std::str::from_utf8(channel).ok()?;
    if channel.is_empty() {
        Some((None, payload))
    } else {
        Some((Some(channel.to_string()), payload))
    }
}

/// Parse a control frame's payload as a `{"command": ..., "channel": ...}`
/// JSON object. Fails on non-object JSON or a missing/non-string `command`.
pub fn parse_command(payload: &[u8]) -> Option<ParsedCommand> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let Value::Object(options) = value else {
        return None;
    };
    let command = options.get("command")?.as_str()?.to_string();
    let channel = options
        .get("channel")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ParsedCommand {
        command,
        channel,
        options,
    })
}

/// Build a control command's JSON payload from string-keyed fields,
/// skipping any pair whose value is `None`. The caller is responsible for
/// prepending the empty-channel `"\n"` prefix when sending this as a frame.
pub fn build_control(fields: &[(&str, Option<Value>)]) -> Vec<u8> {
    let mut map = Map::new();
    for (key, value) in fields {
        if let Some(value) = value {
            map.insert((*key).to_string(), value.clone());
        }
    }
    serde_json::to_vec(&Value::Object(map)).expect("JSON object serialization cannot fail")
}

/// Convenience: `build_control` plus the leading-`\n` control-frame prefix,
/// ready to hand to a socket or transport's send method.
pub fn encode_control_frame(fields: &[(&str, Option<Value>)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(b'\n');
    out.extend_from_slice(&build_control(fields));
    out
}

/// Build a data frame: `<local-channel>\n<payload>`.
pub fn encode_data_frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(channel.len() + 1 + payload.len());
    out.extend_from_slice(channel.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

fn str_field(s: &str) -> Option<Value> {
    Some(Value::String(s.to_string()))
}

/// Shorthand for building `("key", Some(Value::String(..)))` pairs, used
/// throughout the session/socket handlers when assembling control frames.
pub fn field(key: &'static str, value: Option<&str>) -> (&'static str, Option<Value>) {
    (key, value.and_then(str_field))
}
