use crate::envelope::{ClientEnvelope, ServerEnvelope};
use crate::framing::{FrameError, DEFAULT_MAX_FRAME_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Serializes `value` as one JSON line terminated by `\n`.
pub fn encode_line<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let mut encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push('\n');
    Ok(encoded)
}

pub fn encode_client(envelope: &ClientEnvelope) -> Result<String, FrameError> {
    encode_line(envelope, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_server(envelope: &ServerEnvelope) -> Result<String, FrameError> {
    encode_line(envelope, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_client(value: Value) -> Result<ClientEnvelope, FrameError> {
    decode_value(value)
}

pub fn decode_server(value: Value) -> Result<ServerEnvelope, FrameError> {
    decode_value(value)
}

pub fn parse_client_line(line: &str) -> Result<ClientEnvelope, FrameError> {
    decode_client(parse_json(line)?)
}

pub fn parse_server_line(line: &str) -> Result<ServerEnvelope, FrameError> {
    decode_server(parse_json(line)?)
}

fn parse_json(line: &str) -> Result<Value, FrameError> {
    serde_json::from_str(line).map_err(|err| FrameError::Decode(err.to_string()))
}

fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, FrameError> {
    if !value.is_object() {
        return Err(FrameError::Decode("envelope must be a JSON object".to_string()));
    }
    serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))
}
