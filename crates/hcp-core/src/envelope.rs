use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Binary payload carried as standard padded base64 so an envelope never
/// contains a raw line terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl Base64Bytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Base64Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Base64Bytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&B64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Base64Visitor;

        impl<'de> Visitor<'de> for Base64Visitor {
            type Value = Base64Bytes;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a base64 encoded string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                B64.decode(value)
                    .map(Base64Bytes)
                    .map_err(|err| E::custom(format!("invalid base64 payload: {err}")))
            }
        }

        deserializer.deserialize_str(Base64Visitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum ClientEnvelope {
    #[serde(rename = "auth")]
    Auth(AuthPayload),
    #[serde(rename = "pty.input")]
    PtyInput(PtyInputPayload),
    #[serde(rename = "pty.resize")]
    PtyResize(PtyResizePayload),
    #[serde(rename = "pty.signal")]
    PtySignal(PtySignalPayload),
    #[serde(rename = "command")]
    Command(CommandPayload),
}

impl ClientEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Auth(_) => "auth",
            ClientEnvelope::PtyInput(_) => "pty.input",
            ClientEnvelope::PtyResize(_) => "pty.resize",
            ClientEnvelope::PtySignal(_) => "pty.signal",
            ClientEnvelope::Command(_) => "command",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum ServerEnvelope {
    #[serde(rename = "auth.ok")]
    AuthOk,
    #[serde(rename = "auth.error")]
    AuthError(AuthErrorPayload),
    #[serde(rename = "command.accepted")]
    CommandAccepted(CommandAcceptedPayload),
    #[serde(rename = "command.failed")]
    CommandFailed(CommandFailedPayload),
    #[serde(rename = "command.completed")]
    CommandCompleted(CommandCompletedPayload),
    #[serde(rename = "pty.output")]
    PtyOutput(PtyOutputPayload),
    #[serde(rename = "pty.exit")]
    PtyExit(PtyExitPayload),
    #[serde(rename = "pty.event")]
    PtyEvent(PtyEventPayload),
    #[serde(rename = "stream.event")]
    StreamEvent(StreamEventPayload),
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::AuthOk => "auth.ok",
            ServerEnvelope::AuthError(_) => "auth.error",
            ServerEnvelope::CommandAccepted(_) => "command.accepted",
            ServerEnvelope::CommandFailed(_) => "command.failed",
            ServerEnvelope::CommandCompleted(_) => "command.completed",
            ServerEnvelope::PtyOutput(_) => "pty.output",
            ServerEnvelope::PtyExit(_) => "pty.exit",
            ServerEnvelope::PtyEvent(_) => "pty.event",
            ServerEnvelope::StreamEvent(_) => "stream.event",
        }
    }

    pub fn command_accepted(command_id: impl Into<String>) -> Self {
        ServerEnvelope::CommandAccepted(CommandAcceptedPayload {
            command_id: command_id.into(),
        })
    }

    pub fn command_failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        ServerEnvelope::CommandFailed(CommandFailedPayload {
            command_id: command_id.into(),
            error: error.into(),
        })
    }

    pub fn command_completed(command_id: impl Into<String>, result: Value) -> Self {
        ServerEnvelope::CommandCompleted(CommandCompletedPayload {
            command_id: command_id.into(),
            result,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyInputPayload {
    pub session_id: String,
    pub data_base64: Base64Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyResizePayload {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PtySignal {
    Interrupt,
    Eof,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtySignalPayload {
    pub session_id: String,
    pub signal: PtySignal,
}

/// The inner `command` stays raw here; it is validated separately by
/// [`crate::command::parse_command`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: String,
    pub command: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandAcceptedPayload {
    pub command_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedPayload {
    pub command_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandCompletedPayload {
    pub command_id: String,
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyOutputPayload {
    pub session_id: String,
    pub cursor: u64,
    pub chunk_base64: Base64Bytes,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PtyExitStatus {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl PtyExitStatus {
    /// An exit that should draw an operator's attention.
    pub fn is_failure(&self) -> bool {
        self.signal.is_some() || self.code.is_some_and(|code| code != 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyExitPayload {
    pub session_id: String,
    pub exit: PtyExitStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub record: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PtyEventPayload {
    pub session_id: String,
    pub event: EventRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEventPayload {
    pub subscription_id: String,
    pub cursor: u64,
    pub event: EventRecord,
}
