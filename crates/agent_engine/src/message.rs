use std::{borrow::Cow, fmt, path::PathBuf, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type discriminant.
///
/// This is an open set: backends may coin types the engine has never seen.
/// The well-known values are exposed as associated constants; any type whose
/// name ends in `_delta` is a streaming fragment by convention.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(Cow<'static, str>);

impl Default for MessageType {
    fn default() -> Self {
        Self(Cow::Borrowed(""))
    }
}

impl MessageType {
    pub const TEXT: MessageType = MessageType(Cow::Borrowed("text"));
    pub const TOOL_USE: MessageType = MessageType(Cow::Borrowed("tool_use"));
    pub const TOOL_RESULT: MessageType = MessageType(Cow::Borrowed("tool_result"));
    pub const ERROR: MessageType = MessageType(Cow::Borrowed("error"));
    pub const SYSTEM: MessageType = MessageType(Cow::Borrowed("system"));
    pub const INIT: MessageType = MessageType(Cow::Borrowed("init"));
    pub const RESULT: MessageType = MessageType(Cow::Borrowed("result"));
    pub const EOF: MessageType = MessageType(Cow::Borrowed("eof"));
    pub const THINKING: MessageType = MessageType(Cow::Borrowed("thinking"));
    pub const CONTEXT_WINDOW: MessageType = MessageType(Cow::Borrowed("context_window"));
    pub const TEXT_DELTA: MessageType = MessageType(Cow::Borrowed("text_delta"));
    pub const TOOL_USE_DELTA: MessageType = MessageType(Cow::Borrowed("tool_use_delta"));
    pub const THINKING_DELTA: MessageType = MessageType(Cow::Borrowed("thinking_delta"));

    pub fn new(raw: impl Into<String>) -> Self {
        Self(Cow::Owned(raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this type is a streaming fragment (`_delta` suffix convention).
    pub fn is_delta(&self) -> bool {
        self.0.ends_with("_delta")
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why the agent stopped producing output for a turn.
///
/// Open-string like [`MessageType`]; appears only on `result` messages by the
/// time consumers observe the stream.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopReason(Cow<'static, str>);

impl StopReason {
    pub const END_TURN: StopReason = StopReason(Cow::Borrowed("end_turn"));
    pub const MAX_TOKENS: StopReason = StopReason(Cow::Borrowed("max_tokens"));
    pub const TOOL_USE: StopReason = StopReason(Cow::Borrowed("tool_use"));

    pub fn new(raw: impl Into<String>) -> Self {
        Self(Cow::Owned(raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tool invocation reported by the agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Token accounting attached to result messages when the backend reports it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

/// Session-level metadata from the backend's init event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InitMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

/// Snapshot of the supervised subprocess, attached to init messages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessMeta {
    pub pid: u32,
    pub binary: PathBuf,
}

/// One record on a session's output stream.
///
/// Optional sub-structures are present only when at least one of their fields
/// is meaningful; a minimal backend produces plain `message_type` + `content`
/// and nothing else.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<SystemTime>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Self::default()
        }
    }

    /// A plain text message, the shape most user turns take.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::TEXT,
            content: content.into(),
            ..Self::default()
        }
    }

    /// An in-band error record. Does not by itself terminate the session.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::ERROR,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn is_delta(&self) -> bool {
        self.message_type.is_delta()
    }
}
