use thiserror::Error;

use crate::{Message, Session};

/// A resolved subprocess invocation: the binary name plus pre-split argv.
///
/// No shell is ever involved; args are passed to exec verbatim.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A single stdout line could not be translated into a [`Message`].
///
/// Parse errors are recovered per-line: the engine surfaces them as in-band
/// error messages and keeps reading.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by an optional backend capability.
#[derive(Clone, Debug, Error)]
pub enum BackendError {
    /// The session carries no resume identifier the backend could use.
    #[error("no resume id recorded for session `{session}`")]
    MissingResumeId { session: String },
    /// The input message cannot be encoded for the subprocess.
    #[error("input message rejected: {reason}")]
    InvalidInput { reason: String },
    #[error("{message}")]
    Other { message: String },
}

impl BackendError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

/// Spawn-per-turn capability: builds argv that resumes an existing session
/// with the next user message baked in as the first turn.
pub trait Resumer: Send + Sync {
    fn resume_args(&self, session: &Session, message: &Message) -> Result<SpawnSpec, BackendError>;
}

/// Streaming capability: builds argv for a long-lived subprocess that accepts
/// user turns over stdin. The argv must not carry a trailing prompt; the
/// engine delivers every prompt through the stdin pipe.
pub trait Streamer: Send + Sync {
    fn stream_args(&self, session: &Session) -> SpawnSpec;
}

/// Encodes a user message into the stdin framing the backend expects,
/// including any terminator. Must reject content containing NUL bytes.
pub trait InputFormatter: Send + Sync {
    fn format_input(&self, message: &Message) -> Result<Vec<u8>, BackendError>;
}

/// A backend teaches the engine one concrete agent CLI: how to build its argv
/// and how to read its stdout. The engine owns every other concern.
///
/// The two required methods are the Spawner and Parser roles; the optional
/// capabilities are discovered once at start through the `as_*` accessors
/// (the default implementations advertise nothing).
pub trait Backend: Send + Sync + 'static {
    /// Argv for a fresh session. Pure and infallible; option values the
    /// backend cannot express are skipped silently.
    fn spawn_args(&self, session: &Session) -> SpawnSpec;

    /// Translate one stdout line. `Ok(None)` means the line was consumed but
    /// produced no message. Must tolerate arbitrary input; the engine
    /// additionally guards the call with a panic firewall.
    fn parse_line(&self, line: &str) -> Result<Option<Message>, ParseError>;

    fn as_resumer(&self) -> Option<&dyn Resumer> {
        None
    }

    fn as_streamer(&self) -> Option<&dyn Streamer> {
        None
    }

    fn as_input_formatter(&self) -> Option<&dyn InputFormatter> {
        None
    }
}

/// Which optional capabilities a backend advertises, resolved once at start.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub resumer: bool,
    pub streamer: bool,
    pub formatter: bool,
}

impl Capabilities {
    pub fn resolve(backend: &dyn Backend) -> Self {
        Self {
            resumer: backend.as_resumer().is_some(),
            streamer: backend.as_streamer().is_some(),
            formatter: backend.as_input_formatter().is_some(),
        }
    }

    /// Streaming dispatch requires both the persistent argv builder and the
    /// stdin encoder.
    pub fn streaming(&self) -> bool {
        self.streamer && self.formatter
    }

    pub fn can_send(&self) -> bool {
        self.streaming() || self.resumer
    }
}
