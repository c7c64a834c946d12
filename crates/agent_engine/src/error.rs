use std::{io, path::PathBuf};

use thiserror::Error;

pub use crate::backend::{BackendError, ParseError};

/// Errors produced by the engine and its processes.
///
/// The variant a terminal error lands on is stable for the lifetime of the
/// process handle: `err()`, `wait()` and `stop()` all observe the same value.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend's binary cannot be resolved, or the backend itself is
    /// unusable (its spawn builder panicked during validation).
    #[error("agent backend unavailable: {reason}")]
    Unavailable { reason: String },

    /// The session was ended by `stop`, or an operation arrived after the
    /// session had already terminated.
    #[error("session terminated")]
    Terminated,

    /// A resume was requested but the backend has no session to resume.
    #[error("session not found")]
    SessionNotFound,

    /// The backend exposes no way to deliver user messages.
    #[error("backend cannot send messages: {reason}")]
    SendNotSupported { reason: &'static str },

    /// The subprocess exited non-zero. Negative codes indicate termination
    /// by signal.
    #[error("agent exited with code {code}: {detail}")]
    Exit { code: i32, detail: String },

    /// One stdout line exceeded the configured scanner cap.
    #[error("scanner: line exceeded {max_line_bytes} byte cap (observed {observed_bytes})")]
    ScannerOverflow {
        observed_bytes: usize,
        max_line_bytes: usize,
    },

    /// The backend parser panicked; the subprocess was force-killed.
    #[error("parser panic: {detail}")]
    ParserPanic { detail: String },

    #[error("invalid working directory `{path}`: {reason}")]
    WorkingDirectory { path: PathBuf, reason: String },

    #[error("invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("invalid environment override: {reason}")]
    InvalidEnv { reason: String },

    /// A capability call (resume argv, input formatting) was rejected by the
    /// backend.
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("agent binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to agent stdin: {source}")]
    StdinWrite {
        #[source]
        source: io::Error,
    },

    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound)
    }

    pub fn is_send_not_supported(&self) -> bool {
        matches!(self, Self::SendNotSupported { .. })
    }

    /// Numeric exit code when the session ended with a subprocess failure.
    /// Negative values indicate death by signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

// The terminal error is observed repeatedly (err/wait/stop), so the enum must
// be clonable even though some variants carry io sources.
impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            Self::Unavailable { reason } => Self::Unavailable {
                reason: reason.clone(),
            },
            Self::Terminated => Self::Terminated,
            Self::SessionNotFound => Self::SessionNotFound,
            Self::SendNotSupported { reason } => Self::SendNotSupported { reason },
            Self::Exit { code, detail } => Self::Exit {
                code: *code,
                detail: detail.clone(),
            },
            Self::ScannerOverflow {
                observed_bytes,
                max_line_bytes,
            } => Self::ScannerOverflow {
                observed_bytes: *observed_bytes,
                max_line_bytes: *max_line_bytes,
            },
            Self::ParserPanic { detail } => Self::ParserPanic {
                detail: detail.clone(),
            },
            Self::WorkingDirectory { path, reason } => Self::WorkingDirectory {
                path: path.clone(),
                reason: reason.clone(),
            },
            Self::InvalidOption { key, reason } => Self::InvalidOption {
                key: key.clone(),
                reason: reason.clone(),
            },
            Self::InvalidEnv { reason } => Self::InvalidEnv {
                reason: reason.clone(),
            },
            Self::Backend(source) => Self::Backend(source.clone()),
            Self::Spawn { binary, source } => Self::Spawn {
                binary: binary.clone(),
                source: clone_io_error(source),
            },
            Self::StdinWrite { source } => Self::StdinWrite {
                source: clone_io_error(source),
            },
            Self::Cancelled => Self::Cancelled,
        }
    }
}

fn clone_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_testable() {
        assert!(EngineError::Terminated.is_terminated());
        assert!(EngineError::unavailable("no binary").is_unavailable());
        assert!(EngineError::SessionNotFound.is_session_not_found());
        assert!(EngineError::SendNotSupported { reason: "x" }.is_send_not_supported());
        assert!(!EngineError::Terminated.is_unavailable());
    }

    #[test]
    fn exit_code_accessor() {
        let err = EngineError::Exit {
            code: 3,
            detail: "exit status: 3".to_string(),
        };
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(EngineError::Terminated.exit_code(), None);
    }

    #[test]
    fn io_backed_variants_clone_by_kind_and_message() {
        let original = EngineError::StdinWrite {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone"),
        };
        let cloned = original.clone();
        match cloned {
            EngineError::StdinWrite { source } => {
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
                assert!(source.to_string().contains("pipe gone"));
            }
            other => panic!("unexpected clone: {other:?}"),
        }
    }

    #[test]
    fn scanner_overflow_mentions_scanner() {
        let err = EngineError::ScannerOverflow {
            observed_bytes: 8192,
            max_line_bytes: 4096,
        };
        assert!(err.to_string().contains("scanner"));
    }
}
