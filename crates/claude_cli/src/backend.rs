use agent_engine::{
    option_keys, Backend, BackendError, InputFormatter, Message, ParseError, Resumer, Session,
    SpawnSpec, Streamer,
};
use serde_json::json;
use tracing::debug;

use crate::stream_json::parse_stream_json_line;

const DEFAULT_BINARY: &str = "claude";

/// Backend for the Claude Code CLI's headless `--print` surface.
///
/// Output is always `stream-json`; resumes use `--resume` with the session's
/// recorded `resume_id`; streaming turns add `--input-format stream-json` and
/// deliver user messages as newline-terminated JSON frames on stdin.
#[derive(Clone, Debug)]
pub struct ClaudeCliBackend {
    binary: String,
}

impl Default for ClaudeCliBackend {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
        }
    }
}

impl ClaudeCliBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pinned binary instead of whatever `claude` resolves to on PATH.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Flags shared by every invocation shape.
    fn base_args(&self, session: &Session) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if !session.model.is_empty() {
            args.push("--model".to_string());
            args.push(session.model.clone());
        }

        if let Some(prompt) = session.options.get(option_keys::SYSTEM_PROMPT) {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(turns) = session.options.get(option_keys::MAX_TURNS) {
            // The CLI wants a number; anything else is silently skipped.
            if turns.parse::<u32>().is_ok() {
                args.push("--max-turns".to_string());
                args.push(turns.clone());
            } else {
                debug!(value = %turns, "skipping non-numeric max_turns option");
            }
        }
        if let Some(mode) = session.options.get(option_keys::MODE) {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        if let Some(dirs) = session.options.get(option_keys::ADD_DIRS) {
            for dir in dirs.split(',').filter(|dir| !dir.is_empty()) {
                args.push("--add-dir".to_string());
                args.push(dir.to_string());
            }
        }

        args
    }
}

impl Backend for ClaudeCliBackend {
    fn spawn_args(&self, session: &Session) -> SpawnSpec {
        let mut args = self.base_args(session);
        if !session.prompt.is_empty() {
            args.push(session.prompt.clone());
        }
        SpawnSpec {
            program: self.binary.clone(),
            args,
        }
    }

    fn parse_line(&self, line: &str) -> Result<Option<Message>, ParseError> {
        parse_stream_json_line(line)
    }

    fn as_resumer(&self) -> Option<&dyn Resumer> {
        Some(self)
    }

    fn as_streamer(&self) -> Option<&dyn Streamer> {
        Some(self)
    }

    fn as_input_formatter(&self) -> Option<&dyn InputFormatter> {
        Some(self)
    }
}

impl Resumer for ClaudeCliBackend {
    fn resume_args(&self, session: &Session, message: &Message) -> Result<SpawnSpec, BackendError> {
        let resume_id = session
            .options
            .get(option_keys::RESUME_ID)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BackendError::MissingResumeId {
                session: session.id.clone(),
            })?;

        let mut args = self.base_args(session);
        args.push("--resume".to_string());
        args.push(resume_id.clone());
        args.push(message.content.clone());
        Ok(SpawnSpec {
            program: self.binary.clone(),
            args,
        })
    }
}

impl Streamer for ClaudeCliBackend {
    fn stream_args(&self, session: &Session) -> SpawnSpec {
        let mut args = self.base_args(session);
        args.push("--input-format".to_string());
        args.push("stream-json".to_string());
        SpawnSpec {
            program: self.binary.clone(),
            args,
        }
    }
}

impl InputFormatter for ClaudeCliBackend {
    fn format_input(&self, message: &Message) -> Result<Vec<u8>, BackendError> {
        if message.content.contains('\0') {
            return Err(BackendError::InvalidInput {
                reason: "content contains NUL".to_string(),
            });
        }
        let frame = json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": message.content}],
            },
        });
        let mut bytes = serde_json::to_vec(&frame).map_err(|err| BackendError::InvalidInput {
            reason: err.to_string(),
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1", "/work").model("opus").prompt("do things")
    }

    #[test]
    fn spawn_args_end_with_the_prompt() {
        let spec = ClaudeCliBackend::new().spawn_args(&session());
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args.first().map(String::as_str), Some("--print"));
        assert!(spec.args.windows(2).any(|pair| pair
            == ["--output-format".to_string(), "stream-json".to_string()]));
        assert_eq!(spec.args.last().map(String::as_str), Some("do things"));
    }

    #[test]
    fn empty_prompt_omits_the_trailing_arg() {
        let spec = ClaudeCliBackend::new().spawn_args(&session().prompt(""));
        assert_ne!(spec.args.last().map(String::as_str), Some(""));
    }

    #[test]
    fn options_map_onto_cli_flags() {
        let session = session()
            .option(option_keys::SYSTEM_PROMPT, "be terse")
            .option(option_keys::MODE, "acceptEdits")
            .option(option_keys::ADD_DIRS, "/a,/b");
        let spec = ClaudeCliBackend::new().spawn_args(&session);
        let args = spec.args.join(" ");
        assert!(args.contains("--append-system-prompt be terse"));
        assert!(args.contains("--permission-mode acceptEdits"));
        assert!(args.contains("--add-dir /a"));
        assert!(args.contains("--add-dir /b"));
    }

    #[test]
    fn invalid_max_turns_is_skipped_silently() {
        let spec = ClaudeCliBackend::new()
            .spawn_args(&session().option(option_keys::MAX_TURNS, "lots"));
        assert!(!spec.args.iter().any(|arg| arg == "--max-turns"));

        let spec = ClaudeCliBackend::new()
            .spawn_args(&session().option(option_keys::MAX_TURNS, "4"));
        assert!(spec.args.iter().any(|arg| arg == "--max-turns"));
    }

    #[test]
    fn resume_args_require_a_resume_id() {
        let backend = ClaudeCliBackend::new();
        let next = Message::text("next turn");

        let err = backend.resume_args(&session(), &next).unwrap_err();
        assert!(matches!(err, BackendError::MissingResumeId { .. }));

        let spec = backend
            .resume_args(&session().option(option_keys::RESUME_ID, "abc"), &next)
            .unwrap();
        let args = spec.args.join(" ");
        assert!(args.contains("--resume abc"));
        assert_eq!(spec.args.last().map(String::as_str), Some("next turn"));
    }

    #[test]
    fn stream_args_omit_the_prompt_and_add_input_format() {
        let spec = ClaudeCliBackend::new().stream_args(&session());
        assert!(!spec.args.contains(&"do things".to_string()));
        let args = spec.args.join(" ");
        assert!(args.contains("--input-format stream-json"));
    }

    #[test]
    fn format_input_emits_one_json_frame_per_line() {
        let bytes = ClaudeCliBackend::new()
            .format_input(&Message::text("hello"))
            .unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        let frame: serde_json::Value =
            serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(frame["type"], "user");
        assert_eq!(frame["message"]["content"][0]["text"], "hello");
    }

    #[test]
    fn format_input_rejects_nul_bytes() {
        let err = ClaudeCliBackend::new()
            .format_input(&Message::text("a\0b"))
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput { .. }));
    }
}
