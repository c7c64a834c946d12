use std::{collections::BTreeMap, path::PathBuf};

/// Well-known keys for [`Session::options`].
///
/// The mapping is opaque to the engine: values are routed to the backend,
/// which maps them onto CLI flags and silently skips what it cannot express.
/// Only [`EFFORT`](option_keys::EFFORT) is validated engine-side, against
/// [`EFFORT_LEVELS`].
pub mod option_keys {
    pub const SYSTEM_PROMPT: &str = "system_prompt";
    pub const MAX_TURNS: &str = "max_turns";
    pub const THINKING_BUDGET: &str = "thinking_budget";
    pub const MODE: &str = "mode";
    pub const HUMAN_IN_THE_LOOP: &str = "human_in_the_loop";
    pub const RESUME_ID: &str = "resume_id";
    pub const EFFORT: &str = "effort";
    pub const ADD_DIRS: &str = "add_dirs";
}

/// The closed allow-list for the `effort` option.
pub const EFFORT_LEVELS: &[&str] = &["minimal", "low", "medium", "high"];

/// Caller-owned description of one agent session.
///
/// The engine takes its own copy at start, so later caller mutations never
/// race the reader task.
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub id: String,
    /// Working directory for the subprocess. Must be an absolute path to an
    /// existing directory.
    pub cwd: PathBuf,
    pub model: String,
    /// Initial prompt. In streaming mode the engine delivers this over stdin;
    /// otherwise the backend bakes it into argv.
    pub prompt: String,
    pub options: BTreeMap<String, String>,
    /// Environment overrides merged over the parent environment, last-wins.
    pub env: BTreeMap<String, String>,
}

impl Session {
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_is_deep_for_options_and_env() {
        let original = Session::new("s1", "/tmp")
            .option(option_keys::MODE, "auto")
            .env("A", "1");

        let mut cloned = original.clone();
        cloned.options.insert("extra".to_string(), "x".to_string());
        cloned.env.insert("A".to_string(), "2".to_string());

        assert!(!original.options.contains_key("extra"));
        assert_eq!(original.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn builder_setters_compose() {
        let session = Session::new("s2", "/work")
            .model("opus")
            .prompt("hello")
            .option(option_keys::EFFORT, "high");
        assert_eq!(session.model, "opus");
        assert_eq!(session.prompt, "hello");
        assert_eq!(
            session.options.get(option_keys::EFFORT).map(String::as_str),
            Some("high")
        );
    }
}
