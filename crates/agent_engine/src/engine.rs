use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    backend::{Backend, Capabilities},
    env::{merge_env, validate_env},
    error::EngineError,
    message::Message,
    options::EngineOptions,
    process::{spawn_subprocess, Process},
    session::{option_keys, Session, EFFORT_LEVELS},
};

/// Per-start overrides applied to the session before anything else runs.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    prompt: Option<String>,
    model: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Validates a backend and starts supervised agent subprocesses for it.
///
/// The engine never reaches into the backend beyond the [`Backend`] surface:
/// it asks for argv, pumps stdout through the backend's parser, and owns
/// everything else (spawning, signals, channels, termination).
pub struct Engine {
    backend: Arc<dyn Backend>,
    options: EngineOptions,
}

impl Engine {
    pub fn new(backend: impl Backend) -> Self {
        Self::with_options(backend, EngineOptions::default())
    }

    pub fn with_options(backend: impl Backend, options: EngineOptions) -> Self {
        Self {
            backend: Arc::new(backend),
            options,
        }
    }

    /// Checks that the backend is usable at all: its spawn builder survives
    /// an empty session and names a binary resolvable on PATH.
    pub fn validate(&self) -> Result<(), EngineError> {
        let probe = Session::default();
        let spec = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.backend.spawn_args(&probe)
        }))
        .map_err(|_| EngineError::unavailable("spawn argv builder panicked"))?;
        resolve_binary(&spec.program)?;
        Ok(())
    }

    /// Starts a session and returns its [`Process`] handle.
    pub async fn start(&self, session: Session) -> Result<Process, EngineError> {
        self.start_with(session, StartOptions::default()).await
    }

    /// [`start`](Self::start) with per-call overrides.
    pub async fn start_with(
        &self,
        mut session: Session,
        overrides: StartOptions,
    ) -> Result<Process, EngineError> {
        if let Some(prompt) = overrides.prompt {
            session.prompt = prompt;
        }
        if let Some(model) = overrides.model {
            session.model = model;
        }

        if !session.cwd.is_absolute() {
            return Err(EngineError::WorkingDirectory {
                path: session.cwd.clone(),
                reason: "path is not absolute".to_string(),
            });
        }
        if !session.cwd.is_dir() {
            return Err(EngineError::WorkingDirectory {
                path: session.cwd.clone(),
                reason: "not an existing directory".to_string(),
            });
        }
        validate_options(&session.options)?;

        let capabilities = Capabilities::resolve(self.backend.as_ref());
        if !capabilities.can_send() {
            let reason = if capabilities.streamer && !capabilities.formatter {
                "streamer without input formatter"
            } else {
                "no streaming or resume path"
            };
            return Err(EngineError::SendNotSupported { reason });
        }

        let streaming = capabilities.streaming();
        let spec = if streaming {
            match self.backend.as_streamer() {
                Some(streamer) => streamer.stream_args(&session),
                None => self.backend.spawn_args(&session),
            }
        } else {
            self.backend.spawn_args(&session)
        };
        let binary = resolve_binary(&spec.program)?;

        validate_env(&session.env)?;
        let parent: Vec<(String, String)> = std::env::vars().collect();
        let env = merge_env(&parent, &session.env);

        // A formatter rejection should not cost us a subprocess; encode the
        // first turn before spawning.
        let initial_input = if streaming && !session.prompt.is_empty() {
            let formatter =
                self.backend
                    .as_input_formatter()
                    .ok_or(EngineError::SendNotSupported {
                        reason: "streamer without input formatter",
                    })?;
            Some(formatter.format_input(&Message::text(session.prompt.clone()))?)
        } else {
            None
        };

        let mut spawned = spawn_subprocess(
            &binary,
            &spec.args,
            &session.cwd,
            env.as_deref(),
            streaming,
        )?;
        debug!(
            session = %session.id,
            binary = %binary.display(),
            streaming,
            "started agent session"
        );

        if let Some(bytes) = initial_input {
            if let Some(stdin) = spawned.stdin.as_mut() {
                stdin
                    .write_all(&bytes)
                    .await
                    .map_err(|source| EngineError::StdinWrite { source })?;
                stdin
                    .flush()
                    .await
                    .map_err(|source| EngineError::StdinWrite { source })?;
            }
        }

        Ok(Process::launch(
            Arc::clone(&self.backend),
            capabilities,
            session,
            env,
            self.options.clone(),
            spawned,
            binary,
        ))
    }
}

/// PATH resolution for a backend-named binary.
pub(crate) fn resolve_binary(program: &str) -> Result<PathBuf, EngineError> {
    which::which(program).map_err(|error| {
        EngineError::unavailable(format!("`{program}` not found on PATH: {error}"))
    })
}

fn validate_options(options: &BTreeMap<String, String>) -> Result<(), EngineError> {
    if let Some(effort) = options.get(option_keys::EFFORT) {
        if !EFFORT_LEVELS.contains(&effort.as_str()) {
            return Err(EngineError::InvalidOption {
                key: option_keys::EFFORT.to_string(),
                reason: format!("`{effort}` is not one of {EFFORT_LEVELS:?}"),
            });
        }
    }
    Ok(())
}
