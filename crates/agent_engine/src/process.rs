use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    backend::{Backend, BackendError, Capabilities},
    engine::resolve_binary,
    error::EngineError,
    message::{Message, MessageType, ProcessMeta, StopReason},
    options::EngineOptions,
    reader::{BoundedLine, BoundedLineReader},
    session::Session,
    stop_reason::carry_stop_reason,
};

/// Handle over a live agent subprocess: its message stream, its send path,
/// and its lifecycle controls. Cloning shares the underlying session.
#[derive(Clone)]
pub struct Process {
    shared: Arc<Shared>,
}

/// Receiving half of a turn's output stream.
///
/// Spawn-per-turn backends get a fresh channel per turn; a handle obtained
/// before the turn boundary keeps reading the old, closed channel. Re-call
/// [`Process::output`] after each `send` that starts a new turn.
#[derive(Clone)]
pub struct OutputChannel {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
}

impl OutputChannel {
    /// Next message, or `None` once the turn's channel is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }
}

struct Shared {
    backend: Arc<dyn Backend>,
    capabilities: Capabilities,
    session: Session,
    /// Parent-plus-overrides env vector captured at start; `None` inherits.
    /// Reused verbatim for every per-turn respawn.
    env: Option<Vec<(String, String)>>,
    options: EngineOptions,
    stopping: AtomicBool,
    state: Mutex<State>,
    cmd_done_tx: mpsc::Sender<()>,
    cmd_done_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

struct State {
    pid: Option<u32>,
    binary: PathBuf,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    reader_cancel: CancellationToken,
    /// Send half kept for respawned readers; dropped by `finish` so the
    /// channel closes once the reader's own clone is gone.
    output_tx: Option<mpsc::Sender<Message>>,
    output_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    done: CancellationToken,
    finished: bool,
    term_err: Option<EngineError>,
    /// A deliberate subprocess swap is in flight; the exiting reader must
    /// not treat its child's death as the end of the session.
    replacing: bool,
}

impl Shared {
    /// Publishes the terminal error and closes the output channel. At most
    /// once per turn; spawn-per-turn resumption re-arms the cell.
    fn finish(&self, terminal: Option<EngineError>) {
        let done = {
            let mut state = lock_state(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            state.term_err = terminal;
            state.output_tx = None;
            state.pid = None;
            state.done.clone()
        };
        done.cancel();
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").finish_non_exhaustive()
    }
}

impl Process {
    pub(crate) fn launch(
        backend: Arc<dyn Backend>,
        capabilities: Capabilities,
        session: Session,
        env: Option<Vec<(String, String)>>,
        options: EngineOptions,
        spawned: SpawnedChild,
        binary: PathBuf,
    ) -> Self {
        let (output_tx, output_rx) = mpsc::channel(options.channel_capacity);
        let (cmd_done_tx, cmd_done_rx) = mpsc::channel(1);
        let reader_cancel = CancellationToken::new();
        let SpawnedChild {
            child,
            stdout,
            stdin,
            pid,
        } = spawned;

        let shared = Arc::new(Shared {
            backend,
            capabilities,
            session,
            env,
            options,
            stopping: AtomicBool::new(false),
            state: Mutex::new(State {
                pid,
                binary: binary.clone(),
                stdin: stdin.map(|pipe| Arc::new(tokio::sync::Mutex::new(pipe))),
                reader_cancel: reader_cancel.clone(),
                output_tx: Some(output_tx.clone()),
                output_rx: Arc::new(tokio::sync::Mutex::new(output_rx)),
                done: CancellationToken::new(),
                finished: false,
                term_err: None,
                replacing: false,
            }),
            cmd_done_tx,
            cmd_done_rx: tokio::sync::Mutex::new(cmd_done_rx),
        });

        tokio::spawn(run_reader(
            Arc::clone(&shared),
            child,
            stdout,
            output_tx,
            reader_cancel,
            pid,
            binary,
        ));

        Self { shared }
    }

    /// The current turn's output stream.
    pub fn output(&self) -> OutputChannel {
        let rx = Arc::clone(&self.state().output_rx);
        OutputChannel { rx }
    }

    /// Non-blocking snapshot of the terminal error: `None` while the session
    /// is still running, and `None` after a clean natural exit.
    pub fn err(&self) -> Option<EngineError> {
        let state = self.state();
        if state.done.is_cancelled() {
            state.term_err.clone()
        } else {
            None
        }
    }

    /// Blocks until the session ends, naturally or via [`stop`](Self::stop).
    pub async fn wait(&self) -> Result<(), EngineError> {
        let done = self.state().done.clone();
        done.cancelled().await;
        match self.state().term_err.clone() {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Delivers a user message: over stdin for streaming backends, by
    /// replacing or resuming the subprocess for spawn-per-turn backends.
    pub async fn send(&self, message: Message) -> Result<(), EngineError> {
        self.send_with_cancel(message, &CancellationToken::new())
            .await
    }

    /// [`send`](Self::send) with a caller-held token bounding pre-spawn
    /// waits on the replacement and resumption paths.
    pub async fn send_with_cancel(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }

        // done and term_err are snapshotted under one lock acquisition:
        // finish publishes term_err before the latch fires, so a fired latch
        // always comes with its error.
        let (done_fired, term_err, stdin) = {
            let state = self.state();
            (
                state.done.is_cancelled(),
                state.term_err.clone(),
                state.stdin.clone(),
            )
        };

        if done_fired {
            if term_err.is_some() {
                return Err(EngineError::Terminated);
            }
            if self.shared.capabilities.resumer {
                return self.resume_after_clean_exit(&message, cancel).await;
            }
        }
        if let Some(stdin) = stdin {
            return self.send_stdin(stdin, &message).await;
        }
        if self.shared.capabilities.resumer {
            return self.replace_subprocess(&message, cancel).await;
        }
        Err(EngineError::SendNotSupported {
            reason: "backend has no streaming or resume path",
        })
    }

    /// Requests termination with signal escalation and waits until the
    /// reader has finished and the output channel is closed. Idempotent:
    /// every call returns the session's terminal error — `Terminated` on an
    /// ordinary stop, `Ok` only when the session had already ended cleanly.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.stop_with_cancel(&CancellationToken::new()).await
    }

    /// [`stop`](Self::stop) with a caller-held token: if it fires while the
    /// grace period is still running, the child is hard-killed immediately
    /// and the cancellation is reported.
    pub async fn stop_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let first = !self.shared.stopping.swap(true, Ordering::SeqCst);
        let mut cancelled = false;

        if first {
            let (stdin, reader_cancel, pid) = {
                let mut state = self.state();
                (
                    state.stdin.take(),
                    state.reader_cancel.clone(),
                    state.pid,
                )
            };
            drop(stdin);
            reader_cancel.cancel();
            sig::graceful(pid);
            debug!(?pid, "requested graceful termination");

            tokio::select! {
                _ = self.recv_cmd_done() => {}
                _ = tokio::time::sleep(self.shared.options.grace_period) => {
                    debug!(?pid, grace = ?self.shared.options.grace_period, "grace period elapsed, killing");
                    sig::hard(pid);
                    self.recv_cmd_done().await;
                }
                _ = cancel.cancelled() => {
                    sig::hard(pid);
                    self.recv_cmd_done().await;
                    cancelled = true;
                }
            }
        }

        // Stop's return strictly follows channel closure and term_err
        // publication, for the second caller as much as the first.
        let done = self.state().done.clone();
        done.cancelled().await;

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        match self.state().term_err.clone() {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        lock_state(&self.shared.state)
    }

    async fn recv_cmd_done(&self) {
        let mut rx = self.shared.cmd_done_rx.lock().await;
        // The sender lives in Shared, so this only resolves on a post.
        let _ = rx.recv().await;
    }

    async fn send_stdin(
        &self,
        stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
        message: &Message,
    ) -> Result<(), EngineError> {
        let formatter = self.shared.backend.as_input_formatter().ok_or(
            EngineError::SendNotSupported {
                reason: "stdin pipe without input formatter",
            },
        )?;
        let bytes = formatter.format_input(message)?;

        let mut pipe = stdin.lock().await;
        let written = async {
            pipe.write_all(&bytes).await?;
            pipe.flush().await
        }
        .await;
        match written {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::BrokenPipe => {
                Err(EngineError::Terminated)
            }
            Err(error) => Err(EngineError::StdinWrite { source: error }),
        }
    }

    /// Swaps the subprocess mid-turn: tears the running child down, then
    /// spawns the resume argv. The turn's output channel stays in place.
    async fn replace_subprocess(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let resumer = self
            .shared
            .backend
            .as_resumer()
            .ok_or(EngineError::SendNotSupported {
                reason: "backend has no streaming or resume path",
            })?;
        let spec = resumer
            .resume_args(&self.shared.session, message)
            .map_err(map_backend_error)?;
        let binary = resolve_binary(&spec.program)?;

        let (reader_cancel, stdin, pid) = {
            let mut state = self.state();
            state.replacing = true;
            (state.reader_cancel.clone(), state.stdin.take(), state.pid)
        };
        drop(stdin);
        reader_cancel.cancel();
        sig::graceful(pid);
        debug!(?pid, next = %spec.program, "replacing subprocess");

        tokio::select! {
            _ = self.recv_cmd_done() => {}
            _ = cancel.cancelled() => {
                sig::hard(pid);
                self.recv_cmd_done().await;
                let error = EngineError::Cancelled;
                self.fail_replacement(error.clone());
                return Err(error);
            }
        }

        // The reader may have finished before it observed the swap marker.
        // A failed turn means the session is over; a clean one turns this
        // swap into an ordinary turn boundary with a fresh channel.
        {
            let mut state = self.state();
            if state.finished {
                state.replacing = false;
                if state.term_err.is_some() {
                    drop(state);
                    let _ = self.shared.cmd_done_tx.try_send(());
                    return Err(EngineError::Terminated);
                }
                let (output_tx, output_rx) =
                    mpsc::channel(self.shared.options.channel_capacity);
                state.output_tx = Some(output_tx);
                state.output_rx = Arc::new(tokio::sync::Mutex::new(output_rx));
                state.done = CancellationToken::new();
                state.finished = false;
                state.term_err = None;
            }
        }

        match spawn_subprocess(
            &binary,
            &spec.args,
            &self.shared.session.cwd,
            self.shared.env.as_deref(),
            false,
        ) {
            Ok(spawned) => {
                self.install_subprocess(spawned, binary);
                Ok(())
            }
            Err(error) => {
                self.fail_replacement(error.clone());
                Err(error)
            }
        }
    }

    /// The old subprocess is gone and its successor never arrived: the
    /// session is over. Clears the swap marker, publishes the error, and
    /// re-arms the child-done slot so `stop` cannot block on it.
    fn fail_replacement(&self, error: EngineError) {
        self.state().replacing = false;
        self.shared.finish(Some(error));
        let _ = self.shared.cmd_done_tx.try_send(());
    }

    /// Starts the next turn for a spawn-per-turn backend whose previous
    /// subprocess already exited cleanly. Re-arms the output channel, the
    /// done latch, and the finish cell before installing the new child.
    async fn resume_after_clean_exit(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if self.shared.stopping.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let resumer = self
            .shared
            .backend
            .as_resumer()
            .ok_or(EngineError::SendNotSupported {
                reason: "backend has no streaming or resume path",
            })?;
        let spec = resumer
            .resume_args(&self.shared.session, message)
            .map_err(map_backend_error)?;
        let binary = resolve_binary(&spec.program)?;

        let with_stdin = self.shared.capabilities.streaming();
        let mut spawned = spawn_subprocess(
            &binary,
            &spec.args,
            &self.shared.session.cwd,
            self.shared.env.as_deref(),
            with_stdin,
        )?;

        // Previous turn's reader left a token in the slot; a stale token
        // would make the next stop return before the new child is down.
        {
            let mut slot = self.shared.cmd_done_rx.lock().await;
            let _ = slot.try_recv();
        }

        {
            let mut state = self.state();
            if self.shared.stopping.load(Ordering::SeqCst) {
                drop(state);
                let _ = spawned.child.start_kill();
                let _ = spawned.child.wait().await;
                // We drained the slot above; give it back so the stop that
                // beat us does not wait on a child that no longer exists.
                let _ = self.shared.cmd_done_tx.try_send(());
                return Err(EngineError::Terminated);
            }
            let (output_tx, output_rx) =
                mpsc::channel(self.shared.options.channel_capacity);
            state.output_tx = Some(output_tx);
            state.output_rx = Arc::new(tokio::sync::Mutex::new(output_rx));
            state.done = CancellationToken::new();
            state.finished = false;
            state.term_err = None;
        }

        self.install_subprocess(spawned, binary);
        Ok(())
    }

    /// Publishes a freshly spawned child and binds a reader task to it.
    fn install_subprocess(&self, spawned: SpawnedChild, binary: PathBuf) {
        let SpawnedChild {
            child,
            stdout,
            stdin,
            pid,
        } = spawned;
        let reader_cancel = CancellationToken::new();

        let output_tx = {
            let mut state = self.state();
            state.pid = pid;
            state.binary = binary.clone();
            state.stdin = stdin.map(|pipe| Arc::new(tokio::sync::Mutex::new(pipe)));
            state.reader_cancel = reader_cancel.clone();
            state.replacing = false;
            state.output_tx.clone()
        };
        let Some(output_tx) = output_tx else {
            // The session finished while the swap was in flight; dropping
            // the child kills it (kill_on_drop). No reader will post for
            // this child, so keep the done slot armed.
            let _ = self.shared.cmd_done_tx.try_send(());
            return;
        };

        // A stop that raced the install tears the fresh child right back
        // down; its reader then finalizes with the forced Terminated.
        if self.shared.stopping.load(Ordering::SeqCst) {
            reader_cancel.cancel();
            sig::hard(pid);
        }

        tokio::spawn(run_reader(
            Arc::clone(&self.shared),
            child,
            stdout,
            output_tx,
            reader_cancel,
            pid,
            binary,
        ));
    }
}

/// The single stdout pump. Owns the child and is the only sender into the
/// turn's output channel for this subprocess's lifetime.
async fn run_reader(
    shared: Arc<Shared>,
    mut child: Child,
    stdout: ChildStdout,
    output_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    pid: Option<u32>,
    binary: PathBuf,
) {
    let mut lines = BoundedLineReader::new(stdout, shared.options.max_line_bytes);
    let mut carried: Option<StopReason> = None;
    let mut fatal: Option<EngineError> = None;

    'pump: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break 'pump,
            line = lines.next_line() => line,
        };
        let Some(line) = next else { break };

        let text = match line {
            BoundedLine::Io { error } => {
                debug!(error = %error, "stdout read failed");
                break;
            }
            BoundedLine::TooLong {
                observed_bytes,
                max_line_bytes,
            } => {
                let error = EngineError::ScannerOverflow {
                    observed_bytes,
                    max_line_bytes,
                };
                let mut message = Message::error(error.to_string());
                message.timestamp = Some(SystemTime::now());
                // Best-effort breadcrumb; dropped if the channel is full.
                // The terminal error still reports the overflow.
                let _ = output_tx.try_send(message);
                fatal = Some(error);
                let _ = child.start_kill();
                break;
            }
            BoundedLine::Line { bytes } => String::from_utf8_lossy(&bytes).into_owned(),
        };

        let parsed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            shared.backend.parse_line(&text)
        }));
        let mut message = match parsed {
            Err(panic) => {
                fatal = Some(EngineError::ParserPanic {
                    detail: panic_message(panic),
                });
                let _ = child.start_kill();
                break;
            }
            Ok(Ok(None)) => continue,
            Ok(Ok(Some(message))) => message,
            Ok(Err(parse_error)) => {
                warn!(error = %parse_error, "backend failed to parse line");
                Message::error(format!("parse error: {parse_error}"))
            }
        };

        if message.timestamp.is_none() {
            message.timestamp = Some(SystemTime::now());
        }
        carried = carry_stop_reason(&mut message, carried);
        if message.message_type == MessageType::INIT {
            if let Some(pid) = pid {
                message.process = Some(ProcessMeta {
                    pid,
                    binary: binary.clone(),
                });
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break 'pump,
            sent = output_tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    // Without pid-addressed signals the cancellation itself must kill the
    // child, or the reap below would hang.
    #[cfg(not(unix))]
    if cancel.is_cancelled() {
        let _ = child.start_kill();
    }

    let mut terminal = normalize_exit(child.wait().await);
    if let Some(error) = fatal {
        terminal = Some(error);
    }
    if shared.stopping.load(Ordering::SeqCst) {
        // User-initiated stops outrank whatever the child actually did.
        terminal = Some(EngineError::Terminated);
    }
    debug!(?pid, terminal = ?terminal, "subprocess reaped");

    drop(output_tx);
    let replacing = {
        let mut state = lock_state(&shared.state);
        state.pid = None;
        state.replacing
    };
    if !replacing {
        shared.finish(terminal);
    }
    let _ = shared.cmd_done_tx.try_send(());
}

// A panicking holder can only have been one of our own short critical
// sections; the state stays usable.
fn lock_state(state: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize_exit(result: io::Result<std::process::ExitStatus>) -> Option<EngineError> {
    match result {
        Ok(status) if status.success() => None,
        Ok(status) => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt as _;
                if let Some(signal) = status.signal() {
                    return Some(EngineError::Exit {
                        code: -signal,
                        detail: status.to_string(),
                    });
                }
            }
            Some(EngineError::Exit {
                code: status.code().unwrap_or(-1),
                detail: status.to_string(),
            })
        }
        Err(error) => {
            #[cfg(unix)]
            if error.raw_os_error() == Some(nix::libc::ECHILD) {
                // Already reaped elsewhere; nothing abnormal to report.
                return None;
            }
            Some(EngineError::Exit {
                code: -1,
                detail: format!("wait failed: {error}"),
            })
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn map_backend_error(error: BackendError) -> EngineError {
    match error {
        BackendError::MissingResumeId { .. } => EngineError::SessionNotFound,
        other => EngineError::Backend(other),
    }
}

pub(crate) struct SpawnedChild {
    pub(crate) child: Child,
    pub(crate) stdout: ChildStdout,
    pub(crate) stdin: Option<ChildStdin>,
    pub(crate) pid: Option<u32>,
}

pub(crate) fn spawn_subprocess(
    binary: &Path,
    args: &[String],
    cwd: &Path,
    env: Option<&[(String, String)]>,
    with_stdin: bool,
) -> Result<SpawnedChild, EngineError> {
    let mut command = Command::new(binary);
    command
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    if let Some(env) = env {
        // The merged vector may carry duplicate keys; applying in order
        // makes the last occurrence win.
        command.env_clear();
        for (key, value) in env {
            command.env(key, value);
        }
    }

    let mut child = spawn_with_retry(&mut command, binary)?;
    let stdout = child.stdout.take().ok_or_else(|| EngineError::Spawn {
        binary: binary.to_path_buf(),
        source: io::Error::other("stdout pipe unavailable"),
    })?;
    let stdin = if with_stdin { child.stdin.take() } else { None };
    let pid = child.id();
    debug!(binary = %binary.display(), ?pid, "spawned agent subprocess");

    Ok(SpawnedChild {
        child,
        stdout,
        stdin,
        pid,
    })
}

fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, EngineError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                let is_busy = matches!(source.kind(), io::ErrorKind::ExecutableFileBusy)
                    || source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(EngineError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

#[cfg(unix)]
mod sig {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    pub(super) fn graceful(pid: Option<u32>) {
        send(pid, Signal::SIGTERM);
    }

    pub(super) fn hard(pid: Option<u32>) {
        send(pid, Signal::SIGKILL);
    }

    fn send(pid: Option<u32>, signal: Signal) {
        let Some(pid) = pid else { return };
        let Ok(pid) = i32::try_from(pid) else { return };
        // ESRCH just means the child is already gone.
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

#[cfg(not(unix))]
mod sig {
    pub(super) fn graceful(_pid: Option<u32>) {}

    pub(super) fn hard(_pid: Option<u32>) {}
}
