//! Test backends built on small shell utilities.
#![allow(dead_code)]

use agent_engine::{
    Backend, BackendError, InputFormatter, Message, MessageType, ParseError, Resumer, Session,
    SpawnSpec, StopReason, Streamer,
};

/// Spawns a fixed argv and parses each stdout line as a text message.
///
/// Carries a trivial echo resumer so `Engine::start`'s send-capability check
/// passes; resumed turns just echo the message content.
pub struct LineBackend {
    pub program: String,
    pub args: Vec<String>,
    /// Lines equal to this are consumed without producing a message.
    pub skip: Option<String>,
    /// A line equal to this becomes an init message.
    pub init_token: Option<String>,
}

impl LineBackend {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            skip: None,
            init_token: None,
        }
    }

    pub fn skipping(mut self, line: &str) -> Self {
        self.skip = Some(line.to_string());
        self
    }

    pub fn init_on(mut self, line: &str) -> Self {
        self.init_token = Some(line.to_string());
        self
    }
}

impl Backend for LineBackend {
    fn spawn_args(&self, _session: &Session) -> SpawnSpec {
        SpawnSpec::new(self.program.clone(), self.args.clone())
    }

    fn parse_line(&self, line: &str) -> Result<Option<Message>, ParseError> {
        if self.skip.as_deref() == Some(line) {
            return Ok(None);
        }
        if self.init_token.as_deref() == Some(line) {
            return Ok(Some(Message::new(MessageType::INIT)));
        }
        Ok(Some(Message::text(line)))
    }

    fn as_resumer(&self) -> Option<&dyn Resumer> {
        Some(self)
    }
}

impl Resumer for LineBackend {
    fn resume_args(&self, _session: &Session, message: &Message) -> Result<SpawnSpec, BackendError> {
        Ok(SpawnSpec::new("echo", [message.content.clone()]))
    }
}

/// Streams turns through `cat`: whatever the formatter writes to stdin comes
/// back as stdout lines.
pub struct CatBackend;

impl Backend for CatBackend {
    fn spawn_args(&self, _session: &Session) -> SpawnSpec {
        SpawnSpec::new("cat", Vec::<String>::new())
    }

    fn parse_line(&self, line: &str) -> Result<Option<Message>, ParseError> {
        Ok(Some(Message::text(line)))
    }

    fn as_streamer(&self) -> Option<&dyn Streamer> {
        Some(self)
    }

    fn as_input_formatter(&self) -> Option<&dyn InputFormatter> {
        Some(self)
    }
}

impl Streamer for CatBackend {
    fn stream_args(&self, _session: &Session) -> SpawnSpec {
        SpawnSpec::new("cat", Vec::<String>::new())
    }
}

impl InputFormatter for CatBackend {
    fn format_input(&self, message: &Message) -> Result<Vec<u8>, BackendError> {
        if message.content.contains('\0') {
            return Err(BackendError::InvalidInput {
                reason: "NUL byte in content".to_string(),
            });
        }
        let mut bytes = message.content.clone().into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Parses `delta:<reason>` lines into stop-reason-bearing fragments and
/// `result` lines into result messages; everything else is text.
pub struct FragmentBackend {
    pub program: String,
    pub args: Vec<String>,
}

impl FragmentBackend {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Backend for FragmentBackend {
    fn spawn_args(&self, _session: &Session) -> SpawnSpec {
        SpawnSpec::new(self.program.clone(), self.args.clone())
    }

    fn parse_line(&self, line: &str) -> Result<Option<Message>, ParseError> {
        if let Some(reason) = line.strip_prefix("delta:") {
            let mut message = Message::new(MessageType::new("message_delta"));
            message.stop_reason = Some(StopReason::new(reason));
            return Ok(Some(message));
        }
        if let Some(reason) = line.strip_prefix("result:") {
            let mut message = Message::new(MessageType::RESULT);
            if !reason.is_empty() {
                message.stop_reason = Some(StopReason::new(reason));
            }
            return Ok(Some(message));
        }
        if line == "result" {
            return Ok(Some(Message::new(MessageType::RESULT)));
        }
        Ok(Some(Message::text(line)))
    }

    fn as_resumer(&self) -> Option<&dyn Resumer> {
        Some(self)
    }
}

impl Resumer for FragmentBackend {
    fn resume_args(&self, _session: &Session, message: &Message) -> Result<SpawnSpec, BackendError> {
        Ok(SpawnSpec::new("echo", [message.content.clone()]))
    }
}

/// Parser that always panics; for the firewall tests.
pub struct PanicBackend {
    pub program: String,
    pub args: Vec<String>,
}

impl PanicBackend {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Backend for PanicBackend {
    fn spawn_args(&self, _session: &Session) -> SpawnSpec {
        SpawnSpec::new(self.program.clone(), self.args.clone())
    }

    fn parse_line(&self, _line: &str) -> Result<Option<Message>, ParseError> {
        panic!("parser exploded");
    }

    fn as_resumer(&self) -> Option<&dyn Resumer> {
        Some(self)
    }
}

impl Resumer for PanicBackend {
    fn resume_args(&self, _session: &Session, message: &Message) -> Result<SpawnSpec, BackendError> {
        Ok(SpawnSpec::new("echo", [message.content.clone()]))
    }
}

/// A session rooted in a scratch directory. Returns the tempdir guard so the
/// directory outlives the test body.
pub fn scratch_session(id: &str) -> (Session, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let session = Session::new(id, dir.path());
    (session, dir)
}
