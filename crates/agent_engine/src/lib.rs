#![forbid(unsafe_code)]
//! Backend-agnostic supervision of interactive agent CLIs as subprocesses.
//!
//! A [`Backend`] teaches the engine one concrete CLI: how to build its argv
//! and how to turn its stdout lines into [`Message`]s. The [`Engine`] spawns
//! and lifecycle-manages the child, pumps stdout through the parser into a
//! bounded channel, routes user turns back over stdin or by replacing the
//! subprocess, and guarantees termination with signal escalation.
//!
//! ```rust,no_run
//! use agent_engine::{Engine, Session};
//! # use agent_engine::{Backend, BackendError, Message, ParseError, Resumer, Session as S, SpawnSpec};
//! # struct Echo;
//! # impl Backend for Echo {
//! #     fn spawn_args(&self, s: &S) -> SpawnSpec { SpawnSpec::new("echo", [s.prompt.clone()]) }
//! #     fn parse_line(&self, l: &str) -> Result<Option<Message>, ParseError> { Ok(Some(Message::text(l))) }
//! #     fn as_resumer(&self) -> Option<&dyn Resumer> { Some(self) }
//! # }
//! # impl Resumer for Echo {
//! #     fn resume_args(&self, _: &S, m: &Message) -> Result<SpawnSpec, BackendError> {
//! #         Ok(SpawnSpec::new("echo", [m.content.clone()]))
//! #     }
//! # }
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(Echo);
//! let process = engine.start(Session::new("demo", "/tmp").prompt("hello")).await?;
//! let output = process.output();
//! while let Some(message) = output.recv().await {
//!     println!("{}: {}", message.message_type, message.content);
//! }
//! process.wait().await?;
//! # Ok(()) }
//! ```

mod backend;
mod engine;
mod env;
mod error;
mod message;
mod options;
mod process;
mod reader;
mod session;
mod stop_reason;

pub use backend::{
    Backend, BackendError, Capabilities, InputFormatter, ParseError, Resumer, SpawnSpec, Streamer,
};
pub use engine::{Engine, StartOptions};
pub use error::EngineError;
pub use message::{
    InitMeta, Message, MessageType, ProcessMeta, StopReason, ToolCall, Usage,
};
pub use options::{
    EngineOptions, DEFAULT_CHANNEL_CAPACITY, DEFAULT_GRACE_PERIOD, DEFAULT_MAX_LINE_BYTES,
    MIN_MAX_LINE_BYTES,
};
pub use process::{OutputChannel, Process};
pub use session::{option_keys, Session, EFFORT_LEVELS};
