#![forbid(unsafe_code)]
//! Claude Code CLI backend for the [`agent_engine`] subprocess runtime.
//!
//! Drives the headless `claude --print` surface with `stream-json` output.
//! Every engine capability is covered: fresh spawns, spawn-per-turn resumes
//! (`--resume`), and persistent streaming turns over stdin
//! (`--input-format stream-json`).

mod backend;
mod stream_json;

pub use backend::ClaudeCliBackend;
pub use stream_json::parse_stream_json_line;
