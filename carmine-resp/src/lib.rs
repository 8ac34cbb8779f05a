//! RESP wire protocol support.
//!
//! Everything that touches bytes on a socket lives here: the reply model
//! with its RESP encoding, the streaming request/reply parser, and the
//! per-connection session state the command layer mutates. The engine
//! trait is defined alongside so both the standalone database and the
//! cluster coordinator can sit behind one dispatch surface.

pub mod engine;
pub mod parse;
pub mod reply;
pub mod session;

pub use engine::Engine;
pub use parse::{Payload, RespParser};
pub use reply::{CmdLine, Reply};
pub use session::Session;

/// Builds an argv vector from string parts.
#[must_use]
pub fn cmd_line(parts: &[&str]) -> CmdLine {
    parts.iter().map(|part| part.as_bytes().to_vec()).collect()
}
