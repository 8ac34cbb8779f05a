//! Command execution surface shared by standalone and cluster engines.

use crate::reply::{CmdLine, Reply};
use crate::session::Session;

/// One dispatchable keyspace engine.
///
/// The RESP handler owns a single `Engine` trait object; whether commands
/// run against the local keyspace or get relayed across the cluster is
/// invisible at this boundary.
pub trait Engine: Send + Sync {
    /// Executes one argv for the given connection session.
    fn exec(&self, session: &mut Session, cmd: CmdLine) -> Reply;

    /// Releases connection-scoped state when a client disconnects.
    fn on_client_close(&self, session: &mut Session);

    /// Flushes and stops background work before process exit.
    fn close(&self);
}
