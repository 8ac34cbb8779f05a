//! Per-connection session state.
//!
//! One `Session` lives for the lifetime of a client connection and is
//! threaded through every command dispatch: selected DB index, the stored
//! `AUTH` password, and the local-transaction state (`MULTI` queue, watch
//! snapshot, accumulated queueing errors).

use std::collections::HashMap;

use crate::reply::CmdLine;

/// Mutable state attached to one client connection.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Selected logical DB index; `SELECT` changes it, default 0.
    pub db_index: usize,
    /// Password stored by the last `AUTH` attempt.
    pub password: String,
    /// Remote peer address, for logs.
    pub remote_addr: String,
    /// Whether the connection is queueing commands inside `MULTI`.
    in_multi: bool,
    /// Commands queued since `MULTI`, in arrival order.
    queued: Vec<CmdLine>,
    /// Watched keys paired with the version observed at `WATCH` time.
    watching: HashMap<String, u32>,
    /// Queueing errors accumulated since `MULTI`; a non-empty list makes
    /// `EXEC` discard the transaction.
    tx_errors: Vec<String>,
}

impl Session {
    /// Creates a session for a freshly accepted connection.
    #[must_use]
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Self::default()
        }
    }

    /// Creates a detached session pinned to one DB index, used by replay
    /// paths (append-only load, TCC participants) that have no socket.
    #[must_use]
    pub fn detached(db_index: usize) -> Self {
        Self {
            db_index,
            ..Self::default()
        }
    }

    /// Returns whether the connection is in `MULTI` queueing state.
    #[must_use]
    pub fn in_multi(&self) -> bool {
        self.in_multi
    }

    /// Enters or leaves `MULTI` queueing state.
    pub fn set_multi(&mut self, on: bool) {
        self.in_multi = on;
    }

    /// Appends one command to the transaction queue.
    pub fn enqueue(&mut self, cmd: CmdLine) {
        self.queued.push(cmd);
    }

    /// Returns the queued commands in arrival order.
    #[must_use]
    pub fn queued(&self) -> &[CmdLine] {
        &self.queued
    }

    /// Records a queueing error; the transaction stays queued but dirty.
    pub fn add_tx_error(&mut self, message: impl Into<String>) {
        self.tx_errors.push(message.into());
    }

    /// Returns whether any queueing error was recorded since `MULTI`.
    #[must_use]
    pub fn has_tx_errors(&self) -> bool {
        !self.tx_errors.is_empty()
    }

    /// Records one watched key with its observed version.
    pub fn watch(&mut self, key: String, version: u32) {
        let _ = self.watching.entry(key).or_insert(version);
    }

    /// Returns the watch snapshot.
    #[must_use]
    pub fn watching(&self) -> &HashMap<String, u32> {
        &self.watching
    }

    /// Clears the watch snapshot.
    pub fn unwatch(&mut self) {
        self.watching.clear();
    }

    /// Leaves `MULTI` state and clears queue and error list, keeping the
    /// watch snapshot (cleared separately after `EXEC`/`UNWATCH`).
    pub fn reset_multi(&mut self) {
        self.in_multi = false;
        self.queued.clear();
        self.tx_errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::Session;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn watch_keeps_first_observed_version() {
        let mut session = Session::new("127.0.0.1:50000");
        session.watch("k".to_owned(), 3);
        session.watch("k".to_owned(), 9);
        assert_that!(session.watching().get("k"), some(eq(&3_u32)));
    }

    #[rstest]
    fn reset_multi_clears_queue_and_errors_but_not_watches() {
        let mut session = Session::default();
        session.set_multi(true);
        session.enqueue(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        session.add_tx_error("bad");
        session.watch("k".to_owned(), 1);

        session.reset_multi();
        assert_that!(session.in_multi(), eq(false));
        assert_that!(session.queued().len(), eq(0_usize));
        assert_that!(session.has_tx_errors(), eq(false));
        assert_that!(session.watching().len(), eq(1_usize));
    }

    #[rstest]
    fn unwatch_is_idempotent() {
        let mut session = Session::default();
        session.watch("a".to_owned(), 1);
        session.unwatch();
        session.unwatch();
        assert_that!(session.watching().len(), eq(0_usize));
    }
}
