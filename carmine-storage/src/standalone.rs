//! Multi-database standalone engine.
//!
//! Stacks the configured number of keyspaces behind AUTH, `SELECT`, and
//! flush routing, and owns the append-only writer. Cluster mode wraps
//! one of these per node.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use tracing::error;

use carmine_common::config::ServerConfig;
use carmine_common::error::CarmineResult;
use carmine_resp::{CmdLine, Engine, Reply, Session};

use crate::aof::Aof;
use crate::db::{AofHook, Db, DbConfig};

/// Standalone database engine: N keyspaces plus the append-only writer.
pub struct Standalone {
    dbs: Vec<Db>,
    require_pass: String,
    aof: Option<Arc<Aof>>,
}

impl Standalone {
    /// Builds the engine, replaying the append-only file when enabled.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Io` when the append-only file cannot be
    /// opened or the writer thread fails to start.
    pub fn new(config: &ServerConfig) -> CarmineResult<Self> {
        let db_config = DbConfig {
            buckets: config.buckets,
            list_page_size: config.list_max_shard_size.max(1),
            set_intset_cap: config.set_max_intset_entries.max(1),
        };
        let db_count = config.databases.max(1);
        let aof_cell: Arc<OnceLock<AofHook>> = Arc::new(OnceLock::new());
        let dbs = (0..db_count)
            .map(|index| Db::new(index, db_config, Arc::clone(&aof_cell)))
            .collect();

        let mut engine = Self {
            dbs,
            require_pass: config.require_pass.clone(),
            aof: None,
        };
        for db in &engine.dbs {
            db.start_expiry_sweeper(std::time::Duration::from_secs(config.cycle.max(1)));
        }

        if config.append_only {
            let aof = Arc::new(Aof::open(&config.append_filename)?);
            // Replay runs before the hook is armed, so replayed commands
            // do not echo back into the file.
            aof.load(&engine);
            let sink = Arc::clone(&aof);
            let _ = aof_cell.set(Box::new(move |db_index, line| sink.append(db_index, line)));
            engine.aof = Some(aof);
        }
        Ok(engine)
    }

    /// Returns the keyspace at `index`.
    #[must_use]
    pub fn db(&self, index: usize) -> Option<&Db> {
        self.dbs.get(index)
    }

    /// Returns the number of configured keyspaces.
    #[must_use]
    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    /// `AUTH` handler; stores the attempt on the session either way.
    pub fn auth(&self, session: &mut Session, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return Reply::arg_num_err("AUTH");
        }
        if self.require_pass.is_empty() {
            return Reply::err("Client sent AUTH, but no password is set");
        }
        session.password = String::from_utf8_lossy(&args[0]).into_owned();
        if session.password == self.require_pass {
            Reply::ok()
        } else {
            Reply::err("invalid password")
        }
    }

    /// Returns whether the session has passed authentication.
    #[must_use]
    pub fn is_authenticated(&self, session: &Session) -> bool {
        self.require_pass.is_empty() || session.password == self.require_pass
    }

    fn exec_unprotected(&self, session: &mut Session, cmd: CmdLine) -> Reply {
        let Some(first) = cmd.first() else {
            return Reply::unknown_err();
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();

        if name == "AUTH" {
            return self.auth(session, &cmd[1..]);
        }
        if !self.is_authenticated(session) {
            return Reply::Error("NOAUTH Authentication required".to_owned());
        }

        match name.as_str() {
            "SELECT" => return self.exec_select(session, &cmd[1..]),
            "FLUSHALL" => return self.flush_all(),
            "FLUSHDB" => {
                if session.in_multi() {
                    return Reply::err("command 'flushdb' cannot be used in MULTI");
                }
                if cmd.len() != 1 {
                    return Reply::arg_num_err("FLUSHDB");
                }
                return self.flush_db(session.db_index);
            }
            _ => {}
        }

        match self.dbs.get(session.db_index) {
            Some(db) => db.exec(session, cmd),
            None => Reply::err("DB index is out of range"),
        }
    }

    fn exec_select(&self, session: &mut Session, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return Reply::arg_num_err("SELECT");
        }
        let parsed = std::str::from_utf8(&args[0])
            .ok()
            .and_then(|text| text.parse::<usize>().ok());
        match parsed {
            Some(index) if index < self.dbs.len() => {
                session.db_index = index;
                Reply::ok()
            }
            _ => Reply::err("invalid DB index"),
        }
    }

    /// Clears one keyspace; versions reset with it.
    pub fn flush_db(&self, index: usize) -> Reply {
        let Some(db) = self.dbs.get(index) else {
            return Reply::err("DB index is out of range");
        };
        db.flush();
        db.append(vec![b"FLUSHDB".to_vec()]);
        Reply::ok()
    }

    fn flush_all(&self) -> Reply {
        for db in &self.dbs {
            db.flush();
        }
        if let Some(db) = self.dbs.first() {
            db.append(vec![b"FLUSHALL".to_vec()]);
        }
        Reply::ok()
    }
}

impl Engine for Standalone {
    fn exec(&self, session: &mut Session, cmd: CmdLine) -> Reply {
        match catch_unwind(AssertUnwindSafe(|| self.exec_unprotected(session, cmd))) {
            Ok(reply) => reply,
            Err(_) => {
                error!("command dispatch panicked");
                Reply::unknown_err()
            }
        }
    }

    fn on_client_close(&self, session: &mut Session) {
        session.unwatch();
        session.reset_multi();
    }

    fn close(&self) {
        if let Some(aof) = &self.aof {
            aof.close();
        }
    }
}
