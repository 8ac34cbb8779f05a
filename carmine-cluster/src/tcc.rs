//! Try-commit-cancel distributed transactions.
//!
//! A participant receiving `PREPARE id <cmd> <args…>` builds a local
//! transaction: it acquires the command's key-footprint locks, captures
//! the undo log, and arms an auto-rollback wheel task at the maximum
//! lock time. `COMMIT id` executes the original argv under the still-held
//! locks; `ROLLBACK id` replays the undo log. Either outcome schedules a
//! delayed cleanup that drops the transaction from the table.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use hashbrown::HashMap;
use tracing::{info, warn};

use carmine_datastruct::timewheel;
use carmine_resp::{CmdLine, Reply, Session};
use carmine_storage::{Locks, Standalone, related_keys};

use crate::Cluster;

pub(crate) const MAX_LOCK_TIME: Duration = Duration::from_secs(3);
const CLEANUP_DELAY: Duration = Duration::from_secs(6);

/// Participant-side transaction table.
pub(crate) type TxTable = Arc<RwLock<HashMap<String, Arc<Transaction>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatus {
    Created,
    Prepared,
    Committed,
    RolledBack,
}

struct TxState {
    status: TxStatus,
    write_keys: Vec<String>,
    read_keys: Vec<String>,
    locks: Option<Locks>,
    undo_log: Vec<CmdLine>,
}

/// One participant-side transaction.
pub(crate) struct Transaction {
    id: String,
    cmd: CmdLine,
    db_index: usize,
    engine: Arc<Standalone>,
    state: Mutex<TxState>,
}

fn wheel_task_key(id: &str) -> String {
    format!("tx-{id}")
}

impl Transaction {
    pub(crate) fn new(
        id: String,
        cmd: CmdLine,
        db_index: usize,
        engine: Arc<Standalone>,
    ) -> Self {
        Self {
            id,
            cmd,
            db_index,
            engine,
            state: Mutex::new(TxState {
                status: TxStatus::Created,
                write_keys: Vec::new(),
                read_keys: Vec::new(),
                locks: None,
                undo_log: Vec::new(),
            }),
        }
    }

    pub(crate) fn status(&self) -> TxStatus {
        self.state
            .lock()
            .map(|state| state.status)
            .unwrap_or(TxStatus::RolledBack)
    }

    /// Locks the key footprint, captures the undo log, and arms the
    /// auto-rollback task.
    pub(crate) fn prepare(self: &Arc<Self>) -> Reply {
        let Some(db) = self.engine.db(self.db_index) else {
            return Reply::err("DB index is out of range");
        };
        {
            let Ok(mut state) = self.state.lock() else {
                return Reply::unknown_err();
            };
            let (write_keys, read_keys) = related_keys(&self.cmd);
            let locks = db.rw_locks(&write_keys, &read_keys);
            state.undo_log = db.undo_logs(&locks, &self.cmd);
            state.write_keys = write_keys;
            state.read_keys = read_keys;
            state.locks = Some(locks);
            state.status = TxStatus::Prepared;
        }

        // Uncommitted transactions roll back on their own once the lock
        // budget runs out.
        let tx = Arc::clone(self);
        timewheel::delay(MAX_LOCK_TIME, wheel_task_key(&self.id), move || {
            if tx.status() == TxStatus::Prepared {
                info!(tx = %tx.id, "aborting transaction past max lock time");
                let _ = tx.rollback();
            }
        });
        Reply::ok()
    }

    /// Executes the prepared argv under the held locks.
    pub(crate) fn commit(&self) -> Reply {
        let Ok(mut state) = self.state.lock() else {
            return Reply::unknown_err();
        };
        match state.status {
            TxStatus::Committed => return Reply::Integer(0),
            TxStatus::RolledBack => {
                return Reply::err("transaction has been rolled back");
            }
            TxStatus::Created | TxStatus::Prepared => {}
        }
        let Some(db) = self.engine.db(self.db_index) else {
            return Reply::err("DB index is out of range");
        };
        let Some(mut locks) = state.locks.take() else {
            return Reply::err("transaction holds no locks");
        };

        let reply = db.exec_with_locks(&mut locks, &self.cmd);
        if reply.is_error() {
            // Undo while the locks are still ours, then surface the error.
            Self::replay_undo(db, &mut locks, &state.undo_log);
            state.status = TxStatus::RolledBack;
            drop(locks);
            return reply;
        }
        db.bump_versions(&state.write_keys);
        state.status = TxStatus::Committed;
        drop(locks);
        reply
    }

    /// Replays the undo log under the held locks; a no-op when already
    /// rolled back or committed.
    pub(crate) fn rollback(&self) -> Reply {
        let Ok(mut state) = self.state.lock() else {
            return Reply::unknown_err();
        };
        match state.status {
            TxStatus::RolledBack => return Reply::Integer(0),
            TxStatus::Committed => return Reply::Integer(0),
            TxStatus::Created | TxStatus::Prepared => {}
        }
        let Some(db) = self.engine.db(self.db_index) else {
            return Reply::err("DB index is out of range");
        };
        if let Some(mut locks) = state.locks.take() {
            let undo_log = std::mem::take(&mut state.undo_log);
            Self::replay_undo(db, &mut locks, &undo_log);
            drop(locks);
        }
        state.status = TxStatus::RolledBack;
        info!(
            tx = %self.id,
            writes = state.write_keys.len(),
            reads = state.read_keys.len(),
            "transaction rolled back"
        );
        Reply::Integer(1)
    }

    fn replay_undo(db: &carmine_storage::Db, locks: &mut Locks, undo_log: &[CmdLine]) {
        for line in undo_log {
            let reply = db.exec_with_locks(locks, line);
            if reply.is_error() {
                warn!(?reply, "undo replay step failed");
            }
        }
    }
}

/// Additional participant-side validation run after the generic prepare,
/// keyed by the prepared command's name.
fn prepare_hook(tx: &Transaction) -> Reply {
    let name = String::from_utf8_lossy(&tx.cmd[0]).to_ascii_uppercase();
    match name.as_str() {
        // MSETNX only commits when none of this participant's keys exist.
        "MSETNX" => {
            let Ok(state) = tx.state.lock() else {
                return Reply::unknown_err();
            };
            let Some(db) = tx.engine.db(tx.db_index) else {
                return Reply::err("DB index is out of range");
            };
            let Some(locks) = state.locks.as_ref() else {
                return Reply::err("transaction holds no locks");
            };
            for pair in tx.cmd[1..].chunks_exact(2) {
                let key = String::from_utf8_lossy(&pair[0]).into_owned();
                if db.exists(locks, &key) {
                    return Reply::err("key already exists");
                }
            }
            Reply::ok()
        }
        // The rename source ships its value back to the coordinator so
        // the destination peer can recreate it.
        "RENAMEFROM" => {
            let Ok(state) = tx.state.lock() else {
                return Reply::unknown_err();
            };
            let Some(db) = tx.engine.db(tx.db_index) else {
                return Reply::err("DB index is out of range");
            };
            let Some(locks) = state.locks.as_ref() else {
                return Reply::err("transaction holds no locks");
            };
            let key = String::from_utf8_lossy(&tx.cmd[1]).into_owned();
            let Some(entity) = db.entity(locks, &key) else {
                return Reply::err("no such key");
            };
            let recreate = carmine_storage::marshal::entity_to_cmd(&key, entity);
            let ttl_millis = db
                .expiry_of(&key)
                .and_then(|deadline| deadline.duration_since(std::time::UNIX_EPOCH).ok())
                .map_or(-1_i64, |elapsed| {
                    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
                });
            let mut dump: CmdLine = vec![ttl_millis.to_string().into_bytes()];
            dump.extend(recreate);
            Reply::multi_bulk(dump)
        }
        _ => Reply::ok(),
    }
    // Failures here leave the locks held; the coordinator's rollback
    // broadcast (or the auto-rollback task) releases them.
}

fn schedule_cleanup(table: &TxTable, id: &str) {
    let table = Arc::clone(table);
    let id = id.to_owned();
    // Keyless task: several cleanups may be pending at once.
    timewheel::delay(CLEANUP_DELAY, String::new(), move || {
        if let Ok(mut table) = table.write() {
            let _ = table.remove(&id);
        }
    });
}

/// `PREPARE id <cmd> <args…>` participant handler.
pub(crate) fn exec_prepare(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() < 3 {
        return Reply::arg_num_err("PREPARE");
    }
    let tx_id = String::from_utf8_lossy(&cmd[1]).into_owned();
    let tx = Arc::new(Transaction::new(
        tx_id.clone(),
        cmd[2..].to_vec(),
        session.db_index,
        Arc::clone(&cluster.db),
    ));
    if let Ok(mut table) = cluster.transactions.write() {
        let _ = table.insert(tx_id, Arc::clone(&tx));
    }
    let prepared = tx.prepare();
    if prepared.is_error() {
        return prepared;
    }
    prepare_hook(&tx)
}

fn lookup_tx(cluster: &Cluster, cmd: &CmdLine) -> Option<Arc<Transaction>> {
    let tx_id = String::from_utf8_lossy(&cmd[1]).into_owned();
    cluster
        .transactions
        .read()
        .ok()
        .and_then(|table| table.get(&tx_id).cloned())
}

/// `COMMIT id` participant handler.
pub(crate) fn exec_commit(cluster: &Cluster, _session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() != 2 {
        return Reply::arg_num_err("COMMIT");
    }
    let Some(tx) = lookup_tx(cluster, &cmd) else {
        return Reply::Integer(0);
    };
    let reply = tx.commit();
    if !reply.is_error() {
        // Not dropped immediately: a late rollback may still arrive.
        timewheel::cancel(wheel_task_key(&tx.id));
        schedule_cleanup(&cluster.transactions, &tx.id);
    }
    reply
}

/// `ROLLBACK id` participant handler.
pub(crate) fn exec_rollback(cluster: &Cluster, _session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() != 2 {
        return Reply::arg_num_err("ROLLBACK");
    }
    let Some(tx) = lookup_tx(cluster, &cmd) else {
        return Reply::Integer(0);
    };
    let reply = tx.rollback();
    timewheel::cancel(wheel_task_key(&tx.id));
    schedule_cleanup(&cluster.transactions, &tx.id);
    reply
}

/// Coordinator side: sends `COMMIT id` to every participant; on failure
/// falls back to a rollback broadcast.
pub(crate) fn request_commit(
    cluster: &Cluster,
    session: &mut Session,
    tx_id: i64,
    group: &HashMap<String, Vec<String>>,
) -> Result<Vec<Reply>, Reply> {
    let line: CmdLine = vec![b"COMMIT".to_vec(), tx_id.to_string().into_bytes()];
    let mut replies = Vec::with_capacity(group.len());
    for peer in group.keys() {
        let reply = cluster.relay(peer, session, line.clone());
        if reply.is_error() {
            request_rollback(cluster, session, tx_id, group);
            return Err(reply);
        }
        replies.push(reply);
    }
    Ok(replies)
}

/// Coordinator side: broadcasts `ROLLBACK id` to every participant.
pub(crate) fn request_rollback(
    cluster: &Cluster,
    session: &mut Session,
    tx_id: i64,
    group: &HashMap<String, Vec<String>>,
) {
    let line: CmdLine = vec![b"ROLLBACK".to_vec(), tx_id.to_string().into_bytes()];
    for peer in group.keys() {
        let _ = cluster.relay(peer, session, line.clone());
    }
}
