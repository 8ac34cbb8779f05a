//! Local transactions: `MULTI` queueing and the `EXEC` executor.
//!
//! Queueing lives on the connection session; `EXEC` is a single function
//! over `(db, queued commands, watch snapshot)`. It locks the union
//! footprint of every queued command plus the watched keys, validates the
//! watch versions, then runs the bodies with undo logs captured *before*
//! each body so a mid-transaction failure can unwind the stack in
//! reverse through the no-lock exec path.

use hashbrown::HashSet;

use carmine_resp::{CmdLine, Reply, Session};

use crate::args::key_of;
use crate::command::{self, related_keys};
use crate::db::Db;

/// Session-level dispatch: intercepts transaction-control commands and
/// `MULTI` queueing before the normal locking path.
pub fn exec_in_session(db: &Db, session: &mut Session, cmd: CmdLine) -> Reply {
    let Some(first) = cmd.first() else {
        return Reply::unknown_err();
    };
    let name = String::from_utf8_lossy(first).to_ascii_uppercase();
    match name.as_str() {
        "MULTI" => exec_multi_begin(session),
        "DISCARD" => exec_discard(session),
        "EXEC" => exec_multi(db, session),
        "WATCH" => exec_watch(db, session, &cmd[1..]),
        "UNWATCH" => exec_unwatch(session),
        // PING bypasses queueing so heartbeats never pollute transactions.
        _ if session.in_multi() && name != "PING" => enqueue_cmd(session, cmd),
        _ => db.exec_normal(&cmd),
    }
}

fn exec_multi_begin(session: &mut Session) -> Reply {
    if session.in_multi() {
        return Reply::err("MULTI calls can not be nested");
    }
    session.reset_multi();
    session.set_multi(true);
    Reply::ok()
}

fn exec_discard(session: &mut Session) -> Reply {
    if !session.in_multi() {
        return Reply::err("DISCARD without MULTI");
    }
    session.reset_multi();
    Reply::ok()
}

fn exec_watch(db: &Db, session: &mut Session, keys: &[Vec<u8>]) -> Reply {
    if session.in_multi() {
        return Reply::err("WATCH inside MULTI is not allowed");
    }
    if keys.is_empty() {
        return Reply::arg_num_err("WATCH");
    }
    for raw in keys {
        let key = key_of(raw);
        let version = db.version_of(&key);
        session.watch(key, version);
    }
    Reply::ok()
}

fn exec_unwatch(session: &mut Session) -> Reply {
    session.unwatch();
    Reply::ok()
}

/// Validates a command for queueing; failures are recorded on the
/// session's error list but the queue itself is preserved.
fn enqueue_cmd(session: &mut Session, cmd: CmdLine) -> Reply {
    let name = String::from_utf8_lossy(&cmd[0]).into_owned();
    let Some(spec) = command::lookup(&name) else {
        let reply = Reply::unknown_command_err(&name);
        record_tx_error(session, &reply);
        return reply;
    };
    let Some(prepare) = spec.prepare else {
        let reply = Reply::err(format!(
            "command '{}' cannot be used in MULTI",
            name.to_lowercase()
        ));
        record_tx_error(session, &reply);
        return reply;
    };
    if !command::arity_matches(spec.arity, cmd.len()) {
        let reply = Reply::arg_num_err(spec.name);
        record_tx_error(session, &reply);
        return reply;
    }
    let (write_keys, _) = prepare(&cmd[1..]);
    if !write_keys.is_empty() && spec.undo.is_none() {
        let reply = Reply::err(format!(
            "command '{}' cannot be used in MULTI",
            name.to_lowercase()
        ));
        record_tx_error(session, &reply);
        return reply;
    }
    session.enqueue(cmd);
    Reply::queued()
}

fn record_tx_error(session: &mut Session, reply: &Reply) {
    if let Reply::Error(message) = reply {
        session.add_tx_error(message.clone());
    }
}

/// The `EXEC` algorithm.
fn exec_multi(db: &Db, session: &mut Session) -> Reply {
    if !session.in_multi() {
        return Reply::err("EXEC without MULTI");
    }
    if session.has_tx_errors() {
        session.reset_multi();
        session.unwatch();
        return Reply::Error(
            "EXECABORT Transaction discarded because of previous errors.".to_owned(),
        );
    }

    let queued: Vec<CmdLine> = session.queued().to_vec();
    let watch_snapshot: Vec<(String, u32)> = session
        .watching()
        .iter()
        .map(|(key, version)| (key.clone(), *version))
        .collect();
    session.reset_multi();
    session.unwatch();

    exec_queued(db, &queued, &watch_snapshot)
}

/// Runs queued commands under the union lock footprint.
///
/// Pure over `(db, queued, watch_snapshot)`; session state was already
/// cleared by the caller.
pub fn exec_queued(db: &Db, queued: &[CmdLine], watch_snapshot: &[(String, u32)]) -> Reply {
    let mut write_keys: Vec<String> = Vec::new();
    let mut read_keys: Vec<String> = Vec::new();
    for cmd in queued {
        let (writes, reads) = related_keys(cmd);
        write_keys.extend(writes);
        read_keys.extend(reads);
    }
    read_keys.extend(watch_snapshot.iter().map(|(key, _)| key.clone()));

    let mut locks = db.rw_locks(&write_keys, &read_keys);

    for (key, observed) in watch_snapshot {
        if db.version_of(key) != *observed {
            return Reply::NullArray;
        }
    }

    let mut results = Vec::with_capacity(queued.len());
    let mut undo_stack: Vec<Vec<CmdLine>> = Vec::with_capacity(queued.len());
    for cmd in queued {
        undo_stack.push(db.undo_logs(&locks, cmd));
        let reply = db.exec_with_locks(&mut locks, cmd);
        if reply.is_error() {
            // The failing command left no state change; drop its undo
            // entry and unwind the rest in reverse.
            let _ = undo_stack.pop();
            while let Some(undo_cmds) = undo_stack.pop() {
                for undo_cmd in undo_cmds {
                    let _ = db.exec_with_locks(&mut locks, &undo_cmd);
                }
            }
            return reply;
        }
        results.push(reply);
    }

    let distinct: HashSet<String> = write_keys.into_iter().collect();
    let distinct: Vec<String> = distinct.into_iter().collect();
    db.bump_versions(&distinct);
    drop(locks);
    Reply::Array(results)
}
