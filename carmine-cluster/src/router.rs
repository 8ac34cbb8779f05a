//! Command routing table for cluster mode.

use std::sync::OnceLock;

use hashbrown::HashMap;

use carmine_resp::{CmdLine, Reply, Session};

use crate::Cluster;
use crate::commands;
use crate::tcc;

/// One routed command handler.
pub(crate) type CmdHandler = fn(&Cluster, &mut Session, CmdLine) -> Reply;

static ROUTER: OnceLock<HashMap<&'static str, CmdHandler>> = OnceLock::new();

fn build_router() -> HashMap<&'static str, CmdHandler> {
    let mut table: HashMap<&'static str, CmdHandler> = HashMap::new();

    // TCC control plane.
    let _ = table.insert("PREPARE", tcc::exec_prepare as CmdHandler);
    let _ = table.insert("COMMIT", tcc::exec_commit as CmdHandler);
    let _ = table.insert("ROLLBACK", tcc::exec_rollback as CmdHandler);

    // Multi-key coordination.
    let _ = table.insert("DEL", commands::exec_del as CmdHandler);
    let _ = table.insert("MSET", commands::exec_mset as CmdHandler);
    let _ = table.insert("MSETNX", commands::exec_msetnx as CmdHandler);
    let _ = table.insert("RENAME", commands::exec_rename as CmdHandler);
    let _ = table.insert("RENAMENX", commands::exec_renamenx as CmdHandler);
    let _ = table.insert("EXISTS", commands::exec_exists as CmdHandler);

    // Broadcast aggregation.
    let _ = table.insert("KEYS", commands::exec_keys as CmdHandler);
    let _ = table.insert("FLUSHDB", commands::exec_flush as CmdHandler);
    let _ = table.insert("FLUSHALL", commands::exec_flush as CmdHandler);

    // Connection-local commands, including the MULTI family: local
    // transactions in cluster mode act on this node's keyspace only.
    for name in [
        "PING", "ECHO", "SELECT", "MULTI", "EXEC", "DISCARD", "WATCH", "UNWATCH",
    ] {
        let _ = table.insert(name, commands::local_exec as CmdHandler);
    }

    table
}

/// Resolves a handler: an explicit route, or the single-key relay for
/// every command the storage table knows.
pub(crate) fn route(name: &str) -> Option<CmdHandler> {
    let table = ROUTER.get_or_init(build_router);
    if let Some(handler) = table.get(name) {
        return Some(*handler);
    }
    carmine_storage::command_table()
        .contains_key(name)
        .then_some(commands::default_relay as CmdHandler)
}
