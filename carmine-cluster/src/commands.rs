//! Cluster-routed command handlers.
//!
//! Single-key commands relay to the owning peer. Multi-key reads
//! aggregate per-peer replies; multi-key writes that span peers run the
//! try-commit-cancel protocol from [`crate::tcc`].

use carmine_resp::{CmdLine, Reply, Session};

use crate::Cluster;
use crate::tcc::{request_commit, request_rollback};

fn key_of(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn cmd_of(parts: &[&str]) -> CmdLine {
    parts.iter().map(|part| part.as_bytes().to_vec()).collect()
}

/// Relays a single-key command to the peer owning its first key.
pub(crate) fn default_relay(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() < 2 {
        return Reply::arg_num_err(&String::from_utf8_lossy(&cmd[0]));
    }
    let key = key_of(&cmd[1]);
    let Some(peer) = cluster.ring.pick(&key) else {
        return Reply::err("cluster has no nodes");
    };
    let peer = peer.to_owned();
    cluster.relay(&peer, session, cmd)
}

/// Runs a command against the local node only.
pub(crate) fn local_exec(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    let self_addr = cluster.self_addr.clone();
    cluster.relay(&self_addr, session, cmd)
}

/// `FLUSHDB` / `FLUSHALL`: broadcast, first error wins.
pub(crate) fn exec_flush(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    for (peer, reply) in cluster.broadcast(session, cmd) {
        if reply.is_error() {
            let Reply::Error(detail) = reply else {
                unreachable!("is_error guarantees the error variant");
            };
            return Reply::err(format!("error occurs at {peer}: {detail}"));
        }
    }
    Reply::ok()
}

/// `KEYS pattern`: broadcast and merge the per-peer arrays.
pub(crate) fn exec_keys(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    let mut merged = Vec::new();
    for (_, reply) in cluster.broadcast(session, cmd) {
        match reply {
            Reply::Array(items) => merged.extend(items),
            Reply::Bulk(single) => merged.push(Reply::Bulk(single)),
            error @ Reply::Error(_) => return error,
            _ => {}
        }
    }
    Reply::Array(merged)
}

/// `EXISTS k…`: group keys by owner and sum the per-peer counts.
pub(crate) fn exec_exists(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() < 2 {
        return Reply::arg_num_err("EXISTS");
    }
    let keys: Vec<String> = cmd[1..].iter().map(|raw| key_of(raw)).collect();
    let group = cluster.group_by(&keys);
    if group.len() == 1 {
        let peer = group.keys().next().map(String::clone).unwrap_or_default();
        return cluster.relay(&peer, session, cmd);
    }

    let mut total = 0;
    for (peer, keys) in &group {
        let mut line: CmdLine = vec![b"EXISTS".to_vec()];
        line.extend(keys.iter().map(|key| key.as_bytes().to_vec()));
        match cluster.relay(peer, session, line) {
            Reply::Integer(count) => total += count,
            error @ Reply::Error(_) => return error,
            other => return Reply::err(format!("unexpected EXISTS reply: {other:?}")),
        }
    }
    Reply::Integer(total)
}

/// `DEL k…`: single-owner groups relay directly; spanning groups run a
/// TCC transaction and sum the per-peer deletions.
pub(crate) fn exec_del(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() < 2 {
        return Reply::arg_num_err("DEL");
    }
    let keys: Vec<String> = cmd[1..].iter().map(|raw| key_of(raw)).collect();
    let group = cluster.group_by(&keys);
    if group.len() == 1 {
        let peer = group.keys().next().map(String::clone).unwrap_or_default();
        return cluster.relay(&peer, session, cmd);
    }

    let tx_id = cluster.id_generator.next_id();
    for (peer, keys) in &group {
        let mut line: CmdLine = vec![
            b"PREPARE".to_vec(),
            tx_id.to_string().into_bytes(),
            b"DEL".to_vec(),
        ];
        line.extend(keys.iter().map(|key| key.as_bytes().to_vec()));
        let reply = cluster.relay(peer, session, line);
        if reply.is_error() {
            request_rollback(cluster, session, tx_id, &group);
            return reply;
        }
    }

    match request_commit(cluster, session, tx_id, &group) {
        Err(error) => error,
        Ok(replies) => {
            let mut total = 0;
            for reply in replies {
                if let Reply::Integer(count) = reply {
                    total += count;
                }
            }
            Reply::Integer(total)
        }
    }
}

/// `MSET k v…`: spanning groups prepare each peer's pairs, then commit.
pub(crate) fn exec_mset(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    exec_multi_set(cluster, session, cmd, "MSET")
}

/// `MSETNX k v…`: like `MSET`, with a prepare-time existence check on
/// every participant.
pub(crate) fn exec_msetnx(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    exec_multi_set(cluster, session, cmd, "MSETNX")
}

fn exec_multi_set(cluster: &Cluster, session: &mut Session, cmd: CmdLine, name: &str) -> Reply {
    let pair_count = cmd.len().saturating_sub(1);
    if pair_count == 0 || !pair_count.is_multiple_of(2) {
        return Reply::arg_num_err(name);
    }

    let mut keys = Vec::with_capacity(pair_count / 2);
    let mut values = hashbrown::HashMap::with_capacity(pair_count / 2);
    for pair in cmd[1..].chunks_exact(2) {
        let key = key_of(&pair[0]);
        let _ = values.insert(key.clone(), pair[1].clone());
        keys.push(key);
    }
    let group = cluster.group_by(&keys);
    if group.len() == 1 {
        let peer = group.keys().next().map(String::clone).unwrap_or_default();
        return cluster.relay(&peer, session, cmd);
    }

    let tx_id = cluster.id_generator.next_id();
    for (peer, keys) in &group {
        let mut line: CmdLine = vec![
            b"PREPARE".to_vec(),
            tx_id.to_string().into_bytes(),
            name.as_bytes().to_vec(),
        ];
        for key in keys {
            line.push(key.as_bytes().to_vec());
            line.push(values.get(key).cloned().unwrap_or_default());
        }
        let reply = cluster.relay(peer, session, line);
        if reply.is_error() {
            request_rollback(cluster, session, tx_id, &group);
            return reply;
        }
    }

    match request_commit(cluster, session, tx_id, &group) {
        Err(error) => error,
        Ok(_) => {
            if name == "MSETNX" {
                Reply::Integer(1)
            } else {
                Reply::ok()
            }
        }
    }
}

/// `RENAME src dst`: same-owner pairs relay; cross-owner pairs move the
/// serialized entity through paired `RENAMEFROM`/`RENAMETO` prepares.
pub(crate) fn exec_rename(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() != 3 {
        return Reply::arg_num_err("RENAME");
    }
    rename_across_peers(cluster, session, cmd)
}

/// `RENAMENX src dst`: refuses an existing destination, then renames.
pub(crate) fn exec_renamenx(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    if cmd.len() != 3 {
        return Reply::arg_num_err("RENAMENX");
    }
    let dst = key_of(&cmd[2]);
    let exists = {
        let Some(peer) = cluster.ring.pick(&dst) else {
            return Reply::err("cluster has no nodes");
        };
        let peer = peer.to_owned();
        cluster.relay(&peer, session, cmd_of(&["EXISTS", &dst]))
    };
    match exists {
        Reply::Integer(0) => {}
        Reply::Integer(_) => return Reply::Integer(0),
        error @ Reply::Error(_) => return error,
        other => return Reply::err(format!("unexpected EXISTS reply: {other:?}")),
    }
    match rename_across_peers(cluster, session, cmd) {
        Reply::Status(_) => Reply::Integer(1),
        other => other,
    }
}

fn rename_across_peers(cluster: &Cluster, session: &mut Session, cmd: CmdLine) -> Reply {
    let src = key_of(&cmd[1]);
    let dst = key_of(&cmd[2]);
    let (Some(src_peer), Some(dst_peer)) = (cluster.ring.pick(&src), cluster.ring.pick(&dst))
    else {
        return Reply::err("cluster has no nodes");
    };
    let (src_peer, dst_peer) = (src_peer.to_owned(), dst_peer.to_owned());
    if src_peer == dst_peer {
        return cluster.relay(&src_peer, session, cmd);
    }

    let tx_id = cluster.id_generator.next_id();
    let mut group = hashbrown::HashMap::new();
    let _ = group.insert(src_peer.clone(), vec![src.clone()]);
    let _ = group.insert(dst_peer.clone(), vec![dst.clone()]);

    // Try on the source; its prepare reply carries the value dump:
    // [pexpireat-ms, recreate-cmd, src-key, recreate-args...].
    let prepare_from: CmdLine = vec![
        b"PREPARE".to_vec(),
        tx_id.to_string().into_bytes(),
        b"RENAMEFROM".to_vec(),
        cmd[1].clone(),
    ];
    let dump = match cluster.relay(&src_peer, session, prepare_from) {
        Reply::Array(items) => items,
        error @ Reply::Error(_) => {
            request_rollback(cluster, session, tx_id, &group);
            return error;
        }
        other => {
            request_rollback(cluster, session, tx_id, &group);
            return Reply::err(format!("unexpected rename dump reply: {other:?}"));
        }
    };
    let mut dump_args: CmdLine = Vec::with_capacity(dump.len());
    for item in dump {
        match item {
            Reply::Bulk(bytes) => dump_args.push(bytes),
            _ => {
                request_rollback(cluster, session, tx_id, &group);
                return Reply::err("malformed rename dump reply");
            }
        }
    }
    if dump_args.len() < 3 {
        request_rollback(cluster, session, tx_id, &group);
        return Reply::err("malformed rename dump reply");
    }

    // Try on the destination: RENAMETO dst <ms> <recreate-cmd> <args...>,
    // dropping the dump's embedded source key.
    let mut prepare_to: CmdLine = vec![
        b"PREPARE".to_vec(),
        tx_id.to_string().into_bytes(),
        b"RENAMETO".to_vec(),
        cmd[2].clone(),
        dump_args[0].clone(),
        dump_args[1].clone(),
    ];
    prepare_to.extend(dump_args[3..].iter().cloned());
    let reply = cluster.relay(&dst_peer, session, prepare_to);
    if reply.is_error() {
        request_rollback(cluster, session, tx_id, &group);
        return reply;
    }

    match request_commit(cluster, session, tx_id, &group) {
        Err(error) => error,
        Ok(_) => Reply::ok(),
    }
}
