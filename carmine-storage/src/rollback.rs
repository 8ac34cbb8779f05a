//! Undo-log builders.
//!
//! These run under the command's lock set, *before* its body executes,
//! and produce argv vectors that restore the pre-execute state of the
//! declared write keys when replayed through the no-lock exec path.
//!
//! The whole-key snapshot is the universal fallback; the field- and
//! member-level builders keep undo logs proportional to the touched
//! fields instead of the container size.

use carmine_resp::CmdLine;

use crate::args::{format_score, key_of};
use crate::db::{Db, Locks};
use crate::entity::Entity;
use crate::marshal::{entity_to_cmd, expiry_to_cmd};

fn del_cmd(key: &str) -> CmdLine {
    vec![b"DEL".to_vec(), key.as_bytes().to_vec()]
}

/// Snapshot undo for whole keys: delete, then recreate value and expiry.
pub(crate) fn rollback_keys(db: &Db, locks: &Locks, keys: &[String]) -> Vec<CmdLine> {
    let mut cmds = Vec::new();
    for key in keys {
        match db.entity(locks, key) {
            None => cmds.push(del_cmd(key)),
            Some(entity) => {
                cmds.push(del_cmd(key));
                cmds.push(entity_to_cmd(key, entity));
                if let Some(deadline) = db.expiry_of(key) {
                    cmds.push(expiry_to_cmd(key, deadline));
                }
            }
        }
    }
    cmds
}

/// Snapshot undo for the first argument key.
pub(crate) fn rollback_first_key(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    rollback_keys(db, locks, &[key_of(&args[0])])
}

/// Snapshot undo for every argument key.
pub(crate) fn rollback_all_keys(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().map(|arg| key_of(arg)).collect();
    rollback_keys(db, locks, &keys)
}

/// Field-level undo for hash writes.
pub(crate) fn rollback_hash_fields(
    db: &Db,
    locks: &Locks,
    key: &str,
    fields: &[Vec<u8>],
) -> Vec<CmdLine> {
    let hash = match db.entity(locks, key) {
        None => return vec![del_cmd(key)],
        Some(Entity::Hash(hash)) => hash,
        Some(_) => return Vec::new(),
    };
    let mut cmds = Vec::new();
    for field in fields {
        match hash.get(field) {
            None => cmds.push(vec![
                b"HDEL".to_vec(),
                key.as_bytes().to_vec(),
                field.clone(),
            ]),
            Some(value) => cmds.push(vec![
                b"HSET".to_vec(),
                key.as_bytes().to_vec(),
                field.clone(),
                value.clone(),
            ]),
        }
    }
    cmds
}

/// Member-level undo for set writes.
///
/// When the write would trigger an encoding upgrade of a packed set, the
/// member-wise inverse cannot restore the old encoding, so the builder
/// falls back to a whole-value snapshot.
pub(crate) fn rollback_set_members(
    db: &Db,
    locks: &Locks,
    key: &str,
    members: &[Vec<u8>],
) -> Vec<CmdLine> {
    let set = match db.entity(locks, key) {
        None => return vec![del_cmd(key)],
        Some(Entity::Set(set)) => set,
        Some(_) => return Vec::new(),
    };

    let all_ints = members
        .iter()
        .all(|member| crate::args::parse_int(member).is_ok());
    if set.is_packed() && !all_ints {
        return vec![del_cmd(key), entity_to_cmd(key, db.entity(locks, key).expect("checked"))];
    }

    let mut absent: CmdLine = vec![b"SREM".to_vec(), key.as_bytes().to_vec()];
    let mut present: CmdLine = vec![b"SADD".to_vec(), key.as_bytes().to_vec()];
    for member in members {
        if set.contains(member) {
            present.push(member.clone());
        } else {
            absent.push(member.clone());
        }
    }
    let mut cmds = Vec::new();
    if absent.len() > 2 {
        cmds.push(absent);
    }
    if present.len() > 2 {
        cmds.push(present);
    }
    cmds
}

/// Member-level undo for sorted-set writes.
pub(crate) fn rollback_zset_members(
    db: &Db,
    locks: &Locks,
    key: &str,
    members: &[Vec<u8>],
) -> Vec<CmdLine> {
    let zset = match db.entity(locks, key) {
        None => return vec![del_cmd(key)],
        Some(Entity::SortedSet(zset)) => zset,
        Some(_) => return Vec::new(),
    };
    let mut cmds = Vec::new();
    for member in members {
        match zset.score(member) {
            None => cmds.push(vec![
                b"ZREM".to_vec(),
                key.as_bytes().to_vec(),
                member.clone(),
            ]),
            Some(score) => cmds.push(vec![
                b"ZADD".to_vec(),
                key.as_bytes().to_vec(),
                format_score(score).into_bytes(),
                member.clone(),
            ]),
        }
    }
    cmds
}
