//! Generic key-space commands: existence, deletion, renaming, expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use carmine_resp::{CmdLine, Reply};

use crate::args::{key_of, parse_int};
use crate::command::{
    CommandSpec, CommandTable, read_all_keys, read_first_key, write_all_keys, write_first_key,
    write_two_keys,
};
use crate::db::{Db, Locks};
use crate::rollback::{rollback_all_keys, rollback_first_key, rollback_keys};
use crate::wildcard::Pattern;

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "DEL",
            arity: -2,
            prepare: Some(write_all_keys),
            execute: exec_del,
            undo: Some(rollback_all_keys),
        },
        CommandSpec {
            name: "EXISTS",
            arity: -2,
            prepare: Some(read_all_keys),
            execute: exec_exists,
            undo: None,
        },
        CommandSpec {
            name: "TYPE",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_type,
            undo: None,
        },
        // KEYS walks every bucket with self-locking reads, so it must
        // not run while EXEC holds a bucket footprint; no `prepare`
        // keeps it out of MULTI queues.
        CommandSpec {
            name: "KEYS",
            arity: 2,
            prepare: None,
            execute: exec_keys,
            undo: None,
        },
        CommandSpec {
            name: "RENAME",
            arity: 3,
            prepare: Some(write_two_keys),
            execute: exec_rename,
            undo: Some(rollback_rename),
        },
        CommandSpec {
            name: "RENAMENX",
            arity: 3,
            prepare: Some(write_two_keys),
            execute: exec_renamenx,
            undo: Some(rollback_rename),
        },
        CommandSpec {
            name: "RENAMEFROM",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_renamefrom,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "RENAMETO",
            arity: -4,
            prepare: Some(write_first_key),
            execute: exec_renameto,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "EXPIRE",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_expire,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "PEXPIRE",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_pexpire,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "EXPIREAT",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_expireat,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "PEXPIREAT",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_pexpireat,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "TTL",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_ttl,
            undo: None,
        },
        CommandSpec {
            name: "PTTL",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_pttl,
            undo: None,
        },
        CommandSpec {
            name: "PERSIST",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_persist,
            undo: Some(rollback_first_key),
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

fn exec_del(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let removed = db.remove_keys(locks, args);
    if removed > 0 {
        db.append(Db::to_cmd("DEL", args));
    }
    Reply::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
}

fn exec_exists(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let mut found = 0;
    for raw in args {
        if db.exists(locks, &key_of(raw)) {
            found += 1;
        }
    }
    Reply::Integer(found)
}

fn exec_type(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.entity(locks, &key) {
        None => Reply::Status("none".to_owned()),
        Some(entity) => Reply::Status(entity.type_name().to_owned()),
    }
}

fn exec_keys(db: &Db, _locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let pattern = Pattern::compile(&key_of(&args[0]));
    let mut matched: CmdLine = Vec::new();
    db.for_each_key(|key| {
        if pattern.matches(key) {
            matched.push(key.as_bytes().to_vec());
        }
        true
    });
    Reply::multi_bulk(matched)
}

fn rename_entity(db: &Db, locks: &mut Locks, src: &str, dst: &str) -> Option<()> {
    let expiry = db.expiry_of(src);
    let entity = db.remove_entity(locks, src)?;
    let _ = db.put_entity(locks, dst, entity);
    let _ = db.persist(dst);
    if let Some(deadline) = expiry {
        db.expire_at(dst, deadline);
    }
    Some(())
}

fn exec_rename(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let src = key_of(&args[0]);
    let dst = key_of(&args[1]);
    if db.entity_mut(locks, &src).is_none() {
        return Reply::err("no such key");
    }
    let _ = rename_entity(db, locks, &src, &dst);
    db.append(Db::to_cmd("RENAME", args));
    Reply::ok()
}

fn exec_renamenx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let src = key_of(&args[0]);
    let dst = key_of(&args[1]);
    if db.entity_mut(locks, &src).is_none() {
        return Reply::err("no such key");
    }
    if db.exists(locks, &dst) {
        return Reply::Integer(0);
    }
    let _ = rename_entity(db, locks, &src, &dst);
    db.append(Db::to_cmd("RENAMENX", args));
    Reply::Integer(1)
}

fn rollback_rename(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let keys = [key_of(&args[0]), key_of(&args[1])];
    rollback_keys(db, locks, &keys)
}

/// Source half of a cross-peer rename: drop the key locally. The value
/// travels to the destination peer inside its `RENAMETO` prepare.
fn exec_renamefrom(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    if db.entity_mut(locks, &key).is_none() {
        return Reply::err("no such key");
    }
    let _ = db.remove_entity(locks, &key);
    db.append(vec![b"DEL".to_vec(), args[0].clone()]);
    Reply::ok()
}

/// Destination half of a cross-peer rename:
/// `RENAMETO dst <pexpireat-ms|-1> <recreate-cmd> <recreate-args...>`.
fn exec_renameto(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let dst = key_of(&args[0]);
    let Ok(ttl_millis) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    let _ = db.remove_entity(locks, &dst);

    let mut recreate: CmdLine = vec![args[2].clone(), args[0].clone()];
    recreate.extend(args[3..].iter().cloned());
    let reply = db.exec_with_locks(locks, &recreate);
    if reply.is_error() {
        return reply;
    }
    if ttl_millis >= 0 {
        #[allow(clippy::cast_sign_loss)]
        let deadline = UNIX_EPOCH + Duration::from_millis(ttl_millis as u64);
        db.expire_at(&dst, deadline);
        db.append(crate::marshal::expiry_to_cmd(&dst, deadline));
    }
    Reply::ok()
}

fn expire_in(db: &Db, locks: &mut Locks, args: &[Vec<u8>], unit_millis: i64) -> Reply {
    let key = key_of(&args[0]);
    let Ok(amount) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    if db.entity_mut(locks, &key).is_none() {
        return Reply::Integer(0);
    }
    let millis = amount.saturating_mul(unit_millis);
    if millis <= 0 {
        // A non-positive relative TTL deletes the key outright.
        let _ = db.remove_entity(locks, &key);
        db.append(vec![b"DEL".to_vec(), args[0].clone()]);
        return Reply::Integer(1);
    }
    #[allow(clippy::cast_sign_loss)]
    let deadline = SystemTime::now() + Duration::from_millis(millis as u64);
    db.expire_at(&key, deadline);
    db.append(crate::marshal::expiry_to_cmd(&key, deadline));
    Reply::Integer(1)
}

fn exec_expire(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    expire_in(db, locks, args, 1_000)
}

fn exec_pexpire(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    expire_in(db, locks, args, 1)
}

fn expire_at_absolute(db: &Db, locks: &mut Locks, args: &[Vec<u8>], unit_millis: i64) -> Reply {
    let key = key_of(&args[0]);
    let Ok(stamp) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    if db.entity_mut(locks, &key).is_none() {
        return Reply::Integer(0);
    }
    let millis = stamp.saturating_mul(unit_millis);
    let deadline = UNIX_EPOCH + Duration::from_millis(u64::try_from(millis.max(0)).unwrap_or(0));
    if deadline <= SystemTime::now() {
        let _ = db.remove_entity(locks, &key);
        db.append(vec![b"DEL".to_vec(), args[0].clone()]);
        return Reply::Integer(1);
    }
    db.expire_at(&key, deadline);
    db.append(crate::marshal::expiry_to_cmd(&key, deadline));
    Reply::Integer(1)
}

fn exec_expireat(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    expire_at_absolute(db, locks, args, 1_000)
}

fn exec_pexpireat(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    expire_at_absolute(db, locks, args, 1)
}

fn remaining_ttl(db: &Db, locks: &Locks, key: &str) -> Option<Option<Duration>> {
    if db.entity(locks, key).is_none() {
        return None;
    }
    match db.expiry_of(key) {
        None => Some(None),
        Some(deadline) => Some(Some(
            deadline
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )),
    }
}

fn exec_ttl(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match remaining_ttl(db, locks, &key) {
        None => Reply::Integer(-2),
        Some(None) => Reply::Integer(-1),
        Some(Some(remaining)) => {
            let seconds = (remaining.as_millis() + 999) / 1_000;
            Reply::Integer(i64::try_from(seconds).unwrap_or(i64::MAX))
        }
    }
}

fn exec_pttl(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match remaining_ttl(db, locks, &key) {
        None => Reply::Integer(-2),
        Some(None) => Reply::Integer(-1),
        Some(Some(remaining)) => {
            Reply::Integer(i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX))
        }
    }
}

fn exec_persist(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    if db.entity_mut(locks, &key).is_none() {
        return Reply::Integer(0);
    }
    if db.persist(&key) {
        db.append(Db::to_cmd("PERSIST", args));
        Reply::Integer(1)
    } else {
        Reply::Integer(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{Db, DbConfig};
    use carmine_resp::{Reply, Session, cmd_line};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_db() -> Db {
        Db::new(
            0,
            DbConfig {
                buckets: 16,
                list_page_size: 4,
                set_intset_cap: 4,
            },
            Arc::new(std::sync::OnceLock::new()),
        )
    }

    fn exec(db: &Db, parts: &[&str]) -> Reply {
        db.exec(&mut Session::default(), cmd_line(parts))
    }

    #[rstest]
    fn del_and_exists_count_keys() {
        let db = test_db();
        let _ = exec(&db, &["SET", "a", "1"]);
        let _ = exec(&db, &["SET", "b", "2"]);
        assert_that!(exec(&db, &["EXISTS", "a", "b", "c"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["DEL", "a", "b", "c"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["EXISTS", "a", "b"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn type_reports_entity_kind() {
        let db = test_db();
        let _ = exec(&db, &["SET", "s", "v"]);
        let _ = exec(&db, &["LPUSH", "l", "v"]);
        let _ = exec(&db, &["SADD", "st", "v"]);
        assert_that!(exec(&db, &["TYPE", "s"]), eq(&Reply::Status("string".to_owned())));
        assert_that!(exec(&db, &["TYPE", "l"]), eq(&Reply::Status("list".to_owned())));
        assert_that!(exec(&db, &["TYPE", "st"]), eq(&Reply::Status("set".to_owned())));
        assert_that!(exec(&db, &["TYPE", "nope"]), eq(&Reply::Status("none".to_owned())));
    }

    #[rstest]
    fn keys_matches_glob_patterns() {
        let db = test_db();
        let _ = exec(&db, &["SET", "user:1", "a"]);
        let _ = exec(&db, &["SET", "user:2", "b"]);
        let _ = exec(&db, &["SET", "session:1", "c"]);
        let Reply::Array(found) = exec(&db, &["KEYS", "user:*"]) else {
            panic!("KEYS must reply with an array");
        };
        assert_that!(found.len(), eq(2_usize));
    }

    #[rstest]
    fn rename_moves_value_and_ttl() {
        let db = test_db();
        let _ = exec(&db, &["SET", "src", "v"]);
        let _ = exec(&db, &["EXPIRE", "src", "100"]);
        assert_that!(exec(&db, &["RENAME", "src", "dst"]), eq(&Reply::ok()));
        assert_that!(exec(&db, &["GET", "src"]), eq(&Reply::NullBulk));
        assert_that!(exec(&db, &["GET", "dst"]), eq(&Reply::Bulk(b"v".to_vec())));
        assert_that!(db.expiry_of("dst").is_some(), eq(true));
        assert_that!(db.expiry_of("src").is_none(), eq(true));
        assert_that!(exec(&db, &["RENAME", "ghost", "x"]).is_error(), eq(true));
    }

    #[rstest]
    fn renamenx_refuses_existing_destination() {
        let db = test_db();
        let _ = exec(&db, &["SET", "src", "v"]);
        let _ = exec(&db, &["SET", "dst", "w"]);
        assert_that!(exec(&db, &["RENAMENX", "src", "dst"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["GET", "src"]), eq(&Reply::Bulk(b"v".to_vec())));
        let _ = exec(&db, &["DEL", "dst"]);
        assert_that!(exec(&db, &["RENAMENX", "src", "dst"]), eq(&Reply::Integer(1)));
    }

    #[rstest]
    fn ttl_reports_reference_sentinels() {
        let db = test_db();
        assert_that!(exec(&db, &["TTL", "ghost"]), eq(&Reply::Integer(-2)));
        let _ = exec(&db, &["SET", "k", "v"]);
        assert_that!(exec(&db, &["TTL", "k"]), eq(&Reply::Integer(-1)));
        let _ = exec(&db, &["EXPIRE", "k", "100"]);
        let Reply::Integer(remaining) = exec(&db, &["TTL", "k"]) else {
            panic!("TTL must reply with an integer");
        };
        assert_that!(remaining, ge(99));
        assert_that!(remaining, le(100));
    }

    #[rstest]
    fn expired_key_is_gone_for_reads_and_ttl() {
        let db = test_db();
        let _ = exec(&db, &["SET", "k", "v"]);
        db.expire_at("k", std::time::SystemTime::now() - Duration::from_secs(1));
        assert_that!(exec(&db, &["GET", "k"]), eq(&Reply::NullBulk));
        assert_that!(exec(&db, &["TTL", "k"]), eq(&Reply::Integer(-2)));
    }

    #[rstest]
    fn persist_drops_expiry_once() {
        let db = test_db();
        let _ = exec(&db, &["SET", "k", "v"]);
        let _ = exec(&db, &["EXPIRE", "k", "100"]);
        assert_that!(exec(&db, &["PERSIST", "k"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["PERSIST", "k"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["TTL", "k"]), eq(&Reply::Integer(-1)));
    }

    #[rstest]
    fn non_positive_expire_deletes_the_key() {
        let db = test_db();
        let _ = exec(&db, &["SET", "k", "v"]);
        assert_that!(exec(&db, &["EXPIRE", "k", "-1"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["EXISTS", "k"]), eq(&Reply::Integer(0)));
    }
}
