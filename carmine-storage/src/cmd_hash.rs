//! Hash commands.

use carmine_resp::{CmdLine, Reply};

use crate::args::{key_of, parse_int};
use crate::command::{CommandSpec, CommandTable, read_first_key, write_first_key};
use crate::db::{Db, Locks};
use crate::rollback::rollback_hash_fields;

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "HSET",
            arity: -4,
            prepare: Some(write_first_key),
            execute: exec_hset,
            undo: Some(undo_hset),
        },
        CommandSpec {
            name: "HSETNX",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_hsetnx,
            undo: Some(undo_single_field),
        },
        CommandSpec {
            name: "HMSET",
            arity: -4,
            prepare: Some(write_first_key),
            execute: exec_hmset,
            undo: Some(undo_hset),
        },
        CommandSpec {
            name: "HGET",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_hget,
            undo: None,
        },
        CommandSpec {
            name: "HEXISTS",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_hexists,
            undo: None,
        },
        CommandSpec {
            name: "HDEL",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_hdel,
            undo: Some(undo_hdel),
        },
        CommandSpec {
            name: "HLEN",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_hlen,
            undo: None,
        },
        CommandSpec {
            name: "HSTRLEN",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_hstrlen,
            undo: None,
        },
        CommandSpec {
            name: "HMGET",
            arity: -3,
            prepare: Some(read_first_key),
            execute: exec_hmget,
            undo: None,
        },
        CommandSpec {
            name: "HKEYS",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_hkeys,
            undo: None,
        },
        CommandSpec {
            name: "HVALS",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_hvals,
            undo: None,
        },
        CommandSpec {
            name: "HGETALL",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_hgetall,
            undo: None,
        },
        CommandSpec {
            name: "HINCRBY",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_hincrby,
            undo: Some(undo_single_field),
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

fn set_fields(db: &Db, locks: &mut Locks, args: &[Vec<u8>], name: &str) -> Result<i64, Reply> {
    if !args[1..].len().is_multiple_of(2) {
        return Err(Reply::arg_num_err(name));
    }
    let key = key_of(&args[0]);
    let hash = db.hash_or_create(locks, &key)?;
    let mut created = 0;
    for pair in args[1..].chunks_exact(2) {
        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
            created += 1;
        }
    }
    db.append(Db::to_cmd(name, args));
    Ok(created)
}

fn exec_hset(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match set_fields(db, locks, args, "HSET") {
        Ok(created) => Reply::Integer(created),
        Err(reply) => reply,
    }
}

fn exec_hmset(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match set_fields(db, locks, args, "HMSET") {
        Ok(_) => Reply::ok(),
        Err(reply) => reply,
    }
}

fn exec_hsetnx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let hash = match db.hash_or_create(locks, &key) {
        Ok(hash) => hash,
        Err(reply) => return reply,
    };
    if hash.contains_key(&args[1]) {
        return Reply::Integer(0);
    }
    let _ = hash.insert(args[1].clone(), args[2].clone());
    db.append(Db::to_cmd("HSETNX", args));
    Reply::Integer(1)
}

fn exec_hget(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::NullBulk,
        Ok(Some(hash)) => match hash.get(&args[1]) {
            Some(value) => Reply::Bulk(value.clone()),
            None => Reply::NullBulk,
        },
    }
}

fn exec_hexists(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(hash)) => Reply::Integer(i64::from(hash.contains_key(&args[1]))),
    }
}

fn exec_hdel(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let hash = match db.hash_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(hash)) => hash,
    };
    let mut removed = 0;
    for field in &args[1..] {
        if hash.remove(field).is_some() {
            removed += 1;
        }
    }
    let emptied = hash.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("HDEL", args));
    }
    Reply::Integer(removed)
}

fn exec_hlen(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(hash)) => Reply::Integer(i64::try_from(hash.len()).unwrap_or(i64::MAX)),
    }
}

fn exec_hstrlen(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(hash)) => {
            let len = hash.get(&args[1]).map_or(0, Vec::len);
            Reply::Integer(i64::try_from(len).unwrap_or(i64::MAX))
        }
    }
}

fn exec_hmget(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let hash = match db.hash(locks, &key) {
        Err(reply) => return reply,
        Ok(hash) => hash,
    };
    let values = args[1..]
        .iter()
        .map(|field| {
            hash.and_then(|hash| hash.get(field))
                .map_or(Reply::NullBulk, |value| Reply::Bulk(value.clone()))
        })
        .collect();
    Reply::Array(values)
}

fn exec_hkeys(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Array(Vec::new()),
        Ok(Some(hash)) => Reply::multi_bulk(hash.keys().cloned().collect()),
    }
}

fn exec_hvals(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Array(Vec::new()),
        Ok(Some(hash)) => Reply::multi_bulk(hash.values().cloned().collect()),
    }
}

fn exec_hgetall(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.hash(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Array(Vec::new()),
        Ok(Some(hash)) => {
            let mut flat: CmdLine = Vec::with_capacity(hash.len() * 2);
            for (field, value) in hash {
                flat.push(field.clone());
                flat.push(value.clone());
            }
            Reply::multi_bulk(flat)
        }
    }
}

fn exec_hincrby(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(delta) = parse_int(&args[2]) else {
        return Reply::not_integer_err();
    };
    let hash = match db.hash_or_create(locks, &key) {
        Ok(hash) => hash,
        Err(reply) => return reply,
    };
    let current = match hash.get(&args[1]) {
        None => 0,
        Some(value) => match parse_int(value) {
            Ok(current) => current,
            Err(()) => return Reply::err("hash value is not an integer"),
        },
    };
    let Some(next) = current.checked_add(delta) else {
        return Reply::err("increment or decrement would overflow");
    };
    let _ = hash.insert(args[1].clone(), next.to_string().into_bytes());
    db.append(Db::to_cmd("HINCRBY", args));
    Reply::Integer(next)
}

fn undo_hset(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let fields: Vec<Vec<u8>> = args[1..].chunks_exact(2).map(|pair| pair[0].clone()).collect();
    rollback_hash_fields(db, locks, &key, &fields)
}

fn undo_hdel(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_hash_fields(db, locks, &key, &args[1..])
}

fn undo_single_field(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_hash_fields(db, locks, &key, std::slice::from_ref(&args[1]))
}

#[cfg(test)]
mod tests {
    use crate::db::{Db, DbConfig};
    use carmine_resp::{Reply, Session, cmd_line};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

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
    fn hset_counts_new_fields_only() {
        let db = test_db();
        assert_that!(exec(&db, &["HSET", "h", "a", "1", "b", "2"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["HSET", "h", "a", "9", "c", "3"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["HGET", "h", "a"]), eq(&Reply::Bulk(b"9".to_vec())));
        assert_that!(exec(&db, &["HLEN", "h"]), eq(&Reply::Integer(3)));
    }

    #[rstest]
    fn hsetnx_preserves_existing_field() {
        let db = test_db();
        assert_that!(exec(&db, &["HSETNX", "h", "f", "1"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["HSETNX", "h", "f", "2"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["HGET", "h", "f"]), eq(&Reply::Bulk(b"1".to_vec())));
    }

    #[rstest]
    fn hdel_removes_key_when_last_field_goes() {
        let db = test_db();
        let _ = exec(&db, &["HSET", "h", "a", "1", "b", "2"]);
        assert_that!(exec(&db, &["HDEL", "h", "a", "ghost"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["HDEL", "h", "b"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["EXISTS", "h"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn hmget_mixes_hits_and_misses() {
        let db = test_db();
        let _ = exec(&db, &["HSET", "h", "a", "1"]);
        assert_that!(
            exec(&db, &["HMGET", "h", "a", "nope"]),
            eq(&Reply::Array(vec![Reply::Bulk(b"1".to_vec()), Reply::NullBulk]))
        );
        assert_that!(
            exec(&db, &["HMGET", "ghost", "a"]),
            eq(&Reply::Array(vec![Reply::NullBulk]))
        );
    }

    #[rstest]
    fn hincrby_creates_and_validates() {
        let db = test_db();
        assert_that!(exec(&db, &["HINCRBY", "h", "n", "5"]), eq(&Reply::Integer(5)));
        assert_that!(exec(&db, &["HINCRBY", "h", "n", "-2"]), eq(&Reply::Integer(3)));
        let _ = exec(&db, &["HSET", "h", "s", "abc"]);
        assert_that!(exec(&db, &["HINCRBY", "h", "s", "1"]).is_error(), eq(true));
    }

    #[rstest]
    fn hash_op_on_string_is_wrong_type() {
        let db = test_db();
        let _ = exec(&db, &["SET", "k", "v"]);
        assert_that!(exec(&db, &["HSET", "k", "f", "v"]).is_error(), eq(true));
        assert_that!(exec(&db, &["HGETALL", "k"]).is_error(), eq(true));
    }

    #[rstest]
    fn hgetall_flattens_pairs() {
        let db = test_db();
        let _ = exec(&db, &["HSET", "h", "a", "1"]);
        let Reply::Array(flat) = exec(&db, &["HGETALL", "h"]) else {
            panic!("HGETALL must reply with an array");
        };
        assert_that!(flat.len(), eq(2_usize));
    }
}
