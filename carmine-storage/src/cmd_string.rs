//! String commands.

use std::time::{Duration, SystemTime};

use carmine_resp::Reply;

use crate::args::{format_score, key_of, parse_float, parse_int};
use crate::command::{
    CommandSpec, CommandTable, read_all_keys, read_first_key, write_even_keys, write_first_key,
};
use crate::db::{Db, Locks};
use crate::entity::{Entity, StrValue};
use crate::marshal::expiry_to_cmd;
use crate::rollback::{rollback_all_keys, rollback_first_key};

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "SET",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_set,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "SETNX",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_setnx,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "SETEX",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_setex,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "PSETEX",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_psetex,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "GET",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_get,
            undo: None,
        },
        CommandSpec {
            name: "GETSET",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_getset,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "GETDEL",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_getdel,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "STRLEN",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_strlen,
            undo: None,
        },
        CommandSpec {
            name: "INCR",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_incr,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "INCRBY",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_incrby,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "DECR",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_decr,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "DECRBY",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_decrby,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "INCRBYFLOAT",
            arity: 3,
            prepare: Some(write_first_key),
            execute: exec_incrbyfloat,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "MSET",
            arity: -3,
            prepare: Some(write_even_keys),
            execute: exec_mset,
            undo: Some(rollback_mset),
        },
        CommandSpec {
            name: "MSETNX",
            arity: -3,
            prepare: Some(write_even_keys),
            execute: exec_msetnx,
            undo: Some(rollback_mset),
        },
        CommandSpec {
            name: "MGET",
            arity: -2,
            prepare: Some(read_all_keys),
            execute: exec_mget,
            undo: None,
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetCondition {
    Always,
    IfAbsent,
    IfExists,
}

struct SetOptions {
    condition: SetCondition,
    expire_in: Option<Duration>,
    keep_ttl: bool,
}

fn parse_set_options(tokens: &[Vec<u8>]) -> Result<SetOptions, Reply> {
    let mut options = SetOptions {
        condition: SetCondition::Always,
        expire_in: None,
        keep_ttl: false,
    };
    let mut cursor = 0;
    while cursor < tokens.len() {
        let token = String::from_utf8_lossy(&tokens[cursor]).to_ascii_uppercase();
        match token.as_str() {
            "NX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfAbsent;
            }
            "XX" if options.condition == SetCondition::Always => {
                options.condition = SetCondition::IfExists;
            }
            "KEEPTTL" if options.expire_in.is_none() => options.keep_ttl = true,
            "EX" | "PX" if options.expire_in.is_none() && !options.keep_ttl => {
                cursor += 1;
                let Some(raw) = tokens.get(cursor) else {
                    return Err(Reply::syntax_err());
                };
                let Ok(amount) = parse_int(raw) else {
                    return Err(Reply::not_integer_err());
                };
                if amount <= 0 {
                    return Err(Reply::err("invalid expire time in 'set' command"));
                }
                #[allow(clippy::cast_sign_loss)]
                let amount = amount as u64;
                options.expire_in = Some(if token == "EX" {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                });
            }
            _ => return Err(Reply::syntax_err()),
        }
        cursor += 1;
    }
    Ok(options)
}

fn exec_set(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let options = match parse_set_options(&args[2..]) {
        Ok(options) => options,
        Err(reply) => return reply,
    };

    let exists = db.entity_mut(locks, &key).is_some();
    match options.condition {
        SetCondition::IfAbsent if exists => return Reply::NullBulk,
        SetCondition::IfExists if !exists => return Reply::NullBulk,
        _ => {}
    }

    let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(args[1].clone())));
    db.append(Db::to_cmd("SET", &args[..2]));
    if let Some(expire_in) = options.expire_in {
        let deadline = SystemTime::now() + expire_in;
        db.expire_at(&key, deadline);
        db.append(expiry_to_cmd(&key, deadline));
    } else if !options.keep_ttl && db.persist(&key) {
        db.append(vec![b"PERSIST".to_vec(), args[0].clone()]);
    }
    Reply::ok()
}

fn exec_setnx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    if db.entity_mut(locks, &key).is_some() {
        return Reply::Integer(0);
    }
    let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(args[1].clone())));
    db.append(Db::to_cmd("SETNX", args));
    Reply::Integer(1)
}

fn set_with_expiry(db: &Db, locks: &mut Locks, args: &[Vec<u8>], unit_millis: u64) -> Reply {
    let key = key_of(&args[0]);
    let Ok(amount) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    if amount <= 0 {
        return Reply::err("invalid expire time");
    }
    #[allow(clippy::cast_sign_loss)]
    let millis = (amount as u64).saturating_mul(unit_millis);
    let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(args[2].clone())));
    let deadline = SystemTime::now() + Duration::from_millis(millis);
    db.expire_at(&key, deadline);
    db.append(vec![b"SET".to_vec(), args[0].clone(), args[2].clone()]);
    db.append(expiry_to_cmd(&key, deadline));
    Reply::ok()
}

fn exec_setex(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    set_with_expiry(db, locks, args, 1_000)
}

fn exec_psetex(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    set_with_expiry(db, locks, args, 1)
}

fn exec_get(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.str_value(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::NullBulk,
        Ok(Some(value)) => Reply::Bulk(value.to_bytes()),
    }
}

fn exec_getset(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let previous = match db.str_value(locks, &key) {
        Err(reply) => return reply,
        Ok(value) => value.map(StrValue::to_bytes),
    };
    let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(args[1].clone())));
    let _ = db.persist(&key);
    db.append(Db::to_cmd("SET", args));
    match previous {
        Some(bytes) => Reply::Bulk(bytes),
        None => Reply::NullBulk,
    }
}

fn exec_getdel(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.str_value(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::NullBulk,
        Ok(Some(_)) => {}
    }
    let removed = db.remove_entity(locks, &key);
    db.append(vec![b"DEL".to_vec(), args[0].clone()]);
    match removed {
        Some(Entity::Str(value)) => Reply::Bulk(value.to_bytes()),
        _ => Reply::NullBulk,
    }
}

fn exec_strlen(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.str_value(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(value)) => Reply::Integer(i64::try_from(value.len()).unwrap_or(i64::MAX)),
    }
}

fn incr_by(db: &Db, locks: &mut Locks, args: &[Vec<u8>], delta: i64) -> Reply {
    let key = key_of(&args[0]);
    let current = match db.str_value(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => 0,
        Ok(Some(value)) => match value.as_int() {
            Some(current) => current,
            None => return Reply::not_integer_err(),
        },
    };
    let Some(next) = current.checked_add(delta) else {
        return Reply::err("increment or decrement would overflow");
    };
    let _ = db.put_entity(locks, &key, Entity::Str(StrValue::Int(next)));
    db.append(vec![
        b"SET".to_vec(),
        args[0].clone(),
        next.to_string().into_bytes(),
    ]);
    Reply::Integer(next)
}

fn exec_incr(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    incr_by(db, locks, args, 1)
}

fn exec_decr(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    incr_by(db, locks, args, -1)
}

fn exec_incrby(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match parse_int(&args[1]) {
        Ok(delta) => incr_by(db, locks, args, delta),
        Err(()) => Reply::not_integer_err(),
    }
}

fn exec_decrby(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match parse_int(&args[1]) {
        Ok(delta) => match delta.checked_neg() {
            Some(delta) => incr_by(db, locks, args, delta),
            None => Reply::err("decrement would overflow"),
        },
        Err(()) => Reply::not_integer_err(),
    }
}

fn exec_incrbyfloat(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(delta) = parse_float(&args[1]) else {
        return Reply::not_float_err();
    };
    let current = match db.str_value(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => 0.0,
        Ok(Some(value)) => match parse_float(&value.to_bytes()) {
            Ok(current) => current,
            Err(()) => return Reply::not_float_err(),
        },
    };
    let next = current + delta;
    if !next.is_finite() {
        return Reply::err("increment would produce NaN or Infinity");
    }
    let formatted = format_score(next);
    let _ = db.put_entity(
        locks,
        &key,
        Entity::Str(StrValue::from_bytes(formatted.clone().into_bytes())),
    );
    db.append(vec![
        b"SET".to_vec(),
        args[0].clone(),
        formatted.clone().into_bytes(),
    ]);
    Reply::Bulk(formatted.into_bytes())
}

fn exec_mset(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    if !args.len().is_multiple_of(2) {
        return Reply::arg_num_err("MSET");
    }
    for pair in args.chunks_exact(2) {
        let key = key_of(&pair[0]);
        let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(pair[1].clone())));
        let _ = db.persist(&key);
    }
    db.append(Db::to_cmd("MSET", args));
    Reply::ok()
}

fn exec_msetnx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    if !args.len().is_multiple_of(2) {
        return Reply::arg_num_err("MSETNX");
    }
    for pair in args.chunks_exact(2) {
        let key = key_of(&pair[0]);
        if db.exists(locks, &key) {
            return Reply::Integer(0);
        }
    }
    for pair in args.chunks_exact(2) {
        let key = key_of(&pair[0]);
        let _ = db.put_entity(locks, &key, Entity::Str(StrValue::from_bytes(pair[1].clone())));
    }
    db.append(Db::to_cmd("MSETNX", args));
    Reply::Integer(1)
}

fn exec_mget(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let mut values = Vec::with_capacity(args.len());
    for raw in args {
        let key = key_of(raw);
        let value = match db.str_value(locks, &key) {
            Ok(Some(value)) => Reply::Bulk(value.to_bytes()),
            // Wrong-typed and missing keys both read as null here.
            Ok(None) | Err(_) => Reply::NullBulk,
        };
        values.push(value);
    }
    Reply::Array(values)
}

fn rollback_mset(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<carmine_resp::CmdLine> {
    let keys: Vec<Vec<u8>> = args.chunks_exact(2).map(|pair| pair[0].clone()).collect();
    rollback_all_keys(db, locks, &keys)
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
    fn incr_counts_and_rejects_non_integers() {
        let db = test_db();
        assert_that!(exec(&db, &["INCR", "n"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["INCRBY", "n", "10"]), eq(&Reply::Integer(11)));
        assert_that!(exec(&db, &["DECR", "n"]), eq(&Reply::Integer(10)));

        let _ = exec(&db, &["SET", "k", "abc"]);
        assert_that!(
            exec(&db, &["INCR", "k"]),
            eq(&Reply::err("value is not an integer or out of range"))
        );
    }

    #[rstest]
    fn incr_overflow_is_detected() {
        let db = test_db();
        let _ = exec(&db, &["SET", "n", &i64::MAX.to_string()]);
        assert_that!(exec(&db, &["INCR", "n"]).is_error(), eq(true));
    }

    #[rstest]
    fn set_nx_and_xx_conditions() {
        let db = test_db();
        assert_that!(exec(&db, &["SET", "k", "1", "NX"]), eq(&Reply::ok()));
        assert_that!(exec(&db, &["SET", "k", "2", "NX"]), eq(&Reply::NullBulk));
        assert_that!(exec(&db, &["SET", "k", "3", "XX"]), eq(&Reply::ok()));
        assert_that!(exec(&db, &["SET", "other", "1", "XX"]), eq(&Reply::NullBulk));
        assert_that!(exec(&db, &["GET", "k"]), eq(&Reply::Bulk(b"3".to_vec())));
    }

    #[rstest]
    fn set_rejects_bad_option_tokens() {
        let db = test_db();
        assert_that!(exec(&db, &["SET", "k", "v", "BOGUS"]).is_error(), eq(true));
        assert_that!(exec(&db, &["SET", "k", "v", "EX"]).is_error(), eq(true));
        assert_that!(exec(&db, &["SET", "k", "v", "EX", "0"]).is_error(), eq(true));
    }

    #[rstest]
    fn set_clears_ttl_unless_keepttl() {
        let db = test_db();
        let _ = exec(&db, &["SET", "k", "v", "EX", "100"]);
        assert_that!(db.expiry_of("k").is_some(), eq(true));
        let _ = exec(&db, &["SET", "k", "v2"]);
        assert_that!(db.expiry_of("k").is_none(), eq(true));

        let _ = exec(&db, &["SET", "k", "v3", "EX", "100"]);
        let _ = exec(&db, &["SET", "k", "v4", "KEEPTTL"]);
        assert_that!(db.expiry_of("k").is_some(), eq(true));
    }

    #[rstest]
    fn getset_returns_previous_value() {
        let db = test_db();
        assert_that!(exec(&db, &["GETSET", "k", "a"]), eq(&Reply::NullBulk));
        assert_that!(exec(&db, &["GETSET", "k", "b"]), eq(&Reply::Bulk(b"a".to_vec())));
    }

    #[rstest]
    fn msetnx_is_all_or_nothing() {
        let db = test_db();
        let _ = exec(&db, &["SET", "b", "old"]);
        assert_that!(
            exec(&db, &["MSETNX", "a", "1", "b", "2"]),
            eq(&Reply::Integer(0))
        );
        assert_that!(exec(&db, &["GET", "a"]), eq(&Reply::NullBulk));
        assert_that!(
            exec(&db, &["MSETNX", "a", "1", "c", "2"]),
            eq(&Reply::Integer(1))
        );
        assert_that!(exec(&db, &["GET", "a"]), eq(&Reply::Bulk(b"1".to_vec())));
    }

    #[rstest]
    fn mget_nulls_for_missing_and_wrong_type() {
        let db = test_db();
        let _ = exec(&db, &["SET", "a", "1"]);
        let _ = exec(&db, &["LPUSH", "l", "x"]);
        assert_that!(
            exec(&db, &["MGET", "a", "missing", "l"]),
            eq(&Reply::Array(vec![
                Reply::Bulk(b"1".to_vec()),
                Reply::NullBulk,
                Reply::NullBulk
            ]))
        );
    }

    #[rstest]
    fn incrbyfloat_formats_like_reference() {
        let db = test_db();
        assert_that!(
            exec(&db, &["INCRBYFLOAT", "f", "2.5"]),
            eq(&Reply::Bulk(b"2.5".to_vec()))
        );
        assert_that!(
            exec(&db, &["INCRBYFLOAT", "f", "0.5"]),
            eq(&Reply::Bulk(b"3".to_vec()))
        );
    }
}
