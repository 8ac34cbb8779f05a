//! List commands.

use carmine_resp::Reply;

use crate::args::{key_of, normalize_range, parse_int};
use crate::command::{CommandSpec, CommandTable, read_first_key, write_first_key};
use crate::db::{Db, Locks};
use crate::rollback::rollback_first_key;

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "LPUSH",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_lpush,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "LPUSHX",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_lpushx,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "RPUSH",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_rpush,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "RPUSHX",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_rpushx,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "LPOP",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_lpop,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "RPOP",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_rpop,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "LREM",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_lrem,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "LLEN",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_llen,
            undo: None,
        },
        CommandSpec {
            name: "LINDEX",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_lindex,
            undo: None,
        },
        CommandSpec {
            name: "LSET",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_lset,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "LRANGE",
            arity: 4,
            prepare: Some(read_first_key),
            execute: exec_lrange,
            undo: None,
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

fn push(db: &Db, locks: &mut Locks, args: &[Vec<u8>], front: bool, require_existing: bool) -> Reply {
    let key = key_of(&args[0]);
    if require_existing {
        match db.list_mut(locks, &key) {
            Err(reply) => return reply,
            Ok(None) => return Reply::Integer(0),
            Ok(Some(_)) => {}
        }
    }
    let list = match db.list_or_create(locks, &key) {
        Ok(list) => list,
        Err(reply) => return reply,
    };
    for value in &args[1..] {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    let len = list.len();
    let name = match (front, require_existing) {
        (true, false) => "LPUSH",
        (true, true) => "LPUSHX",
        (false, false) => "RPUSH",
        (false, true) => "RPUSHX",
    };
    db.append(Db::to_cmd(name, args));
    Reply::Integer(i64::try_from(len).unwrap_or(i64::MAX))
}

fn exec_lpush(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    push(db, locks, args, true, false)
}

fn exec_lpushx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    push(db, locks, args, true, true)
}

fn exec_rpush(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    push(db, locks, args, false, false)
}

fn exec_rpushx(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    push(db, locks, args, false, true)
}

fn pop(db: &Db, locks: &mut Locks, args: &[Vec<u8>], front: bool) -> Reply {
    let key = key_of(&args[0]);
    let list = match db.list_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::NullBulk,
        Ok(Some(list)) => list,
    };
    let popped = if front { list.pop_front() } else { list.pop_back() };
    let emptied = list.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    match popped {
        Some(value) => {
            db.append(Db::to_cmd(if front { "LPOP" } else { "RPOP" }, args));
            Reply::Bulk(value)
        }
        None => Reply::NullBulk,
    }
}

fn exec_lpop(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    pop(db, locks, args, true)
}

fn exec_rpop(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    pop(db, locks, args, false)
}

fn exec_lrem(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(count) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    let list = match db.list_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(list)) => list,
    };
    let removed = list.remove_occurrences(&args[2], count);
    let emptied = list.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("LREM", args));
    }
    Reply::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
}

fn exec_llen(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.list(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(list)) => Reply::Integer(i64::try_from(list.len()).unwrap_or(i64::MAX)),
    }
}

fn absolute_index(len: usize, index: i64) -> Option<usize> {
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let absolute = if index < 0 { len_i + index } else { index };
    usize::try_from(absolute).ok().filter(|at| *at < len)
}

fn exec_lindex(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(index) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    let list = match db.list(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::NullBulk,
        Ok(Some(list)) => list,
    };
    match absolute_index(list.len(), index).and_then(|at| list.get(at)) {
        Some(value) => Reply::Bulk(value.clone()),
        None => Reply::NullBulk,
    }
}

fn exec_lset(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(index) = parse_int(&args[1]) else {
        return Reply::not_integer_err();
    };
    let list = match db.list_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::err("no such key"),
        Ok(Some(list)) => list,
    };
    match absolute_index(list.len(), index) {
        Some(at) => {
            let _ = list.set(at, args[2].clone());
            db.append(Db::to_cmd("LSET", args));
            Reply::ok()
        }
        None => Reply::err("index out of range"),
    }
}

fn exec_lrange(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let (Ok(start), Ok(stop)) = (parse_int(&args[1]), parse_int(&args[2])) else {
        return Reply::not_integer_err();
    };
    let list = match db.list(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Array(Vec::new()),
        Ok(Some(list)) => list,
    };
    match normalize_range(list.len(), start, stop) {
        None => Reply::Array(Vec::new()),
        Some((begin, end)) => Reply::multi_bulk(list.range(begin, end)),
    }
}
