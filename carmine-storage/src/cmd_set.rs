//! Set commands.

use rand::Rng;
use rand::seq::SliceRandom;

use carmine_resp::{CmdLine, Reply};

use crate::args::{key_of, parse_int};
use crate::command::{
    CommandSpec, CommandTable, read_all_keys, read_first_key, write_dest_read_sources,
    write_first_key,
};
use crate::db::{Db, Locks};
use crate::entity::{Entity, SetValue};
use crate::rollback::{rollback_first_key, rollback_set_members};

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "SADD",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_sadd,
            undo: Some(undo_members),
        },
        CommandSpec {
            name: "SREM",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_srem,
            undo: Some(undo_members),
        },
        CommandSpec {
            name: "SPOP",
            arity: 2,
            prepare: Some(write_first_key),
            execute: exec_spop,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "SISMEMBER",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_sismember,
            undo: None,
        },
        CommandSpec {
            name: "SCARD",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_scard,
            undo: None,
        },
        CommandSpec {
            name: "SMEMBERS",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_smembers,
            undo: None,
        },
        CommandSpec {
            name: "SRANDMEMBER",
            arity: -2,
            prepare: Some(read_first_key),
            execute: exec_srandmember,
            undo: None,
        },
        CommandSpec {
            name: "SINTER",
            arity: -2,
            prepare: Some(read_all_keys),
            execute: exec_sinter,
            undo: None,
        },
        CommandSpec {
            name: "SUNION",
            arity: -2,
            prepare: Some(read_all_keys),
            execute: exec_sunion,
            undo: None,
        },
        CommandSpec {
            name: "SDIFF",
            arity: -2,
            prepare: Some(read_all_keys),
            execute: exec_sdiff,
            undo: None,
        },
        CommandSpec {
            name: "SINTERSTORE",
            arity: -3,
            prepare: Some(write_dest_read_sources),
            execute: exec_sinterstore,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "SUNIONSTORE",
            arity: -3,
            prepare: Some(write_dest_read_sources),
            execute: exec_sunionstore,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "SDIFFSTORE",
            arity: -3,
            prepare: Some(write_dest_read_sources),
            execute: exec_sdiffstore,
            undo: Some(rollback_first_key),
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

fn exec_sadd(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let cap = db.config().set_intset_cap;
    let set = match db.set_or_create(locks, &key) {
        Ok(set) => set,
        Err(reply) => return reply,
    };
    let mut added = 0;
    for member in &args[1..] {
        if set.add(member, cap) {
            added += 1;
        }
    }
    if added > 0 {
        db.append(Db::to_cmd("SADD", args));
    }
    Reply::Integer(added)
}

fn exec_srem(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let set = match db.set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(set)) => set,
    };
    let mut removed = 0;
    for member in &args[1..] {
        if set.remove(member) {
            removed += 1;
        }
    }
    let emptied = set.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("SREM", args));
    }
    Reply::Integer(removed)
}

fn exec_spop(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let set = match db.set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::NullBulk,
        Ok(Some(set)) => set,
    };
    let members = set.members();
    let Some(victim) = members
        .get(rand::thread_rng().gen_range(0..members.len().max(1)))
        .cloned()
    else {
        return Reply::NullBulk;
    };
    let _ = set.remove(&victim);
    let emptied = set.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    db.append(vec![b"SREM".to_vec(), args[0].clone(), victim.clone()]);
    Reply::Bulk(victim)
}

fn exec_sismember(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(set)) => Reply::Integer(i64::from(set.contains(&args[1]))),
    }
}

fn exec_scard(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(set)) => Reply::Integer(i64::try_from(set.len()).unwrap_or(i64::MAX)),
    }
}

fn exec_smembers(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Array(Vec::new()),
        Ok(Some(set)) => Reply::multi_bulk(set.members()),
    }
}

fn exec_srandmember(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let count = match args.get(1) {
        None => None,
        Some(raw) => match parse_int(raw) {
            Ok(count) => Some(count),
            Err(()) => return Reply::not_integer_err(),
        },
    };
    let members = match db.set(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => Vec::new(),
        Ok(Some(set)) => set.members(),
    };

    let mut rng = rand::thread_rng();
    match count {
        None => match members.choose(&mut rng) {
            Some(member) => Reply::Bulk(member.clone()),
            None => Reply::NullBulk,
        },
        Some(count) if count >= 0 => {
            #[allow(clippy::cast_sign_loss)]
            let want = (count as usize).min(members.len());
            let sample: CmdLine = members
                .choose_multiple(&mut rng, want)
                .cloned()
                .collect();
            Reply::multi_bulk(sample)
        }
        Some(count) => {
            // Negative count samples with replacement.
            let want = count.unsigned_abs() as usize;
            if members.is_empty() {
                return Reply::Array(Vec::new());
            }
            let sample: CmdLine = (0..want)
                .filter_map(|_| members.choose(&mut rng).cloned())
                .collect();
            Reply::multi_bulk(sample)
        }
    }
}

fn gather_sets<'a>(
    db: &Db,
    locks: &'a Locks,
    keys: &[Vec<u8>],
) -> Result<Vec<Option<&'a SetValue>>, Reply> {
    keys.iter()
        .map(|raw| db.set(locks, &key_of(raw)))
        .collect()
}

fn intersect(sets: &[Option<&SetValue>]) -> Vec<Vec<u8>> {
    let Some(first) = sets.first() else {
        return Vec::new();
    };
    let Some(first) = first else {
        return Vec::new();
    };
    first
        .members()
        .into_iter()
        .filter(|member| {
            sets[1..]
                .iter()
                .all(|set| set.is_some_and(|set| set.contains(member)))
        })
        .collect()
}

fn union(sets: &[Option<&SetValue>]) -> Vec<Vec<u8>> {
    let mut merged = hashbrown::HashSet::new();
    for set in sets.iter().flatten() {
        for member in set.members() {
            let _ = merged.insert(member);
        }
    }
    merged.into_iter().collect()
}

fn difference(sets: &[Option<&SetValue>]) -> Vec<Vec<u8>> {
    let Some(first) = sets.first() else {
        return Vec::new();
    };
    let Some(first) = first else {
        return Vec::new();
    };
    first
        .members()
        .into_iter()
        .filter(|member| {
            !sets[1..]
                .iter()
                .any(|set| set.is_some_and(|set| set.contains(member)))
        })
        .collect()
}

fn calculate(
    db: &Db,
    locks: &mut Locks,
    keys: &[Vec<u8>],
    combine: fn(&[Option<&SetValue>]) -> Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, Reply> {
    let sets = gather_sets(db, locks, keys)?;
    Ok(combine(&sets))
}

fn exec_sinter(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match calculate(db, locks, args, intersect) {
        Ok(members) => Reply::multi_bulk(members),
        Err(reply) => reply,
    }
}

fn exec_sunion(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match calculate(db, locks, args, union) {
        Ok(members) => Reply::multi_bulk(members),
        Err(reply) => reply,
    }
}

fn exec_sdiff(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match calculate(db, locks, args, difference) {
        Ok(members) => Reply::multi_bulk(members),
        Err(reply) => reply,
    }
}

fn store(
    db: &Db,
    locks: &mut Locks,
    args: &[Vec<u8>],
    name: &str,
    combine: fn(&[Option<&SetValue>]) -> Vec<Vec<u8>>,
) -> Reply {
    let dest = key_of(&args[0]);
    let members = match calculate(db, locks, &args[1..], combine) {
        Ok(members) => members,
        Err(reply) => return reply,
    };
    let _ = db.remove_entity(locks, &dest);
    let count = members.len();
    if count > 0 {
        let cap = db.config().set_intset_cap;
        let mut set = SetValue::new();
        for member in &members {
            let _ = set.add(member, cap);
        }
        let _ = db.put_entity(locks, &dest, Entity::Set(set));
        db.append(Db::to_cmd(name, args));
    } else {
        db.append(vec![b"DEL".to_vec(), args[0].clone()]);
    }
    Reply::Integer(i64::try_from(count).unwrap_or(i64::MAX))
}

fn exec_sinterstore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    store(db, locks, args, "SINTERSTORE", intersect)
}

fn exec_sunionstore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    store(db, locks, args, "SUNIONSTORE", union)
}

fn exec_sdiffstore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    store(db, locks, args, "SDIFFSTORE", difference)
}

fn undo_members(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_set_members(db, locks, &key, &args[1..])
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

    fn sorted_texts(reply: Reply) -> Vec<String> {
        let Reply::Array(items) = reply else {
            panic!("expected array reply");
        };
        let mut texts: Vec<String> = items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                other => panic!("expected bulk item, got {other:?}"),
            })
            .collect();
        texts.sort();
        texts
    }

    #[rstest]
    fn sadd_counts_new_members() {
        let db = test_db();
        assert_that!(exec(&db, &["SADD", "s", "a", "b"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["SADD", "s", "b", "c"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["SCARD", "s"]), eq(&Reply::Integer(3)));
        assert_that!(exec(&db, &["SISMEMBER", "s", "a"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["SISMEMBER", "s", "z"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn srem_drops_key_when_emptied() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "s", "a"]);
        assert_that!(exec(&db, &["SREM", "s", "a", "ghost"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["EXISTS", "s"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn integer_members_stay_packed_until_text_arrives() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "s", "1", "2", "3"]);
        let Reply::Array(members) = exec(&db, &["SMEMBERS", "s"]) else {
            panic!("SMEMBERS must reply with an array");
        };
        assert_that!(members.len(), eq(3_usize));
        let _ = exec(&db, &["SADD", "s", "word"]);
        assert_that!(exec(&db, &["SISMEMBER", "s", "1"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["SISMEMBER", "s", "word"]), eq(&Reply::Integer(1)));
    }

    #[rstest]
    fn set_algebra_matches_reference() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "a", "1", "2", "3"]);
        let _ = exec(&db, &["SADD", "b", "2", "3", "4"]);
        assert_that!(
            sorted_texts(exec(&db, &["SINTER", "a", "b"])),
            eq(&vec!["2".to_owned(), "3".to_owned()])
        );
        assert_that!(
            sorted_texts(exec(&db, &["SUNION", "a", "b"])),
            eq(&vec!["1".to_owned(), "2".to_owned(), "3".to_owned(), "4".to_owned()])
        );
        assert_that!(
            sorted_texts(exec(&db, &["SDIFF", "a", "b"])),
            eq(&vec!["1".to_owned()])
        );
        // Intersecting with a missing key is empty.
        assert_that!(sorted_texts(exec(&db, &["SINTER", "a", "ghost"])).len(), eq(0_usize));
    }

    #[rstest]
    fn store_variants_write_destination() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "a", "1", "2"]);
        let _ = exec(&db, &["SADD", "b", "2", "3"]);
        assert_that!(exec(&db, &["SINTERSTORE", "dest", "a", "b"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["SISMEMBER", "dest", "2"]), eq(&Reply::Integer(1)));
        // An empty result removes the destination.
        assert_that!(exec(&db, &["SINTERSTORE", "dest", "a", "ghost"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["EXISTS", "dest"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn spop_removes_a_member() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "s", "a", "b", "c"]);
        let Reply::Bulk(_) = exec(&db, &["SPOP", "s"]) else {
            panic!("SPOP must reply with a member");
        };
        assert_that!(exec(&db, &["SCARD", "s"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["SPOP", "ghost"]), eq(&Reply::NullBulk));
    }

    #[rstest]
    fn srandmember_respects_count_sign() {
        let db = test_db();
        let _ = exec(&db, &["SADD", "s", "a", "b", "c"]);
        let Reply::Array(distinct) = exec(&db, &["SRANDMEMBER", "s", "10"]) else {
            panic!("expected array");
        };
        assert_that!(distinct.len(), eq(3_usize));
        let Reply::Array(repeated) = exec(&db, &["SRANDMEMBER", "s", "-5"]) else {
            panic!("expected array");
        };
        assert_that!(repeated.len(), eq(5_usize));
    }
}
