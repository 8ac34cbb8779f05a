//! Sorted-set commands.

use carmine_datastruct::ScoreBorder;
use carmine_resp::{CmdLine, Reply};

use crate::args::{format_score, key_of, normalize_range, parse_float, parse_int};
use crate::command::{CommandSpec, CommandTable, read_first_key, write_first_key};
use crate::db::{Db, Locks};
use crate::rollback::{rollback_first_key, rollback_zset_members};

pub(crate) fn register(table: &mut CommandTable) {
    let entries = [
        CommandSpec {
            name: "ZADD",
            arity: -4,
            prepare: Some(write_first_key),
            execute: exec_zadd,
            undo: Some(undo_zadd),
        },
        CommandSpec {
            name: "ZSCORE",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_zscore,
            undo: None,
        },
        CommandSpec {
            name: "ZINCRBY",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_zincrby,
            undo: Some(undo_zincrby),
        },
        CommandSpec {
            name: "ZCARD",
            arity: 2,
            prepare: Some(read_first_key),
            execute: exec_zcard,
            undo: None,
        },
        CommandSpec {
            name: "ZCOUNT",
            arity: 4,
            prepare: Some(read_first_key),
            execute: exec_zcount,
            undo: None,
        },
        CommandSpec {
            name: "ZRANK",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_zrank,
            undo: None,
        },
        CommandSpec {
            name: "ZREVRANK",
            arity: 3,
            prepare: Some(read_first_key),
            execute: exec_zrevrank,
            undo: None,
        },
        CommandSpec {
            name: "ZRANGE",
            arity: -4,
            prepare: Some(read_first_key),
            execute: exec_zrange,
            undo: None,
        },
        CommandSpec {
            name: "ZREVRANGE",
            arity: -4,
            prepare: Some(read_first_key),
            execute: exec_zrevrange,
            undo: None,
        },
        CommandSpec {
            name: "ZRANGEBYSCORE",
            arity: -4,
            prepare: Some(read_first_key),
            execute: exec_zrangebyscore,
            undo: None,
        },
        CommandSpec {
            name: "ZREVRANGEBYSCORE",
            arity: -4,
            prepare: Some(read_first_key),
            execute: exec_zrevrangebyscore,
            undo: None,
        },
        CommandSpec {
            name: "ZPOPMIN",
            arity: -2,
            prepare: Some(write_first_key),
            execute: exec_zpopmin,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "ZPOPMAX",
            arity: -2,
            prepare: Some(write_first_key),
            execute: exec_zpopmax,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "ZREM",
            arity: -3,
            prepare: Some(write_first_key),
            execute: exec_zrem,
            undo: Some(undo_zrem),
        },
        CommandSpec {
            name: "ZREMRANGEBYSCORE",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_zremrangebyscore,
            undo: Some(rollback_first_key),
        },
        CommandSpec {
            name: "ZREMRANGEBYRANK",
            arity: 4,
            prepare: Some(write_first_key),
            execute: exec_zremrangebyrank,
            undo: Some(rollback_first_key),
        },
    ];
    for spec in entries {
        table.insert(spec.name, spec);
    }
}

fn score_border(raw: &[u8]) -> Result<ScoreBorder, Reply> {
    ScoreBorder::parse(raw).map_err(|()| Reply::err("min or max is not a float"))
}

fn exec_zadd(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    if !args[1..].len().is_multiple_of(2) {
        return Reply::syntax_err();
    }
    let key = key_of(&args[0]);
    // Validate every score before mutating anything.
    let mut pairs = Vec::with_capacity(args[1..].len() / 2);
    for pair in args[1..].chunks_exact(2) {
        match parse_float(&pair[0]) {
            Ok(score) => pairs.push((score, pair[1].clone())),
            Err(()) => return Reply::not_float_err(),
        }
    }
    let zset = match db.sorted_set_or_create(locks, &key) {
        Ok(zset) => zset,
        Err(reply) => return reply,
    };
    let mut added = 0;
    for (score, member) in pairs {
        if zset.add(member, score) {
            added += 1;
        }
    }
    db.append(Db::to_cmd("ZADD", args));
    Reply::Integer(added)
}

fn exec_zscore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.sorted_set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::NullBulk,
        Ok(Some(zset)) => match zset.score(&args[1]) {
            Some(score) => Reply::Bulk(format_score(score).into_bytes()),
            None => Reply::NullBulk,
        },
    }
}

fn exec_zincrby(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let Ok(delta) = parse_float(&args[1]) else {
        return Reply::not_float_err();
    };
    let zset = match db.sorted_set_or_create(locks, &key) {
        Ok(zset) => zset,
        Err(reply) => return reply,
    };
    let next = zset.score(&args[2]).unwrap_or(0.0) + delta;
    if next.is_nan() {
        return Reply::err("resulting score is not a number (NaN)");
    }
    let _ = zset.add(args[2].clone(), next);
    db.append(Db::to_cmd("ZINCRBY", args));
    Reply::Bulk(format_score(next).into_bytes())
}

fn exec_zcard(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    match db.sorted_set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(zset)) => Reply::Integer(i64::try_from(zset.len()).unwrap_or(i64::MAX)),
    }
}

fn exec_zcount(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let (min, max) = match (score_border(&args[1]), score_border(&args[2])) {
        (Ok(min), Ok(max)) => (min, max),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    match db.sorted_set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::Integer(0),
        Ok(Some(zset)) => {
            Reply::Integer(i64::try_from(zset.count_by_score(&min, &max)).unwrap_or(i64::MAX))
        }
    }
}

fn rank(db: &Db, locks: &mut Locks, args: &[Vec<u8>], desc: bool) -> Reply {
    let key = key_of(&args[0]);
    match db.sorted_set(locks, &key) {
        Err(reply) => reply,
        Ok(None) => Reply::NullBulk,
        Ok(Some(zset)) => match zset.rank(&args[1], desc) {
            Some(rank) => Reply::Integer(i64::try_from(rank).unwrap_or(i64::MAX)),
            None => Reply::NullBulk,
        },
    }
}

fn exec_zrank(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    rank(db, locks, args, false)
}

fn exec_zrevrank(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    rank(db, locks, args, true)
}

fn elements_reply(elements: Vec<carmine_datastruct::Element>, with_scores: bool) -> Reply {
    let mut flat: CmdLine = Vec::with_capacity(elements.len() * 2);
    for element in elements {
        flat.push(element.member);
        if with_scores {
            flat.push(format_score(element.score).into_bytes());
        }
    }
    Reply::multi_bulk(flat)
}

fn parse_withscores(args: &[Vec<u8>]) -> Result<bool, Reply> {
    match args {
        [] => Ok(false),
        [token] if token.eq_ignore_ascii_case(b"WITHSCORES") => Ok(true),
        _ => Err(Reply::syntax_err()),
    }
}

fn range_by_rank(db: &Db, locks: &mut Locks, args: &[Vec<u8>], desc: bool) -> Reply {
    let key = key_of(&args[0]);
    let (Ok(start), Ok(stop)) = (parse_int(&args[1]), parse_int(&args[2])) else {
        return Reply::not_integer_err();
    };
    let with_scores = match parse_withscores(&args[3..]) {
        Ok(with_scores) => with_scores,
        Err(reply) => return reply,
    };
    let zset = match db.sorted_set(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Array(Vec::new()),
        Ok(Some(zset)) => zset,
    };
    match normalize_range(zset.len(), start, stop) {
        None => Reply::Array(Vec::new()),
        Some((begin, end)) => elements_reply(zset.range_by_rank(begin, end, desc), with_scores),
    }
}

fn exec_zrange(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    range_by_rank(db, locks, args, false)
}

fn exec_zrevrange(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    range_by_rank(db, locks, args, true)
}

struct ScoreRangeOptions {
    with_scores: bool,
    offset: usize,
    limit: Option<usize>,
}

fn parse_score_range_options(args: &[Vec<u8>]) -> Result<ScoreRangeOptions, Reply> {
    let mut options = ScoreRangeOptions {
        with_scores: false,
        offset: 0,
        limit: None,
    };
    let mut cursor = 0;
    while cursor < args.len() {
        let token = String::from_utf8_lossy(&args[cursor]).to_ascii_uppercase();
        match token.as_str() {
            "WITHSCORES" => options.with_scores = true,
            "LIMIT" => {
                let (Some(raw_offset), Some(raw_count)) = (args.get(cursor + 1), args.get(cursor + 2))
                else {
                    return Err(Reply::syntax_err());
                };
                let (Ok(offset), Ok(count)) = (parse_int(raw_offset), parse_int(raw_count)) else {
                    return Err(Reply::not_integer_err());
                };
                options.offset = usize::try_from(offset).unwrap_or(0);
                options.limit = if count < 0 {
                    None
                } else {
                    Some(usize::try_from(count).unwrap_or(0))
                };
                cursor += 2;
            }
            _ => return Err(Reply::syntax_err()),
        }
        cursor += 1;
    }
    Ok(options)
}

fn range_by_score(db: &Db, locks: &mut Locks, args: &[Vec<u8>], desc: bool) -> Reply {
    let key = key_of(&args[0]);
    // ZREVRANGEBYSCORE takes (max, min); the ascending form takes (min, max).
    let (raw_min, raw_max) = if desc {
        (&args[2], &args[1])
    } else {
        (&args[1], &args[2])
    };
    let (min, max) = match (score_border(raw_min), score_border(raw_max)) {
        (Ok(min), Ok(max)) => (min, max),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    let options = match parse_score_range_options(&args[3..]) {
        Ok(options) => options,
        Err(reply) => return reply,
    };
    let zset = match db.sorted_set(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Array(Vec::new()),
        Ok(Some(zset)) => zset,
    };
    let elements = zset.range_by_score(&min, &max, options.offset, options.limit, desc);
    elements_reply(elements, options.with_scores)
}

fn exec_zrangebyscore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    range_by_score(db, locks, args, false)
}

fn exec_zrevrangebyscore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    range_by_score(db, locks, args, true)
}

fn pop(db: &Db, locks: &mut Locks, args: &[Vec<u8>], max: bool) -> Reply {
    let key = key_of(&args[0]);
    let count = match args.get(1) {
        None => 1,
        Some(raw) => match parse_int(raw) {
            Ok(count) if count >= 0 => usize::try_from(count).unwrap_or(0),
            _ => return Reply::not_integer_err(),
        },
    };
    let zset = match db.sorted_set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Array(Vec::new()),
        Ok(Some(zset)) => zset,
    };
    let popped = if max { zset.pop_max(count) } else { zset.pop_min(count) };
    let emptied = zset.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if !popped.is_empty() {
        let mut line: CmdLine = vec![b"ZREM".to_vec(), args[0].clone()];
        line.extend(popped.iter().map(|element| element.member.clone()));
        db.append(line);
    }
    elements_reply(popped, true)
}

fn exec_zpopmin(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    pop(db, locks, args, false)
}

fn exec_zpopmax(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    pop(db, locks, args, true)
}

fn exec_zrem(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let zset = match db.sorted_set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(zset)) => zset,
    };
    let mut removed = 0;
    for member in &args[1..] {
        if zset.remove(member) {
            removed += 1;
        }
    }
    let emptied = zset.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("ZREM", args));
    }
    Reply::Integer(removed)
}

fn exec_zremrangebyscore(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let (min, max) = match (score_border(&args[1]), score_border(&args[2])) {
        (Ok(min), Ok(max)) => (min, max),
        (Err(reply), _) | (_, Err(reply)) => return reply,
    };
    let zset = match db.sorted_set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(zset)) => zset,
    };
    let removed = zset.remove_range_by_score(&min, &max);
    let emptied = zset.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("ZREMRANGEBYSCORE", args));
    }
    Reply::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
}

fn exec_zremrangebyrank(db: &Db, locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    let key = key_of(&args[0]);
    let (Ok(start), Ok(stop)) = (parse_int(&args[1]), parse_int(&args[2])) else {
        return Reply::not_integer_err();
    };
    let zset = match db.sorted_set_mut(locks, &key) {
        Err(reply) => return reply,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(zset)) => zset,
    };
    let removed = match normalize_range(zset.len(), start, stop) {
        None => 0,
        Some((begin, end)) => zset.remove_range_by_rank(begin, end),
    };
    let emptied = zset.is_empty();
    if emptied {
        let _ = db.remove_entity(locks, &key);
    }
    if removed > 0 {
        db.append(Db::to_cmd("ZREMRANGEBYRANK", args));
    }
    Reply::Integer(i64::try_from(removed).unwrap_or(i64::MAX))
}

fn undo_zadd(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let members: Vec<Vec<u8>> = args[1..].chunks_exact(2).map(|pair| pair[1].clone()).collect();
    rollback_zset_members(db, locks, &key, &members)
}

fn undo_zincrby(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_zset_members(db, locks, &key, std::slice::from_ref(&args[2]))
}

fn undo_zrem(db: &Db, locks: &Locks, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_zset_members(db, locks, &key, &args[1..])
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

    fn bulk_texts(reply: Reply) -> Vec<String> {
        let Reply::Array(items) = reply else {
            panic!("expected array reply");
        };
        items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                other => panic!("expected bulk item, got {other:?}"),
            })
            .collect()
    }

    #[rstest]
    fn zrange_breaks_score_ties_by_member_order() {
        let db = test_db();
        assert_that!(
            exec(&db, &["ZADD", "s", "1", "b", "1", "a", "2", "c"]),
            eq(&Reply::Integer(3))
        );
        assert_that!(
            bulk_texts(exec(&db, &["ZRANGE", "s", "0", "-1"])),
            eq(&vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
    }

    #[rstest]
    fn zadd_updates_scores_without_counting_them() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1", "a"]);
        assert_that!(exec(&db, &["ZADD", "s", "5", "a"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["ZSCORE", "s", "a"]), eq(&Reply::Bulk(b"5".to_vec())));
        assert_that!(exec(&db, &["ZADD", "s", "nan", "b"]).is_error(), eq(true));
    }

    #[rstest]
    fn zrank_both_directions() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1", "a", "2", "b", "3", "c"]);
        assert_that!(exec(&db, &["ZRANK", "s", "a"]), eq(&Reply::Integer(0)));
        assert_that!(exec(&db, &["ZREVRANK", "s", "a"]), eq(&Reply::Integer(2)));
        assert_that!(exec(&db, &["ZRANK", "s", "ghost"]), eq(&Reply::NullBulk));
    }

    #[rstest]
    fn zrangebyscore_with_borders_and_limit() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1", "a", "2", "b", "3", "c", "4", "d"]);
        assert_that!(
            bulk_texts(exec(&db, &["ZRANGEBYSCORE", "s", "(1", "3"])),
            eq(&vec!["b".to_owned(), "c".to_owned()])
        );
        assert_that!(
            bulk_texts(exec(&db, &["ZRANGEBYSCORE", "s", "-inf", "+inf", "LIMIT", "1", "2"])),
            eq(&vec!["b".to_owned(), "c".to_owned()])
        );
        assert_that!(
            bulk_texts(exec(&db, &["ZREVRANGEBYSCORE", "s", "+inf", "2"])),
            eq(&vec!["d".to_owned(), "c".to_owned(), "b".to_owned()])
        );
        assert_that!(exec(&db, &["ZCOUNT", "s", "2", "3"]), eq(&Reply::Integer(2)));
    }

    #[rstest]
    fn zrange_withscores_interleaves() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1.5", "a"]);
        assert_that!(
            bulk_texts(exec(&db, &["ZRANGE", "s", "0", "-1", "WITHSCORES"])),
            eq(&vec!["a".to_owned(), "1.5".to_owned()])
        );
    }

    #[rstest]
    fn zpop_removes_extremes_and_key() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1", "a", "2", "b"]);
        assert_that!(
            bulk_texts(exec(&db, &["ZPOPMIN", "s"])),
            eq(&vec!["a".to_owned(), "1".to_owned()])
        );
        assert_that!(
            bulk_texts(exec(&db, &["ZPOPMAX", "s"])),
            eq(&vec!["b".to_owned(), "2".to_owned()])
        );
        assert_that!(exec(&db, &["EXISTS", "s"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn zrem_and_range_removals() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "1", "a", "2", "b", "3", "c", "4", "d"]);
        assert_that!(exec(&db, &["ZREM", "s", "a", "ghost"]), eq(&Reply::Integer(1)));
        assert_that!(
            exec(&db, &["ZREMRANGEBYSCORE", "s", "2", "3"]),
            eq(&Reply::Integer(2))
        );
        assert_that!(exec(&db, &["ZREMRANGEBYRANK", "s", "0", "0"]), eq(&Reply::Integer(1)));
        assert_that!(exec(&db, &["EXISTS", "s"]), eq(&Reply::Integer(0)));
    }

    #[rstest]
    fn zincrby_accumulates() {
        let db = test_db();
        assert_that!(
            exec(&db, &["ZINCRBY", "s", "2.5", "m"]),
            eq(&Reply::Bulk(b"2.5".to_vec()))
        );
        assert_that!(
            exec(&db, &["ZINCRBY", "s", "0.5", "m"]),
            eq(&Reply::Bulk(b"3".to_vec()))
        );
    }

    #[rstest]
    fn infinite_borders_are_admissible_scores() {
        let db = test_db();
        let _ = exec(&db, &["ZADD", "s", "-inf", "low", "inf", "high"]);
        assert_that!(
            bulk_texts(exec(&db, &["ZRANGE", "s", "0", "-1"])),
            eq(&vec!["low".to_owned(), "high".to_owned()])
        );
        assert_that!(exec(&db, &["ZCOUNT", "s", "-inf", "+inf"]), eq(&Reply::Integer(2)));
    }
}
