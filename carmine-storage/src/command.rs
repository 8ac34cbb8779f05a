//! Static command table.
//!
//! Every command is a record of `{arity, prepare, execute, undo}`:
//! `prepare` is a pure function declaring the key footprint (it never
//! touches the DB), `execute` runs under the lock set that footprint
//! produced, and `undo` — captured *before* execute — yields argv vectors
//! that restore the declared write keys when replayed in reverse.
//! Commands without `prepare` are connection-level and cannot be queued
//! inside `MULTI`.

use std::sync::OnceLock;

use hashbrown::HashMap;

use carmine_resp::{CmdLine, Reply};

use crate::args::key_of;
use crate::db::{Db, Locks};

/// Pure key-footprint function: `args -> (write_keys, read_keys)`.
pub type PrepareFn = fn(&[Vec<u8>]) -> (Vec<String>, Vec<String>);
/// Command body, run under the prepared lock set.
pub type ExecFn = fn(&Db, &mut Locks, &[Vec<u8>]) -> Reply;
/// Undo-log builder, run under the same locks before the body.
pub type UndoFn = fn(&Db, &Locks, &[Vec<u8>]) -> Vec<CmdLine>;

/// One command table entry.
pub struct CommandSpec {
    /// Canonical uppercase name.
    pub name: &'static str,
    /// Arity including the command name; negative means "at least".
    pub arity: i32,
    /// Key footprint declaration; `None` bars the command from `MULTI`.
    pub prepare: Option<PrepareFn>,
    /// Command body.
    pub execute: ExecFn,
    /// Undo-log builder for write commands.
    pub undo: Option<UndoFn>,
}

/// Command registry handed to each module's `register` function.
pub type CommandTable = HashMap<&'static str, CommandSpec>;

static TABLE: OnceLock<CommandTable> = OnceLock::new();

/// Returns the process-wide command table.
pub fn command_table() -> &'static CommandTable {
    TABLE.get_or_init(|| {
        let mut table = CommandTable::new();
        crate::cmd_keys::register(&mut table);
        crate::cmd_string::register(&mut table);
        crate::cmd_list::register(&mut table);
        crate::cmd_hash::register(&mut table);
        crate::cmd_set::register(&mut table);
        crate::cmd_zset::register(&mut table);
        register_connection_commands(&mut table);
        table
    })
}

fn register_connection_commands(table: &mut CommandTable) {
    table.insert(
        "PING",
        CommandSpec {
            name: "PING",
            arity: -1,
            prepare: None,
            execute: exec_ping,
            undo: None,
        },
    );
    table.insert(
        "ECHO",
        CommandSpec {
            name: "ECHO",
            arity: 2,
            prepare: None,
            execute: exec_echo,
            undo: None,
        },
    );
}

fn exec_ping(_db: &Db, _locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    match args.first() {
        None => Reply::pong(),
        Some(message) if args.len() == 1 => Reply::Bulk(message.clone()),
        Some(_) => Reply::arg_num_err("PING"),
    }
}

fn exec_echo(_db: &Db, _locks: &mut Locks, args: &[Vec<u8>]) -> Reply {
    Reply::Bulk(args[0].clone())
}

/// Looks up a command by wire name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    command_table().get(name.to_ascii_uppercase().as_str())
}

/// Checks argv length (including the command name) against an arity.
#[must_use]
pub fn arity_matches(arity: i32, argv_len: usize) -> bool {
    let Ok(len) = i32::try_from(argv_len) else {
        return false;
    };
    if arity >= 0 { len == arity } else { len >= -arity }
}

/// Returns the key footprint of a full argv, `(write_keys, read_keys)`.
///
/// Unknown commands and commands without a footprint declare nothing.
#[must_use]
pub fn related_keys(cmd: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    let Some(first) = cmd.first() else {
        return (Vec::new(), Vec::new());
    };
    let name = String::from_utf8_lossy(first).to_ascii_uppercase();
    match command_table().get(name.as_str()).and_then(|spec| spec.prepare) {
        Some(prepare) => prepare(&cmd[1..]),
        None => (Vec::new(), Vec::new()),
    }
}

// Shared footprint declarations, named after their locking shape.

pub(crate) fn write_first_key(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0])], Vec::new())
}

pub(crate) fn write_all_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(|arg| key_of(arg)).collect(), Vec::new())
}

pub(crate) fn read_first_key(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![key_of(&args[0])])
}

pub(crate) fn read_all_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(|arg| key_of(arg)).collect())
}

/// `MSET`-shaped footprint: every even argument is a write key.
pub(crate) fn write_even_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    let keys = args
        .chunks_exact(2)
        .map(|pair| key_of(&pair[0]))
        .collect();
    (keys, Vec::new())
}

/// `RENAME`-shaped footprint: both source and destination are writes.
pub(crate) fn write_two_keys(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0]), key_of(&args[1])], Vec::new())
}

/// Store-command footprint: destination written, sources read.
pub(crate) fn write_dest_read_sources(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (
        vec![key_of(&args[0])],
        args[1..].iter().map(|arg| key_of(arg)).collect(),
    )
}
