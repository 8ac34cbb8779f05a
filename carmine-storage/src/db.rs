//! One numbered keyspace.
//!
//! A `Db` holds three parallel striped maps over the same key universe:
//! `data` (key -> entity), `ttl` (key -> absolute expiry instant), and
//! `version` (key -> monotonic counter bumped on successful writes, used
//! by `WATCH`/`EXEC`). The data dict's buckets are the only mutation
//! points; the TTL and version maps use their own self-locking buckets
//! and are only touched while the command's data locks are held.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing::debug;

use carmine_datastruct::{ConcurrentDict, LockSet, QuickList, SortedSet, timewheel};
use carmine_resp::{CmdLine, Reply, Session};

use crate::args::key_of;
use crate::command::{self, CommandSpec};
use crate::entity::{Entity, SetValue, StrValue};
use crate::transaction;

/// Lock footprint over the data dict.
pub type Locks = LockSet<Entity>;

/// Sink receiving `(db_index, argv)` for the append-only file.
pub type AofHook = Box<dyn Fn(usize, CmdLine) + Send + Sync>;

/// Container tuning knobs copied out of the server config.
#[derive(Debug, Clone, Copy)]
pub struct DbConfig {
    /// Stripe-count hint for the dicts.
    pub buckets: usize,
    /// Page capacity for list entities.
    pub list_page_size: usize,
    /// Member cap for the packed integer set encoding.
    pub set_intset_cap: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            buckets: 1 << 16,
            list_page_size: 1 << 9,
            set_intset_cap: 512,
        }
    }
}

/// A single keyspace.
pub struct Db {
    index: usize,
    data: ConcurrentDict<Entity>,
    ttl: ConcurrentDict<SystemTime>,
    version: ConcurrentDict<u32>,
    config: DbConfig,
    aof: Arc<OnceLock<AofHook>>,
}

impl Db {
    /// Creates keyspace `index` with `config` sizing and a shared
    /// append-only hook cell (armed after replay finishes).
    #[must_use]
    pub fn new(index: usize, config: DbConfig, aof: Arc<OnceLock<AofHook>>) -> Self {
        Self {
            index,
            data: ConcurrentDict::new(config.buckets),
            ttl: ConcurrentDict::new(16),
            version: ConcurrentDict::new(16),
            config,
            aof,
        }
    }

    /// Returns this keyspace's index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the container tuning knobs.
    #[must_use]
    pub fn config(&self) -> DbConfig {
        self.config
    }

    /// Entry point for one client command against this keyspace.
    ///
    /// Transaction-control commands and `MULTI` queueing are intercepted
    /// here; everything else goes through the locking dispatch path.
    pub fn exec(&self, session: &mut Session, cmd: CmdLine) -> Reply {
        transaction::exec_in_session(self, session, cmd)
    }

    /// Locking dispatch path: prepare, lock, execute, bump versions.
    pub fn exec_normal(&self, cmd: &[Vec<u8>]) -> Reply {
        let Some((spec, args)) = self.resolve(cmd) else {
            return self.resolve_error(cmd);
        };
        let Some(prepare) = spec.prepare else {
            let mut locks = self.data.rw_locks(&[], &[]);
            return (spec.execute)(self, &mut locks, args);
        };

        let (write_keys, read_keys) = prepare(args);
        let mut locks = self.data.rw_locks(&write_keys, &read_keys);
        let reply = (spec.execute)(self, &mut locks, args);
        if !write_keys.is_empty() && modified(&reply) {
            self.bump_versions(&write_keys);
        }
        drop(locks);
        reply
    }

    /// No-lock dispatch path: the caller already holds a footprint that
    /// covers the command (EXEC bodies, undo replay, TCC commit).
    pub fn exec_with_locks(&self, locks: &mut Locks, cmd: &[Vec<u8>]) -> Reply {
        let Some((spec, args)) = self.resolve(cmd) else {
            return self.resolve_error(cmd);
        };
        (spec.execute)(self, locks, args)
    }

    /// Builds the undo log for one argv under held locks.
    ///
    /// Empty when the command is unknown or declares no undo.
    #[must_use]
    pub fn undo_logs(&self, locks: &Locks, cmd: &[Vec<u8>]) -> Vec<CmdLine> {
        let Some((spec, args)) = self.resolve(cmd) else {
            return Vec::new();
        };
        match spec.undo {
            Some(undo) => undo(self, locks, args),
            None => Vec::new(),
        }
    }

    fn resolve<'c>(&self, cmd: &'c [Vec<u8>]) -> Option<(&'static CommandSpec, &'c [Vec<u8>])> {
        let first = cmd.first()?;
        let spec = command::lookup(&String::from_utf8_lossy(first))?;
        if !command::arity_matches(spec.arity, cmd.len()) {
            return None;
        }
        Some((spec, &cmd[1..]))
    }

    fn resolve_error(&self, cmd: &[Vec<u8>]) -> Reply {
        let Some(first) = cmd.first() else {
            return Reply::unknown_err();
        };
        let name = String::from_utf8_lossy(first).into_owned();
        match command::lookup(&name) {
            Some(spec) => Reply::arg_num_err(spec.name),
            None => Reply::unknown_command_err(&name),
        }
    }

    /// Acquires a lock footprint on the data dict.
    #[must_use]
    pub fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) -> Locks {
        self.data.rw_locks(write_keys, read_keys)
    }

    // --- version map ---

    /// Current version of a key (0 when never written).
    #[must_use]
    pub fn version_of(&self, key: &str) -> u32 {
        self.version.get(key).unwrap_or(0)
    }

    /// Bumps the version of each named key; caller holds their locks.
    pub fn bump_versions(&self, keys: &[String]) {
        for key in keys {
            let next = self.version.get(key).unwrap_or(0).wrapping_add(1);
            let _ = self.version.put(key, next);
        }
    }

    // --- TTL lifecycle ---

    fn expire_task_key(&self, key: &str) -> String {
        format!("expire-{}-{key}", self.index)
    }

    /// Returns the absolute expiry instant recorded for a key.
    #[must_use]
    pub fn expiry_of(&self, key: &str) -> Option<SystemTime> {
        self.ttl.get(key)
    }

    /// Writes an absolute expiry and arms the wheel task for it.
    pub fn expire_at(&self, key: &str, when: SystemTime) {
        let _ = self.ttl.put(key, when);
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        let data = self.data.clone();
        let ttl = self.ttl.clone();
        let owned_key = key.to_owned();
        let index = self.index;
        timewheel::delay(delay, self.expire_task_key(key), move || {
            // Double-check under the key's write lock: the TTL may have
            // been extended or cleared between scheduling and firing.
            let keys = vec![owned_key.clone()];
            let mut locks = data.rw_locks(&keys, &[]);
            let still_due = ttl
                .get(&owned_key)
                .is_some_and(|deadline| deadline <= SystemTime::now());
            if still_due {
                debug!(db = index, key = %owned_key, "ttl expired");
                let _ = locks.remove(&owned_key);
                let _ = ttl.remove(&owned_key);
            }
        });
    }

    /// Starts the periodic sweep that evicts overdue keys the per-key
    /// tasks may have missed (e.g. deadlines created before a restart).
    pub fn start_expiry_sweeper(&self, period: Duration) {
        schedule_sweep(
            self.data.clone(),
            self.ttl.clone(),
            period.max(Duration::from_millis(100)),
            format!("expire-cycle-{}", self.index),
        );
    }

    /// Clears a key's expiry and cancels its wheel task.
    pub fn persist(&self, key: &str) -> bool {
        let existed = self.ttl.remove(key).is_some();
        if existed {
            timewheel::cancel(self.expire_task_key(key));
        }
        existed
    }

    fn is_expired(&self, key: &str) -> bool {
        self.ttl
            .get(key)
            .is_some_and(|deadline| deadline <= SystemTime::now())
    }

    // --- entity access under held locks ---

    /// Reads a key's entity, treating lazily expired keys as absent.
    ///
    /// An expired key found under a read lock cannot be removed here; the
    /// eager wheel task is rescheduled to fire immediately instead.
    #[must_use]
    pub fn entity<'a>(&self, locks: &'a Locks, key: &str) -> Option<&'a Entity> {
        if self.is_expired(key) {
            let data = self.data.clone();
            let ttl = self.ttl.clone();
            let owned_key = key.to_owned();
            timewheel::delay(Duration::ZERO, self.expire_task_key(key), move || {
                let keys = vec![owned_key.clone()];
                let mut locks = data.rw_locks(&keys, &[]);
                if ttl
                    .get(&owned_key)
                    .is_some_and(|deadline| deadline <= SystemTime::now())
                {
                    let _ = locks.remove(&owned_key);
                    let _ = ttl.remove(&owned_key);
                }
            });
            return None;
        }
        locks.get(key)
    }

    /// Mutable entity access; expired keys are purged inline.
    #[must_use]
    pub fn entity_mut<'a>(&self, locks: &'a mut Locks, key: &str) -> Option<&'a mut Entity> {
        if self.is_expired(key) {
            let _ = locks.remove(key);
            let _ = self.ttl.remove(key);
            timewheel::cancel(self.expire_task_key(key));
            return None;
        }
        locks.get_mut(key)
    }

    /// Stores an entity. Returns 1 when the key was newly created.
    pub fn put_entity(&self, locks: &mut Locks, key: &str, entity: Entity) -> usize {
        locks.put(key, entity)
    }

    /// Removes a key: entity, expiry, and pending wheel task.
    pub fn remove_entity(&self, locks: &mut Locks, key: &str) -> Option<Entity> {
        let removed = locks.remove(key);
        if self.ttl.remove(key).is_some() {
            timewheel::cancel(self.expire_task_key(key));
        }
        removed
    }

    /// Returns whether a live (non-expired) entity exists.
    #[must_use]
    pub fn exists(&self, locks: &Locks, key: &str) -> bool {
        self.entity(locks, key).is_some()
    }

    // --- typed accessors; a mismatched variant is a WRONGTYPE reply ---

    /// String value of a key.
    pub fn str_value<'a>(&self, locks: &'a Locks, key: &str) -> Result<Option<&'a StrValue>, Reply> {
        match self.entity(locks, key) {
            None => Ok(None),
            Some(Entity::Str(value)) => Ok(Some(value)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// List value of a key.
    pub fn list<'a>(&self, locks: &'a Locks, key: &str) -> Result<Option<&'a QuickList>, Reply> {
        match self.entity(locks, key) {
            None => Ok(None),
            Some(Entity::List(list)) => Ok(Some(list)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable list value of a key.
    pub fn list_mut<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<Option<&'a mut QuickList>, Reply> {
        match self.entity_mut(locks, key) {
            None => Ok(None),
            Some(Entity::List(list)) => Ok(Some(list)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable list value, creating an empty list when absent.
    pub fn list_or_create<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<&'a mut QuickList, Reply> {
        if self.entity_mut(locks, key).is_none() {
            let _ = locks.put(key, Entity::List(QuickList::new(self.config.list_page_size)));
        }
        match locks.get_mut(key) {
            Some(Entity::List(list)) => Ok(list),
            Some(_) => Err(Reply::wrong_type_err()),
            None => unreachable!("list was created above"),
        }
    }

    /// Hash value of a key.
    pub fn hash<'a>(
        &self,
        locks: &'a Locks,
        key: &str,
    ) -> Result<Option<&'a hashbrown::HashMap<Vec<u8>, Vec<u8>>>, Reply> {
        match self.entity(locks, key) {
            None => Ok(None),
            Some(Entity::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable hash value, creating an empty hash when absent.
    pub fn hash_or_create<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<&'a mut hashbrown::HashMap<Vec<u8>, Vec<u8>>, Reply> {
        if self.entity_mut(locks, key).is_none() {
            let _ = locks.put(key, Entity::Hash(hashbrown::HashMap::new()));
        }
        match locks.get_mut(key) {
            Some(Entity::Hash(hash)) => Ok(hash),
            Some(_) => Err(Reply::wrong_type_err()),
            None => unreachable!("hash was created above"),
        }
    }

    /// Mutable hash value of a key.
    pub fn hash_mut<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<Option<&'a mut hashbrown::HashMap<Vec<u8>, Vec<u8>>>, Reply> {
        match self.entity_mut(locks, key) {
            None => Ok(None),
            Some(Entity::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Set value of a key.
    pub fn set<'a>(&self, locks: &'a Locks, key: &str) -> Result<Option<&'a SetValue>, Reply> {
        match self.entity(locks, key) {
            None => Ok(None),
            Some(Entity::Set(set)) => Ok(Some(set)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable set value of a key.
    pub fn set_mut<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<Option<&'a mut SetValue>, Reply> {
        match self.entity_mut(locks, key) {
            None => Ok(None),
            Some(Entity::Set(set)) => Ok(Some(set)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable set value, creating an empty packed set when absent.
    pub fn set_or_create<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<&'a mut SetValue, Reply> {
        if self.entity_mut(locks, key).is_none() {
            let _ = locks.put(key, Entity::Set(SetValue::new()));
        }
        match locks.get_mut(key) {
            Some(Entity::Set(set)) => Ok(set),
            Some(_) => Err(Reply::wrong_type_err()),
            None => unreachable!("set was created above"),
        }
    }

    /// Sorted-set value of a key.
    pub fn sorted_set<'a>(
        &self,
        locks: &'a Locks,
        key: &str,
    ) -> Result<Option<&'a SortedSet>, Reply> {
        match self.entity(locks, key) {
            None => Ok(None),
            Some(Entity::SortedSet(zset)) => Ok(Some(zset)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable sorted-set value of a key.
    pub fn sorted_set_mut<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<Option<&'a mut SortedSet>, Reply> {
        match self.entity_mut(locks, key) {
            None => Ok(None),
            Some(Entity::SortedSet(zset)) => Ok(Some(zset)),
            Some(_) => Err(Reply::wrong_type_err()),
        }
    }

    /// Mutable sorted-set value, creating an empty one when absent.
    pub fn sorted_set_or_create<'a>(
        &self,
        locks: &'a mut Locks,
        key: &str,
    ) -> Result<&'a mut SortedSet, Reply> {
        if self.entity_mut(locks, key).is_none() {
            let _ = locks.put(key, Entity::SortedSet(SortedSet::new()));
        }
        match locks.get_mut(key) {
            Some(Entity::SortedSet(zset)) => Ok(zset),
            Some(_) => Err(Reply::wrong_type_err()),
            None => unreachable!("sorted set was created above"),
        }
    }

    // --- whole-keyspace operations ---

    /// Visits every live key until the visitor returns `false`.
    pub fn for_each_key(&self, mut visitor: impl FnMut(&str) -> bool) {
        self.data.for_each(|key, _| {
            if self.is_expired(key) {
                return true;
            }
            visitor(key)
        });
    }

    /// `(data_len, ttl_len)` sizes.
    #[must_use]
    pub fn sizes(&self) -> (usize, usize) {
        (self.data.len(), self.ttl.len())
    }

    /// Drops every key, expiry, and version in this keyspace.
    ///
    /// Pending wheel tasks survive but no-op at fire time because their
    /// TTL double-check no longer finds the key.
    pub fn flush(&self) {
        self.data.clear();
        self.ttl.clear();
        self.version.clear();
    }

    /// Feeds one mutating argv to the append-only writer, if armed.
    pub fn append(&self, cmd: CmdLine) {
        if let Some(hook) = self.aof.get() {
            hook(self.index, cmd);
        }
    }

    /// Rebuilds a full argv (`name` + `args`) for the append-only file.
    #[must_use]
    pub fn to_cmd(name: &str, args: &[Vec<u8>]) -> CmdLine {
        let mut line = Vec::with_capacity(args.len() + 1);
        line.push(name.as_bytes().to_vec());
        line.extend(args.iter().cloned());
        line
    }

    /// Removes the named keys, returning how many existed.
    pub fn remove_keys(&self, locks: &mut Locks, args: &[Vec<u8>]) -> usize {
        let mut removed = 0;
        for raw in args {
            let key = key_of(raw);
            if self.entity_mut(locks, &key).is_some() && self.remove_entity(locks, &key).is_some()
            {
                removed += 1;
            }
        }
        removed
    }
}

fn modified(reply: &Reply) -> bool {
    !reply.is_error() && !matches!(reply, Reply::Integer(0))
}

/// One sweep pass over the TTL map; re-arms itself afterwards.
fn schedule_sweep(
    data: ConcurrentDict<Entity>,
    ttl: ConcurrentDict<SystemTime>,
    period: Duration,
    task_key: String,
) {
    let key_for_rearm = task_key.clone();
    timewheel::delay(period, task_key, move || {
        let now = SystemTime::now();
        let mut due = Vec::new();
        ttl.for_each(|key, deadline| {
            if *deadline <= now {
                due.push(key.to_owned());
            }
            true
        });
        for key in due {
            let footprint = vec![key.clone()];
            let mut locks = data.rw_locks(&footprint, &[]);
            if ttl
                .get(&key)
                .is_some_and(|deadline| deadline <= SystemTime::now())
            {
                debug!(key = %key, "expiry sweep removed key");
                let _ = locks.remove(&key);
                let _ = ttl.remove(&key);
            }
        }
        schedule_sweep(data.clone(), ttl.clone(), period, key_for_rearm.clone());
    });
}
