//! Core data structures backing the carmine keyspace.
//!
//! The striped concurrent dict (and its ordered multi-key lock sets) is the
//! single mutation point for every keyspace map. The timing wheel drives
//! TTL expiry and distributed-transaction timeouts. The remaining modules
//! are the value containers: skiplist-backed sorted set, segmented list,
//! and the packed integer set.

pub mod border;
pub mod dict;
pub mod intset;
pub mod quicklist;
pub mod skiplist;
pub mod sorted_set;
pub mod timewheel;

pub use border::ScoreBorder;
pub use dict::{ConcurrentDict, LockSet};
pub use intset::IntSet;
pub use quicklist::QuickList;
pub use sorted_set::{Element, SortedSet};
pub use timewheel::TimeWheel;
