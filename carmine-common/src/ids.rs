//! Snowflake-style distributed transaction ids.
//!
//! 63-bit layout: 41 bits of millisecond epoch offset, 10 bits of node
//! index derived from the peer address, 12 bits of per-millisecond
//! sequence. Ids are monotonic within one node; the generator spins to the
//! next millisecond when the sequence overflows.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::fnv32;

/// Logical database index (`SELECT`-compatible model).
pub type DbIndex = usize;

const EPOCH_MILLIS: u64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Per-node snowflake id generator.
#[derive(Debug)]
pub struct IdGenerator {
    node: u64,
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_millis: u64,
    sequence: u64,
}

impl IdGenerator {
    /// Creates a generator whose node index is derived from `node_addr`.
    #[must_use]
    pub fn new(node_addr: &str) -> Self {
        Self {
            node: u64::from(fnv32(node_addr.as_bytes())) & NODE_MASK,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Returns the next id, monotonic for this node.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().expect("id generator mutex poisoned");
        let mut now = current_millis();
        if now < state.last_millis {
            // Clock went backwards; refuse to reuse the old window.
            now = state.last_millis;
        }
        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_millis {
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = now;

        let timestamp = now.saturating_sub(EPOCH_MILLIS);
        let id = (timestamp << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS)
            | state.sequence;
        i64::try_from(id & (i64::MAX as u64)).unwrap_or(i64::MAX)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
