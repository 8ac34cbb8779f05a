//! Bounded pool of long-lived pipelined clients per peer.

use std::sync::Mutex;

use carmine_client::PeerClient;
use carmine_common::error::CarmineResult;

const MAX_IDLE_CLIENTS: usize = 4;

/// Connection pool for one peer address.
pub(crate) struct PeerPool {
    addr: String,
    idle: Mutex<Vec<PeerClient>>,
}

impl PeerPool {
    pub(crate) fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_owned(),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Borrows an idle client or dials a fresh one.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Io` when the peer cannot be reached.
    pub(crate) fn borrow(&self) -> CarmineResult<PeerClient> {
        if let Ok(mut idle) = self.idle.lock()
            && let Some(client) = idle.pop()
        {
            return Ok(client);
        }
        PeerClient::connect(&self.addr)
    }

    /// Returns a client to the pool, or closes it when the pool is full.
    pub(crate) fn give_back(&self, client: PeerClient) {
        if client.is_closed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock()
            && idle.len() < MAX_IDLE_CLIENTS
        {
            idle.push(client);
            return;
        }
        client.close();
    }

    /// Closes every idle client.
    pub(crate) fn close_all(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            for client in idle.drain(..) {
                client.close();
            }
        }
    }
}
