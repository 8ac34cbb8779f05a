//! Cluster coordinator.
//!
//! A cluster node owns a standalone engine for its share of the keyspace
//! and a consistent-hash ring over every node address. Single-key
//! commands relay to the owning peer over pooled pipelined clients;
//! multi-key writes that span peers run the try-commit-cancel protocol.

mod commands;
mod pool;
mod ring;
mod router;
mod tcc;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use hashbrown::HashMap;
use tracing::{error, info};

use carmine_common::config::ServerConfig;
use carmine_common::error::CarmineResult;
use carmine_common::ids::IdGenerator;
use carmine_resp::{CmdLine, Engine, Reply, Session};
use carmine_storage::Standalone;

use crate::pool::PeerPool;
use crate::ring::Ring;
use crate::tcc::TxTable;

pub use crate::ring::Ring as ClusterRing;

/// One node of a carmine cluster.
pub struct Cluster {
    self_addr: String,
    nodes: Vec<String>,
    ring: Ring,
    pools: HashMap<String, PeerPool>,
    db: Arc<Standalone>,
    id_generator: IdGenerator,
    transactions: TxTable,
}

impl Cluster {
    /// Builds a cluster node from the server config.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError` when the config names no self address or
    /// the local engine fails to start.
    pub fn new(config: &ServerConfig) -> CarmineResult<Self> {
        if config.self_addr.is_empty() {
            return Err(carmine_common::error::CarmineError::Config(
                "cluster mode requires a 'self' address".to_owned(),
            ));
        }
        let mut nodes = config.peers.clone();
        nodes.push(config.self_addr.clone());
        nodes.sort();
        nodes.dedup();

        let pools = config
            .peers
            .iter()
            .filter(|peer| **peer != config.self_addr)
            .map(|peer| (peer.clone(), PeerPool::new(peer)))
            .collect();

        info!(self_addr = %config.self_addr, peers = ?config.peers, "starting cluster node");
        Ok(Self {
            self_addr: config.self_addr.clone(),
            ring: Ring::new(&nodes),
            nodes,
            pools,
            db: Arc::new(Standalone::new(config)?),
            id_generator: IdGenerator::new(&config.self_addr),
            transactions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Returns the local standalone engine.
    #[must_use]
    pub fn local_db(&self) -> &Standalone {
        &self.db
    }

    fn dispatch(&self, session: &mut Session, cmd: CmdLine) -> Reply {
        let Some(first) = cmd.first() else {
            return Reply::unknown_err();
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        // A trailing underscore marks a broadcast command forwarded by a
        // coordinator; it executes against the local keyspace instead of
        // being routed again.
        if name.ends_with('_') {
            let mut local = cmd;
            let _ = local[0].pop();
            return self.db.exec(session, local);
        }
        match router::route(&name) {
            Some(handler) => handler(self, session, cmd),
            None => Reply::err(format!(
                "command '{}' is not supported in cluster mode",
                name.to_lowercase()
            )),
        }
    }

    /// Sends one argv to a peer (possibly self), pre-selecting the
    /// caller's DB index on remote connections.
    pub(crate) fn relay(&self, peer: &str, session: &mut Session, cmd: CmdLine) -> Reply {
        if peer == self.self_addr {
            let name = cmd
                .first()
                .map(|raw| String::from_utf8_lossy(raw).to_ascii_uppercase())
                .unwrap_or_default();
            // TCC control commands re-enter cluster dispatch so the
            // participant handlers see them; everything else goes straight
            // to the local engine.
            if matches!(name.as_str(), "PREPARE" | "COMMIT" | "ROLLBACK") {
                return self.dispatch(session, cmd);
            }
            return self.db.exec(session, cmd);
        }

        let Some(pool) = self.pools.get(peer) else {
            return Reply::err(format!("peer not found: {peer}"));
        };
        let client = match pool.borrow() {
            Ok(client) => client,
            Err(err) => return Reply::err(err.to_string()),
        };
        if session.db_index != 0 {
            let select: CmdLine = vec![
                b"SELECT".to_vec(),
                session.db_index.to_string().into_bytes(),
            ];
            let _ = client.send(select);
        }
        let reply = client.send(cmd);
        pool.give_back(client);
        reply
    }

    /// Issues the same argv to every node, collecting per-peer replies.
    ///
    /// Remote copies carry the underscore marker so receiving peers run
    /// them locally instead of broadcasting again.
    pub(crate) fn broadcast(
        &self,
        session: &mut Session,
        cmd: CmdLine,
    ) -> HashMap<String, Reply> {
        let mut replies = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes.clone() {
            let reply = if node == self.self_addr {
                self.relay(&node, session, cmd.clone())
            } else {
                let mut marked = cmd.clone();
                marked[0].push(b'_');
                self.relay(&node, session, marked)
            };
            let _ = replies.insert(node, reply);
        }
        replies
    }

    /// Inverts key ownership into `peer -> keys`.
    pub(crate) fn group_by(&self, keys: &[String]) -> HashMap<String, Vec<String>> {
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let Some(peer) = self.ring.pick(key) else {
                continue;
            };
            groups.entry(peer.to_owned()).or_default().push(key.clone());
        }
        groups
    }
}

impl Engine for Cluster {
    fn exec(&self, session: &mut Session, cmd: CmdLine) -> Reply {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let Some(first) = cmd.first() else {
                return Reply::unknown_err();
            };
            let name = String::from_utf8_lossy(first).to_ascii_uppercase();
            if name == "AUTH" {
                return self.db.auth(session, &cmd[1..]);
            }
            if !self.db.is_authenticated(session) {
                return Reply::Error("NOAUTH Authentication required".to_owned());
            }
            self.dispatch(session, cmd)
        }));
        match outcome {
            Ok(reply) => reply,
            Err(_) => {
                error!("cluster dispatch panicked");
                Reply::unknown_err()
            }
        }
    }

    fn on_client_close(&self, session: &mut Session) {
        self.db.on_client_close(session);
    }

    fn close(&self) {
        for pool in self.pools.values() {
            pool.close_all();
        }
        self.db.close();
    }
}

#[cfg(test)]
mod tests;
