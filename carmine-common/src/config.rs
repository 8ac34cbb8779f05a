//! Server configuration.
//!
//! The config file is a plain `key value` line format with `#` comments,
//! compatible with the reference server's conf layout. Unknown options are
//! ignored so newer conf files keep working against older builds.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{CarmineError, CarmineResult};

/// Parsed server configuration with reference-compatible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listener bind address.
    pub bind: String,
    /// Listener port.
    pub port: u16,
    /// Whether the append-only file is enabled.
    pub append_only: bool,
    /// Append-only file path.
    pub append_filename: String,
    /// Maximum concurrent client connections; `0` means unlimited.
    pub max_clients: usize,
    /// Password required by `AUTH`; empty disables authentication.
    pub require_pass: String,
    /// Number of logical databases served by `SELECT`.
    pub databases: usize,
    /// Expire-sweeper period in seconds.
    pub cycle: u64,
    /// Stripe-count hint for the concurrent dict.
    pub buckets: usize,
    /// Capacity of one segmented-list page.
    pub list_max_shard_size: usize,
    /// Member cap for the packed integer set encoding.
    pub set_max_intset_entries: usize,
    /// Addresses of every cluster peer (excluding self).
    pub peers: Vec<String>,
    /// This node's own advertised address.
    pub self_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_owned(),
            port: 6379,
            append_only: false,
            append_filename: "carmine.aof".to_owned(),
            max_clients: 0,
            require_pass: String::new(),
            databases: 16,
            cycle: 1,
            buckets: 1 << 16,
            list_max_shard_size: 1 << 9,
            set_max_intset_entries: 512,
            peers: Vec::new(),
            self_addr: String::new(),
        }
    }
}

impl ServerConfig {
    /// Reads a config file from disk.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Config` when the file cannot be opened or read.
    pub fn load(path: &Path) -> CarmineResult<Self> {
        let file = File::open(path)
            .map_err(|error| CarmineError::Config(format!("open {}: {error}", path.display())))?;
        Self::parse(BufReader::new(file))
    }

    /// Parses config lines from any reader.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Config` when reading fails; malformed values
    /// for known keys are skipped, unknown keys are ignored.
    pub fn parse<R: Read>(reader: BufReader<R>) -> CarmineResult<Self> {
        let mut config = Self::default();
        for line in reader.lines() {
            let line =
                line.map_err(|error| CarmineError::Config(format!("read config: {error}")))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            config.apply(&key.to_ascii_lowercase(), value.trim());
        }
        Ok(config)
    }

    /// Returns `bind:port` as the listen address.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Returns whether this node runs in cluster mode.
    #[must_use]
    pub fn cluster_enabled(&self) -> bool {
        !self.self_addr.is_empty() && !self.peers.is_empty()
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind" => self.bind = value.to_owned(),
            "port" => parse_into(value, &mut self.port),
            "append-only" => self.append_only = value == "yes",
            "append-filename" => self.append_filename = value.to_owned(),
            "max-clients" => parse_into(value, &mut self.max_clients),
            "require-pass" => self.require_pass = value.to_owned(),
            "databases" => parse_into(value, &mut self.databases),
            "cycle" => parse_into(value, &mut self.cycle),
            "buckets" => parse_into(value, &mut self.buckets),
            "list-max-shard-size" => parse_into(value, &mut self.list_max_shard_size),
            "set-max-intset-entries" => parse_into(value, &mut self.set_max_intset_entries),
            "peers" => {
                self.peers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|peer| !peer.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "self" => self.self_addr = value.to_owned(),
            _ => {}
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) {
    if let Ok(parsed) = value.parse::<T>() {
        *slot = parsed;
    }
}
