//! TCP accept loop with signal-driven shutdown.
//!
//! The acceptor thread hands each socket to its own session thread
//! (pattern shared with the reference deployment: one logical task per
//! connection). Shutdown closes the listener, stops accepting, and asks
//! the engine to flush.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use carmine_cluster::Cluster;
use carmine_common::config::ServerConfig;
use carmine_common::error::{CarmineError, CarmineResult};
use carmine_resp::Engine;
use carmine_storage::Standalone;

use crate::handler::serve_connection;

/// The carmine TCP server.
pub struct Server {
    config: ServerConfig,
    engine: Arc<dyn Engine>,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

impl Server {
    /// Builds the engine named by the config: cluster when a self
    /// address and peers are configured, standalone otherwise.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError` when the engine fails to start.
    pub fn new(config: ServerConfig) -> CarmineResult<Self> {
        let engine: Arc<dyn Engine> = if config.cluster_enabled() {
            Arc::new(Cluster::new(&config)?)
        } else {
            info!(addr = %config.listen_addr(), "starting standalone node");
            Arc::new(Standalone::new(&config)?)
        };
        Ok(Self {
            config,
            engine,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Wraps an externally built engine; used by tests that compose
    /// their own topology.
    #[must_use]
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn Engine>) -> Self {
        Self {
            config,
            engine,
            shutdown: Arc::new(AtomicBool::new(false)),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a flag that makes `run` return when set.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the configured address and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Io` when the listener cannot bind.
    pub fn run(&self) -> CarmineResult<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .map_err(|err| CarmineError::Io(format!("bind {addr}: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| CarmineError::Io(format!("set nonblocking: {err}")))?;
        info!(%addr, "listening");
        self.serve(&listener);
        Ok(())
    }

    /// Serves an already-bound listener until shutdown.
    pub fn serve(&self, listener: &TcpListener) {
        let _ = listener.set_nonblocking(true);
        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let active = self.active_connections.load(Ordering::Acquire);
                    if self.config.max_clients > 0 && active >= self.config.max_clients {
                        warn!(%peer, active, "client limit reached, rejecting connection");
                        drop(stream);
                        continue;
                    }
                    self.spawn_session(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    if !self.shutdown.load(Ordering::Acquire) {
                        error!(%err, "accept failed");
                    }
                }
            }
        }
        info!("listener closed, shutting down engine");
        self.engine.close();
    }

    fn spawn_session(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active_connections);
        let _ = active.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name("carmine-session".to_owned())
            .spawn(move || {
                serve_connection(&engine, stream);
                let _ = active.fetch_sub(1, Ordering::AcqRel);
            });
        if let Err(err) = spawned {
            error!(%err, "failed to spawn session thread");
            let _ = self.active_connections.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
