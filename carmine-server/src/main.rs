//! Binary entrypoint for `carmine-server`.

use std::path::Path;
use std::sync::atomic::Ordering;

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use carmine_common::config::ServerConfig;
use carmine_server::Server;

const DEFAULT_CONFIG_FILE: &str = "carmine.conf";

fn load_config() -> ServerConfig {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_owned());
    if Path::new(&path).is_file() {
        match ServerConfig::load(Path::new(&path)) {
            Ok(config) => {
                info!(%path, "loaded config file");
                return config;
            }
            Err(err) => {
                error!(%path, %err, "config file unreadable, using defaults");
            }
        }
    }
    ServerConfig::default()
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,carmine=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = load_config();
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "failed to start carmine-server");
            std::process::exit(1);
        }
    };

    let shutdown = server.shutdown_flag();
    match Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT]) {
        Ok(mut signals) => {
            let _ = std::thread::Builder::new()
                .name("carmine-signals".to_owned())
                .spawn(move || {
                    if let Some(signal) = signals.forever().next() {
                        info!(signal, "shutdown signal received");
                        shutdown.store(true, Ordering::Release);
                    }
                });
        }
        Err(err) => error!(%err, "cannot install signal handler"),
    }

    if let Err(err) = server.run() {
        error!(%err, "server terminated");
        std::process::exit(1);
    }
}
