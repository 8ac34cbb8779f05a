//! Per-connection RESP session loop.
//!
//! Each accepted socket gets one logical task: parse frames off the
//! stream, dispatch argv vectors to the engine, write replies back in
//! arrival order. Framing errors are written back without dropping the
//! connection; only EOF or socket failure ends the session.

use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, warn};

use carmine_resp::{Engine, Payload, Reply, RespParser, Session};

/// Serves one client connection to completion.
pub fn serve_connection(engine: &Arc<dyn Engine>, stream: TcpStream) {
    let remote = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let mut session = Session::new(remote.clone());

    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            warn!(%remote, %err, "cannot clone client socket");
            return;
        }
    };
    let mut writer = stream;

    debug!(%remote, "client connected");
    for outcome in RespParser::new(reader) {
        let written = match outcome {
            Ok(payload @ Payload::Frame(_)) => match payload.into_cmd_line() {
                Some(cmd) if !cmd.is_empty() => {
                    let reply = engine.exec(&mut session, cmd);
                    writer.write_all(&reply.to_bytes())
                }
                _ => writer.write_all(&Reply::err("invalid request frame").to_bytes()),
            },
            Ok(Payload::Protocol(detail)) => writer.write_all(&Reply::Error(detail).to_bytes()),
            Err(err) => {
                debug!(%remote, %err, "client stream ended");
                break;
            }
        };
        if written.is_err() {
            break;
        }
    }

    engine.on_client_close(&mut session);
    debug!(%remote, "client disconnected");
}
