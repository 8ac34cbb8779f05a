//! Pipelined peer client.
//!
//! One client owns a TCP connection to a cluster peer and pipelines
//! requests over it: a writer thread drains the `pending` channel onto
//! the socket, a reader thread matches inbound frames against the
//! `waiting` channel in FIFO order, and a heartbeat thread keeps the
//! connection warm with a `PING` every ten seconds.

mod client;
mod wait;

pub use client::PeerClient;

#[cfg(test)]
mod tests {
    use super::PeerClient;
    use carmine_resp::{Reply, cmd_line};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Minimal line-oriented RESP responder: answers every array frame
    /// with a canned status reply.
    fn spawn_stub_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("stub addr").to_string();
        let handle = thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;
            let mut line = String::new();
            let mut payload_lines = 0_usize;
            while reader.read_line(&mut line).is_ok_and(|read| read > 0) {
                let trimmed = line.trim_end().to_owned();
                line.clear();
                if let Some(count) = trimmed.strip_prefix('*') {
                    payload_lines = count.parse::<usize>().unwrap_or(0) * 2;
                    continue;
                }
                if payload_lines > 0 {
                    payload_lines -= 1;
                    if payload_lines == 0 && writer.write_all(b"+STUBBED\r\n").is_err() {
                        return;
                    }
                }
            }
        });
        (addr, handle)
    }

    #[rstest]
    fn pipelined_requests_get_fifo_replies() {
        let (addr, server) = spawn_stub_server();
        let client = PeerClient::connect(&addr).expect("connect to stub");
        for _ in 0..3 {
            let reply = client.send(cmd_line(&["SET", "k", "v"]));
            assert_that!(reply, eq(&Reply::Status("STUBBED".to_owned())));
        }
        client.close();
        drop(client);
        server.join().expect("stub server exits");
    }

    #[rstest]
    fn connect_to_unreachable_peer_fails() {
        assert_that!(PeerClient::connect("127.0.0.1:1").is_err(), eq(true));
    }

    #[rstest]
    fn send_after_close_returns_error_reply() {
        let (addr, server) = spawn_stub_server();
        let client = PeerClient::connect(&addr).expect("connect to stub");
        client.close();
        assert_that!(client.send(cmd_line(&["PING"])).is_error(), eq(true));
        drop(client);
        server.join().expect("stub server exits");
    }
}
