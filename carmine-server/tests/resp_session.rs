//! Wire-level session tests against a live listener.
//!
//! These pin exact reply bytes for the core flows: simple reads and
//! writes, lazy and eager expiry, optimistic transactions, and the
//! sorted-set tie-break order.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use googletest::prelude::*;
use rstest::rstest;

use carmine_common::config::ServerConfig;
use carmine_resp::Engine;
use carmine_server::Server;
use carmine_storage::Standalone;

struct TestServer {
    addr: String,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr").to_string();
    let config = ServerConfig {
        buckets: 64,
        ..ServerConfig::default()
    };
    let engine: Arc<dyn Engine> =
        Arc::new(Standalone::new(&config).expect("standalone engine starts"));
    let server = Server::with_engine(config, engine);
    let shutdown = server.shutdown_flag();
    let _ = thread::Builder::new()
        .name("test-server".to_owned())
        .spawn(move || server.serve(&listener));
    TestServer { addr, shutdown }
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(&server.addr).expect("connect to test server");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    stream
}

/// Writes a request and asserts the exact reply bytes.
fn roundtrip(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).expect("write request");
    let mut reply = vec![0_u8; expected.len()];
    stream.read_exact(&mut reply).expect("read reply");
    assert_that!(reply, eq(&expected.to_vec()));
}

#[rstest]
fn set_then_get_over_the_wire() {
    let server = start_server();
    let mut client = connect(&server);
    roundtrip(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$4\r\nname\r\n$4\r\njack\r\n",
        b"+OK\r\n",
    );
    roundtrip(&mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n", b"$4\r\njack\r\n");
}

#[rstest]
fn inline_commands_are_accepted() {
    let server = start_server();
    let mut client = connect(&server);
    roundtrip(&mut client, b"SET city kyoto\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"GET city\r\n", b"$5\r\nkyoto\r\n");
    roundtrip(&mut client, b"PING\r\n", b"+PONG\r\n");
}

#[rstest]
fn expiry_is_lazy_and_eager() {
    let server = start_server();
    let mut client = connect(&server);
    roundtrip(&mut client, b"SET k v\r\n", b"+OK\r\n");
    roundtrip(&mut client, b"EXPIRE k 1\r\n", b":1\r\n");
    thread::sleep(Duration::from_millis(500));
    roundtrip(&mut client, b"GET k\r\n", b"$1\r\nv\r\n");
    thread::sleep(Duration::from_millis(1_500));
    roundtrip(&mut client, b"GET k\r\n", b"$-1\r\n");
    roundtrip(&mut client, b"TTL k\r\n", b":-2\r\n");
}

#[rstest]
fn incr_on_non_integer_reports_range_error() {
    let server = start_server();
    let mut client = connect(&server);
    roundtrip(&mut client, b"SET k abc\r\n", b"+OK\r\n");
    roundtrip(
        &mut client,
        b"INCR k\r\n",
        b"-ERR value is not an integer or out of range\r\n",
    );
}

#[rstest]
fn watched_write_from_another_client_aborts_exec() {
    let server = start_server();
    let mut watcher = connect(&server);
    let mut writer = connect(&server);

    roundtrip(&mut watcher, b"SET k 5\r\n", b"+OK\r\n");
    roundtrip(&mut watcher, b"WATCH k\r\n", b"+OK\r\n");
    roundtrip(&mut watcher, b"GET k\r\n", b"$1\r\n5\r\n");
    roundtrip(&mut watcher, b"MULTI\r\n", b"+OK\r\n");
    roundtrip(&mut watcher, b"INCR k\r\n", b"+QUEUED\r\n");

    roundtrip(&mut writer, b"SET k 99\r\n", b"+OK\r\n");

    roundtrip(&mut watcher, b"EXEC\r\n", b"*-1\r\n");
    roundtrip(&mut watcher, b"GET k\r\n", b"$2\r\n99\r\n");
}

#[rstest]
fn sorted_set_range_breaks_ties_lexicographically() {
    let server = start_server();
    let mut client = connect(&server);
    roundtrip(&mut client, b"ZADD s 1 b 1 a 2 c\r\n", b":3\r\n");
    roundtrip(
        &mut client,
        b"ZRANGE s 0 -1\r\n",
        b"*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n",
    );
}

#[rstest]
fn protocol_error_keeps_the_connection_alive() {
    let server = start_server();
    let mut client = connect(&server);
    client.write_all(b"$abc\r\n").expect("write bad frame");
    let mut first = [0_u8; 1];
    client.read_exact(&mut first).expect("error reply starts");
    assert_that!(first[0], eq(b'-'));
    // Drain the rest of the error line.
    let mut byte = [0_u8; 1];
    while byte[0] != b'\n' {
        client.read_exact(&mut byte).expect("drain error line");
    }
    roundtrip(&mut client, b"PING\r\n", b"+PONG\r\n");
}

#[rstest]
fn per_connection_replies_keep_request_order() {
    let server = start_server();
    let mut client = connect(&server);
    // Pipeline three requests in one write; replies must come back in order.
    client
        .write_all(b"SET a 1\r\nINCR a\r\nGET a\r\n")
        .expect("write pipeline");
    let expected = b"+OK\r\n:2\r\n$1\r\n2\r\n";
    let mut reply = vec![0_u8; expected.len()];
    client.read_exact(&mut reply).expect("read pipelined replies");
    assert_that!(reply, eq(&expected.to_vec()));
}
