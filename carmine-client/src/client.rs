//! Client worker threads and request plumbing.

use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, tick};
use tracing::{debug, warn};

use carmine_common::error::{CarmineError, CarmineResult};
use carmine_resp::{CmdLine, Payload, Reply, RespParser};

use crate::wait::WaitGroup;

const CHANNEL_CAPACITY: usize = 1 << 8;
const SEND_DEADLINE: Duration = Duration::from_secs(3);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const MAX_RECONNECT_ATTEMPTS: usize = 3;

enum WriterMessage {
    Request(Request),
    Shutdown,
}

struct Request {
    line: CmdLine,
    heartbeat: bool,
    reply_tx: Sender<Reply>,
}

struct Shared {
    addr: String,
    socket: Mutex<TcpStream>,
    waiting_tx: Sender<Request>,
    waiting_rx: Receiver<Request>,
    closed: AtomicBool,
}

/// Pipelined, heartbeated client for one peer address.
pub struct PeerClient {
    shared: Arc<Shared>,
    pending_tx: Sender<WriterMessage>,
    stop_heartbeat: Sender<()>,
    working: WaitGroup,
}

impl PeerClient {
    /// Connects and starts the writer, reader, and heartbeat workers.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Io` when the TCP connection fails.
    pub fn connect(addr: &str) -> CarmineResult<Self> {
        let socket = TcpStream::connect(addr)
            .map_err(|err| CarmineError::Io(format!("connect to peer {addr}: {err}")))?;
        let reader_socket = socket
            .try_clone()
            .map_err(|err| CarmineError::Io(format!("clone peer socket {addr}: {err}")))?;

        let (pending_tx, pending_rx) = bounded(CHANNEL_CAPACITY);
        let (waiting_tx, waiting_rx) = bounded::<Request>(CHANNEL_CAPACITY);
        let (stop_heartbeat, heartbeat_stop_rx) = bounded(1);
        let shared = Arc::new(Shared {
            addr: addr.to_owned(),
            socket: Mutex::new(socket),
            waiting_tx,
            waiting_rx,
            closed: AtomicBool::new(false),
        });

        spawn_reader(Arc::clone(&shared), reader_socket);
        spawn_writer(Arc::clone(&shared), pending_rx);

        let client = Self {
            shared,
            pending_tx,
            stop_heartbeat,
            working: WaitGroup::new(),
        };
        client.spawn_heartbeat(heartbeat_stop_rx);
        Ok(client)
    }

    /// Returns the peer address this client talks to.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Returns whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Sends one argv and waits up to three seconds for its reply.
    ///
    /// A timeout yields a synthetic error reply; the writer still
    /// attempts delivery of the abandoned request.
    pub fn send(&self, line: CmdLine) -> Reply {
        self.send_inner(line, false)
    }

    fn send_inner(&self, line: CmdLine, heartbeat: bool) -> Reply {
        if self.is_closed() {
            return Reply::err("peer client is closed");
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.working.add(1);
        let request = Request {
            line,
            heartbeat,
            reply_tx,
        };
        let outcome = if self
            .pending_tx
            .send(WriterMessage::Request(request))
            .is_err()
        {
            Reply::err("peer client is closed")
        } else {
            match reply_rx.recv_timeout(SEND_DEADLINE) {
                Ok(reply) => reply,
                Err(_) => Reply::err("server time out"),
            }
        };
        self.working.done();
        outcome
    }

    fn spawn_heartbeat(&self, stop_rx: Receiver<()>) {
        let shared = Arc::clone(&self.shared);
        let pending_tx = self.pending_tx.clone();
        let _ = thread::Builder::new()
            .name("carmine-peer-heartbeat".to_owned())
            .spawn(move || {
                let ticker = tick(HEARTBEAT_PERIOD);
                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => {
                            if shared.closed.load(Ordering::Acquire) {
                                return;
                            }
                            let (reply_tx, _reply_rx) = bounded(1);
                            let ping = Request {
                                line: vec![b"PING".to_vec()],
                                heartbeat: true,
                                reply_tx,
                            };
                            if pending_tx.send(WriterMessage::Request(ping)).is_err() {
                                return;
                            }
                        }
                        recv(stop_rx) -> _ => return,
                    }
                }
            });
    }

    /// Stops the workers: no new requests, outstanding ones drain,
    /// then the socket closes.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_heartbeat.send(());
        let _ = self.pending_tx.send(WriterMessage::Shutdown);
        self.working.wait();
        if let Ok(socket) = self.shared.socket.lock() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_writer(shared: Arc<Shared>, pending_rx: Receiver<WriterMessage>) {
    let _ = thread::Builder::new()
        .name("carmine-peer-writer".to_owned())
        .spawn(move || {
            while let Ok(message) = pending_rx.recv() {
                match message {
                    WriterMessage::Request(request) => write_request(&shared, request),
                    WriterMessage::Shutdown => return,
                }
            }
        });
}

fn write_request(shared: &Arc<Shared>, request: Request) {
    let frame = Reply::multi_bulk(request.line.clone()).to_bytes();
    let mut attempts = 0;
    loop {
        let write_result = {
            let Ok(mut socket) = shared.socket.lock() else {
                let _ = request.reply_tx.send(Reply::err("request failed"));
                return;
            };
            socket.write_all(&frame)
        };
        match write_result {
            Ok(()) => {
                // FIFO hand-off to the reader; replies arrive in order.
                let _ = shared.waiting_tx.send(request);
                return;
            }
            Err(err) => {
                attempts += 1;
                if attempts > MAX_RECONNECT_ATTEMPTS
                    || shared.closed.load(Ordering::Acquire)
                    || !reconnect(shared)
                {
                    warn!(peer = %shared.addr, %err, "peer write failed");
                    let _ = request.reply_tx.send(Reply::err("request failed"));
                    return;
                }
            }
        }
    }
}

fn reconnect(shared: &Arc<Shared>) -> bool {
    match TcpStream::connect(&shared.addr) {
        Ok(socket) => {
            let reader_socket = match socket.try_clone() {
                Ok(clone) => clone,
                Err(_) => return false,
            };
            if let Ok(mut slot) = shared.socket.lock() {
                *slot = socket;
            } else {
                return false;
            }
            debug!(peer = %shared.addr, "peer connection re-established");
            spawn_reader(Arc::clone(shared), reader_socket);
            true
        }
        Err(err) => {
            warn!(peer = %shared.addr, %err, "peer reconnect failed");
            false
        }
    }
}

fn spawn_reader(shared: Arc<Shared>, socket: TcpStream) {
    let _ = thread::Builder::new()
        .name("carmine-peer-reader".to_owned())
        .spawn(move || {
            for outcome in RespParser::new(BufReader::new(socket)) {
                let reply = match outcome {
                    Ok(Payload::Frame(frame)) => frame,
                    Ok(Payload::Protocol(detail)) => Reply::Error(detail),
                    Err(_) => break,
                };
                // FIFO: the oldest writer-confirmed request owns this
                // reply. Blocks briefly when the reply beats the
                // writer's hand-off into the waiting channel.
                let Ok(request) = shared.waiting_rx.recv() else {
                    return;
                };
                if !request.heartbeat {
                    let _ = request.reply_tx.send(reply);
                }
            }
        });
}
