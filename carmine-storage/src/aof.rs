//! Append-only persistence.
//!
//! Mutating commands are fed as `(db_index, argv)` through a channel to a
//! single writer thread, which emits them as RESP arrays with `SELECT`
//! lines whenever the database index changes. Emission is at-most-once
//! and ordered. On startup the file is replayed through the engine's
//! normal exec path before the hook is armed, so replay never re-appends.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use tracing::{error, info, warn};

use carmine_common::error::{CarmineError, CarmineResult};
use carmine_resp::{CmdLine, Engine, Payload, Reply, RespParser, Session};

enum AofMessage {
    Cmd { db_index: usize, line: CmdLine },
    Shutdown,
}

/// Handle to the append-only writer.
pub struct Aof {
    path: String,
    tx: Sender<AofMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Aof {
    /// Opens (creating if needed) the append-only file and starts the
    /// writer thread.
    ///
    /// # Errors
    ///
    /// Returns `CarmineError::Io` when the file cannot be opened.
    pub fn open(path: &str) -> CarmineResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| CarmineError::Io(format!("open append-only file {path}: {err}")))?;
        let (tx, rx) = unbounded::<AofMessage>();
        let worker = thread::Builder::new()
            .name("carmine-aof".to_owned())
            .spawn(move || {
                let mut file = file;
                let mut current_db = 0_usize;
                while let Ok(message) = rx.recv() {
                    match message {
                        AofMessage::Cmd { db_index, line } => {
                            write_record(&mut file, &mut current_db, db_index, &line);
                        }
                        AofMessage::Shutdown => break,
                    }
                }
                let _ = file.sync_all();
            })
            .map_err(|err| CarmineError::Io(format!("spawn aof writer: {err}")))?;
        Ok(Self {
            path: path.to_owned(),
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues one mutating argv for emission.
    pub fn append(&self, db_index: usize, line: CmdLine) {
        let _ = self.tx.send(AofMessage::Cmd { db_index, line });
    }

    /// Replays the file through `engine`'s exec path.
    ///
    /// Replay happens before the append hook is armed, so the commands do
    /// not echo back into the file.
    pub fn load(&self, engine: &dyn Engine) {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path, %err, "append-only file not readable; starting empty");
                return;
            }
        };
        let mut session = Session::detached(0);
        let mut replayed = 0_u64;
        for outcome in RespParser::new(BufReader::new(file)) {
            match outcome {
                Ok(payload @ Payload::Frame(_)) => {
                    let Some(line) = payload.into_cmd_line() else {
                        warn!("skipping non-command frame in append-only file");
                        continue;
                    };
                    let reply = engine.exec(&mut session, line);
                    if reply.is_error() {
                        error!(?reply, "append-only replay command failed");
                    } else {
                        replayed += 1;
                    }
                }
                Ok(Payload::Protocol(detail)) => {
                    error!(%detail, "malformed frame in append-only file");
                }
                Err(err) => {
                    error!(%err, "truncated append-only file");
                    break;
                }
            }
        }
        info!(path = %self.path, replayed, "append-only replay finished");
    }

    /// Stops the writer, flushing everything queued so far.
    pub fn close(&self) {
        let _ = self.tx.send(AofMessage::Shutdown);
        if let Ok(mut slot) = self.worker.lock()
            && let Some(worker) = slot.take()
        {
            let _ = worker.join();
        }
    }
}

fn write_record(file: &mut File, current_db: &mut usize, db_index: usize, line: &CmdLine) {
    if db_index != *current_db {
        let select = Reply::multi_bulk(vec![
            b"SELECT".to_vec(),
            db_index.to_string().into_bytes(),
        ]);
        if let Err(err) = file.write_all(&select.to_bytes()) {
            error!(%err, "append-only SELECT write failed");
            return;
        }
        *current_db = db_index;
    }
    let record = Reply::multi_bulk(line.clone());
    if let Err(err) = file.write_all(&record.to_bytes()) {
        error!(%err, "append-only record write failed");
    }
}
