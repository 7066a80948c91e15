//! PTY backend on top of portable-pty.
//!
//! Each process gets two OS threads: a reader that blocks on the PTY master
//! and emits chunks exactly as read, and a waiter that blocks on the child
//! and fires the exit event. The reader starts with the first data
//! subscription so nothing is read before someone can receive it.

use super::{
    DataCallback, DataSubscribers, ExitCallback, ExitSubscribers, PtyBackend, PtyProcess,
    SpawnSpec, Subscription,
};
use crate::error::{MuxError, MuxResult};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the waiter gives the reader to drain trailing output after the
/// child exits, so the exit event does not overtake the last chunks.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Spawns real shells through the host's native PTY system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, spec: &SpawnSpec) -> MuxResult<Arc<dyn PtyProcess>> {
        let pty: Arc<dyn PtyProcess> = NativePty::spawn(spec)?;
        Ok(pty)
    }
}

/// Reader half waiting for its first subscriber.
struct PendingReader {
    reader: Box<dyn Read + Send>,
    done_tx: mpsc::Sender<()>,
}

/// A managed portable-pty child.
pub struct NativePty {
    /// The master for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    reader: Mutex<Option<PendingReader>>,
    data: Arc<DataSubscribers>,
    exit: Arc<ExitSubscribers>,
    pid: Option<u32>,
}

impl NativePty {
    /// Open a PTY and start `spec.program` inside it.
    pub fn spawn(spec: &SpawnSpec) -> MuxResult<Arc<Self>> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| MuxError::Spawn(format!("failed to spawn {}: {e}", spec.program)))?;
        // Only the child may hold the slave, otherwise the reader never sees EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| MuxError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| MuxError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let pid = child.process_id();
        let killer = child.clone_killer();
        let (done_tx, done_rx) = mpsc::channel();

        let pty = Arc::new(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            reader: Mutex::new(Some(PendingReader { reader, done_tx })),
            data: Arc::new(DataSubscribers::default()),
            exit: Arc::new(ExitSubscribers::default()),
            pid,
        });

        spawn_waiter(child, done_rx, Arc::clone(&pty.exit), pid)?;
        info!(
            program = %spec.program,
            cwd = %spec.cwd.display(),
            cols = spec.cols,
            rows = spec.rows,
            pid = ?pid,
            "PTY spawned"
        );
        Ok(pty)
    }

    fn start_reader(&self) {
        let pending = match self.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(PendingReader { reader, done_tx }) = pending else {
            return;
        };

        let data = Arc::clone(&self.data);
        let name = format!("pty-read-{}", self.pid.unwrap_or_default());
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            read_loop(reader, &data);
            drop(done_tx);
        });
        if let Err(e) = spawned {
            error!(error = %e, pid = ?self.pid, "failed to start PTY reader thread");
        }
    }
}

impl PtyProcess for NativePty {
    fn write(&self, data: &[u8]) -> MuxResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| MuxError::Pty("PTY writer lock poisoned".into()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| MuxError::Pty(format!("PTY write failed: {e}")))
    }

    fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| MuxError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| MuxError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, pid = ?self.pid, "PTY resized");
        Ok(())
    }

    fn kill(&self) -> MuxResult<()> {
        if self.exit.code().is_some() {
            return Ok(());
        }
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| MuxError::Pty("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| MuxError::Pty(format!("kill failed: {e}")))
    }

    fn on_data(&self, callback: DataCallback) -> Subscription {
        let sub = self.data.subscribe(callback);
        self.start_reader();
        sub
    }

    fn on_exit(&self, callback: ExitCallback) -> Subscription {
        self.exit.subscribe(callback)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.exit.code().is_none() {
            if let Ok(mut killer) = self.killer.lock() {
                let _ = killer.kill();
            }
        }
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, data: &DataSubscribers) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return, // EOF
            Ok(n) => data.emit(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return, // EIO once the child side is gone
        }
    }
}

fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    reader_done: mpsc::Receiver<()>,
    exit: Arc<ExitSubscribers>,
    pid: Option<u32>,
) -> MuxResult<()> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", pid.unwrap_or_default()))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
                Err(e) => {
                    warn!(error = %e, pid = ?pid, "waiting on PTY child failed");
                    -1
                }
            };
            // Disconnects as soon as the reader thread finishes.
            let _ = reader_done.recv_timeout(READER_DRAIN_TIMEOUT);
            info!(code, pid = ?pid, "PTY child exited");
            exit.fire(code);
        })
        .map(|_| ())
        .map_err(|e| MuxError::Spawn(format!("failed to start PTY wait thread: {e}")))
}
