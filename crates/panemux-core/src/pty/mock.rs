//! In-memory PTY backend for tests and embedding.
//!
//! [`MockPtyBackend`] records every spawn; each [`MockPty`] records writes,
//! resizes and kills, and lets the test push output and exit events as if
//! they came from a real process.

use super::{
    DataCallback, DataSubscribers, ExitCallback, ExitSubscribers, PtyBackend, PtyProcess,
    SpawnSpec, Subscription,
};
use crate::error::{MuxError, MuxResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Exit code a mock reports after [`PtyProcess::kill`], like SIGKILL's 128 + 9.
pub const MOCK_KILL_EXIT_CODE: i32 = 137;

#[derive(Default)]
pub struct MockPtyBackend {
    spawned: Mutex<Vec<(SpawnSpec, Arc<MockPty>)>>,
    fail_next: Mutex<Option<String>>,
}

impl MockPtyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next spawn fail with the given reason.
    pub fn fail_next_spawn(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(reason.into());
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// The most recently spawned process.
    pub fn last(&self) -> Option<Arc<MockPty>> {
        self.spawned
            .lock()
            .ok()
            .and_then(|s| s.last().map(|(_, pty)| Arc::clone(pty)))
    }

    /// Spawned process by spawn order.
    pub fn nth(&self, index: usize) -> Option<Arc<MockPty>> {
        self.spawned
            .lock()
            .ok()
            .and_then(|s| s.get(index).map(|(_, pty)| Arc::clone(pty)))
    }

    pub fn last_spec(&self) -> Option<SpawnSpec> {
        self.spawned
            .lock()
            .ok()
            .and_then(|s| s.last().map(|(spec, _)| spec.clone()))
    }
}

impl PtyBackend for MockPtyBackend {
    fn spawn(&self, spec: &SpawnSpec) -> MuxResult<Arc<dyn PtyProcess>> {
        if let Some(reason) = self.fail_next.lock().ok().and_then(|mut s| s.take()) {
            return Err(MuxError::Spawn(reason));
        }
        let pty = Arc::new(MockPty::new(spec.cols, spec.rows));
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push((spec.clone(), Arc::clone(&pty)));
        }
        Ok(pty)
    }
}

/// A fake process. Output and exit are driven by the test.
pub struct MockPty {
    data: Arc<DataSubscribers>,
    exit: Arc<ExitSubscribers>,
    written: Mutex<Vec<u8>>,
    size: Mutex<(u16, u16)>,
    killed: AtomicBool,
}

impl MockPty {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            data: Arc::new(DataSubscribers::default()),
            exit: Arc::new(ExitSubscribers::default()),
            written: Mutex::new(Vec::new()),
            size: Mutex::new((cols, rows)),
            killed: AtomicBool::new(false),
        }
    }

    /// Emit an output chunk to the current data subscribers.
    pub fn emit(&self, chunk: &[u8]) {
        self.data.emit(chunk);
    }

    /// Simulate the process exiting on its own.
    pub fn exit(&self, code: i32) {
        self.exit.fire(code);
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Number of live data subscriptions.
    pub fn data_subscriptions(&self) -> usize {
        self.data.len()
    }

    /// Number of live exit subscriptions.
    pub fn exit_subscriptions(&self) -> usize {
        self.exit.len()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.code().is_some()
    }
}

impl PtyProcess for MockPty {
    fn write(&self, data: &[u8]) -> MuxResult<()> {
        if self.has_exited() {
            return Err(MuxError::Pty("process has exited".into()));
        }
        self.written
            .lock()
            .map_err(|_| MuxError::Pty("mock writer poisoned".into()))?
            .extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        *self
            .size
            .lock()
            .map_err(|_| MuxError::Pty("mock size poisoned".into()))? = (cols, rows);
        Ok(())
    }

    fn kill(&self) -> MuxResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit.fire(MOCK_KILL_EXIT_CODE);
        Ok(())
    }

    fn on_data(&self, callback: DataCallback) -> Subscription {
        self.data.subscribe(callback)
    }

    fn on_exit(&self, callback: ExitCallback) -> Subscription {
        self.exit.subscribe(callback)
    }
}
