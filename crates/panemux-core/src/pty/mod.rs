//! The PTY capability the engine consumes.
//!
//! [`PtyBackend`] spawns processes; [`PtyProcess`] is the per-process handle
//! with write/resize/kill and data/exit subscriptions. The engine never
//! touches the OS directly, so tests run against [`mock::MockPtyBackend`]
//! while the daemon uses [`native::NativePtyBackend`].

pub mod mock;
pub mod native;

use crate::error::MuxResult;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use mock::{MockPty, MockPtyBackend};
pub use native::NativePtyBackend;

/// Receives every output chunk, in order, on the backend's reader thread.
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives the exit code once the process is gone.
pub type ExitCallback = Box<dyn FnOnce(i32) + Send>;

/// Everything a backend needs to start a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

/// A program plus arguments to run inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The login shell appropriate to the host OS.
    ///
    /// Unix: `$SHELL -l`, falling back to `/bin/sh`. Windows: `%COMSPEC%`,
    /// falling back to `powershell.exe`.
    pub fn host_default() -> Self {
        if cfg!(windows) {
            let program =
                std::env::var("COMSPEC").unwrap_or_else(|_| "powershell.exe".to_string());
            Self::new(program, Vec::new())
        } else {
            let program = std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string());
            Self::new(program, vec!["-l".to_string()])
        }
    }
}

/// Spawns PTY-backed processes.
pub trait PtyBackend: Send + Sync {
    /// Start a process. Errors are reported, never panicked.
    fn spawn(&self, spec: &SpawnSpec) -> MuxResult<Arc<dyn PtyProcess>>;
}

/// A running PTY process, owned by exactly one session.
pub trait PtyProcess: Send + Sync {
    /// Write input bytes (keystrokes) to the PTY.
    fn write(&self, data: &[u8]) -> MuxResult<()>;

    fn resize(&self, cols: u16, rows: u16) -> MuxResult<()>;

    /// Ask the process to go away. The exit event still arrives through
    /// any exit subscription that is alive at that point.
    fn kill(&self) -> MuxResult<()>;

    /// Subscribe to output. The subscription ends when the returned handle
    /// is disposed or dropped.
    fn on_data(&self, callback: DataCallback) -> Subscription;

    /// Subscribe to exit. Fires at most once; if the process has already
    /// exited the callback runs immediately on the calling thread.
    fn on_exit(&self, callback: ExitCallback) -> Subscription;

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A disposable subscription handle. Disposal runs exactly once, either
/// through [`Subscription::dispose`] or on drop.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.dispose.is_some())
            .finish()
    }
}

/// Data subscribers of one process. Shared by the native and mock backends.
#[derive(Default)]
pub(crate) struct DataSubscribers {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, DataCallback>>,
}

impl DataSubscribers {
    pub(crate) fn subscribe(self: &Arc<Self>, callback: DataCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, callback);
        }
        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(subs) = weak.upgrade() {
                if let Ok(mut entries) = subs.entries.lock() {
                    entries.remove(&id);
                }
            }
        })
    }

    /// Deliver a chunk to every subscriber. The table lock is released before
    /// any callback runs so callbacks may dispose their own subscription.
    pub(crate) fn emit(&self, chunk: &[u8]) {
        let callbacks: Vec<DataCallback> = match self.entries.lock() {
            Ok(entries) => {
                let mut ids: Vec<&u64> = entries.keys().collect();
                ids.sort();
                ids.into_iter().map(|id| Arc::clone(&entries[id])).collect()
            }
            Err(_) => return,
        };
        for callback in callbacks {
            callback(chunk);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Exit subscribers of one process.
#[derive(Default)]
pub(crate) struct ExitSubscribers {
    state: Mutex<ExitState>,
}

#[derive(Default)]
struct ExitState {
    next_id: u64,
    code: Option<i32>,
    entries: HashMap<u64, ExitCallback>,
}

impl ExitSubscribers {
    pub(crate) fn subscribe(self: &Arc<Self>, callback: ExitCallback) -> Subscription {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return Subscription::noop(),
        };
        let exited = state.code;
        if let Some(code) = exited {
            drop(state);
            callback(code);
            return Subscription::noop();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(id, callback);
        drop(state);

        let weak = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(subs) = weak.upgrade() {
                if let Ok(mut state) = subs.state.lock() {
                    state.entries.remove(&id);
                }
            }
        })
    }

    /// Record the exit code and fire every pending callback. Later calls are
    /// ignored.
    pub(crate) fn fire(&self, code: i32) {
        let callbacks: Vec<ExitCallback> = match self.state.lock() {
            Ok(mut state) => {
                if state.code.is_some() {
                    return;
                }
                state.code = Some(code);
                state.entries.drain().map(|(_, cb)| cb).collect()
            }
            Err(_) => return,
        };
        for callback in callbacks {
            callback(code);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub(crate) fn code(&self) -> Option<i32> {
        self.state.lock().ok().and_then(|s| s.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscription_disposes_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        drop(Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn data_subscribers_unsubscribe_on_drop() {
        let subs = Arc::new(DataSubscribers::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let sub = subs.subscribe(Arc::new(move |chunk: &[u8]| {
            s.lock().unwrap().extend_from_slice(chunk);
        }));
        subs.emit(b"ab");
        drop(sub);
        subs.emit(b"cd");
        assert_eq!(*seen.lock().unwrap(), b"ab");
        assert_eq!(subs.len(), 0);
    }

    #[test]
    fn late_exit_subscriber_fires_immediately() {
        let subs = Arc::new(ExitSubscribers::default());
        subs.fire(3);
        subs.fire(4);
        let code = Arc::new(Mutex::new(None));
        let c = code.clone();
        let _sub = subs.subscribe(Box::new(move |exit| {
            *c.lock().unwrap() = Some(exit);
        }));
        assert_eq!(*code.lock().unwrap(), Some(3));
    }

    #[test]
    fn host_default_shell_is_not_empty() {
        let shell = ShellCommand::host_default();
        assert!(!shell.program.is_empty());
    }
}
