//! One live PTY plus its replay buffer and listeners.

use super::buffer::OutputBuffer;
use super::listeners::{notify_exit, ListenerSet, SessionListener};
use super::registry::{BufferPolicy, SessionSummary};
use crate::error::{MuxError, MuxResult};
use crate::identity::SessionKey;
use crate::pty::{PtyProcess, Subscription};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Mutable per-session state. Everything that listeners observe changes
/// under this one lock, which is what keeps replay ahead of live output.
struct SessionState {
    buffer: OutputBuffer,
    listeners: ListenerSet,
    data_subscription: Option<Subscription>,
    exit_subscription: Option<Subscription>,
    last_activity: Instant,
    last_activity_wall: SystemTime,
    cols: u16,
    rows: u16,
}

pub(crate) struct PtySession {
    pub(crate) id: SessionKey,
    pub(crate) workspace_path: PathBuf,
    pub(crate) pane_id: Option<String>,
    /// Creation order within the registry.
    pub(crate) seq: u64,
    created_at: SystemTime,
    policy: BufferPolicy,
    process: Arc<dyn PtyProcess>,
    exited: AtomicBool,
    state: Mutex<SessionState>,
}

impl PtySession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionKey,
        workspace_path: PathBuf,
        pane_id: Option<String>,
        seq: u64,
        process: Arc<dyn PtyProcess>,
        policy: BufferPolicy,
        max_buffer_size: usize,
        (cols, rows): (u16, u16),
    ) -> Self {
        let now = Instant::now();
        let wall = SystemTime::now();
        Self {
            id,
            workspace_path,
            pane_id,
            seq,
            created_at: wall,
            policy,
            process,
            exited: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                buffer: OutputBuffer::new(max_buffer_size),
                listeners: ListenerSet::new(),
                data_subscription: None,
                exit_subscription: None,
                last_activity: now,
                last_activity_wall: wall,
                cols,
                rows,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // A listener panic is caught before it can poison the lock, so the
        // state is still consistent if we ever see a poisoned guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn process(&self) -> &Arc<dyn PtyProcess> {
        &self.process
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Flip to exited. Only the first caller gets `true`.
    pub(crate) fn mark_exited(&self) -> bool {
        !self.exited.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn touch(&self) {
        let mut state = self.state();
        state.last_activity = Instant::now();
        state.last_activity_wall = SystemTime::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.state().last_activity
    }

    /// Take the PTY data subscription if nobody holds it yet.
    pub(crate) fn subscribe_data(self: &Arc<Self>) {
        let mut state = self.state();
        self.ensure_data_subscription(&mut state);
    }

    fn ensure_data_subscription(self: &Arc<Self>, state: &mut SessionState) {
        if state.data_subscription.is_some() || self.has_exited() {
            return;
        }
        let weak = Arc::downgrade(self);
        let subscription = self.process.on_data(Arc::new(move |chunk: &[u8]| {
            if let Some(session) = weak.upgrade() {
                session.ingest(chunk);
            }
        }));
        state.data_subscription = Some(subscription);
        debug!(session_id = %self.id, "data stream subscribed");
    }

    /// Drop the data subscription when the policy says output is only
    /// wanted while someone is attached.
    fn release_idle_subscription(&self, state: &mut SessionState) {
        if self.policy == BufferPolicy::WhileAttached && state.listeners.is_empty() {
            if let Some(subscription) = state.data_subscription.take() {
                subscription.dispose();
                debug!(session_id = %self.id, "data stream released");
            }
        }
    }

    pub(crate) fn set_exit_subscription(&self, subscription: Subscription) {
        if self.has_exited() {
            return;
        }
        self.state().exit_subscription = Some(subscription);
    }

    /// Handle one chunk from the PTY: buffer it, then fan it out.
    fn ingest(&self, chunk: &[u8]) {
        let mut state = self.state();
        if self.has_exited() {
            return;
        }
        state.buffer.append(chunk);
        let failed = state.listeners.fanout(chunk);
        if failed.is_empty() {
            return;
        }
        for listener_id in &failed {
            warn!(session_id = %self.id, listener_id = %listener_id, "listener delivery failed, detached");
        }
        self.release_idle_subscription(&mut state);
    }

    /// Register a listener and hand it the replay. With a non-zero
    /// `replay_delay` (and a tokio runtime to time it) the replay and any
    /// chunks arriving meanwhile are held back and flushed together later.
    pub(crate) fn attach(
        self: &Arc<Self>,
        listener_id: &str,
        listener: Arc<dyn SessionListener>,
        skip_replay: bool,
        replay_delay: Duration,
    ) -> bool {
        let mut state = self.state();
        if self.has_exited() {
            return false;
        }

        let replay = if skip_replay {
            Vec::new()
        } else {
            state.buffer.replay()
        };
        let runtime = tokio::runtime::Handle::try_current().ok();

        match runtime {
            Some(handle) if !replay.is_empty() && !replay_delay.is_zero() => {
                let (generation, replaced) =
                    state.listeners.insert(listener_id, listener, Some(vec![replay]));
                let weak = Arc::downgrade(self);
                let id = listener_id.to_string();
                handle.spawn(async move {
                    tokio::time::sleep(replay_delay).await;
                    if let Some(session) = weak.upgrade() {
                        session.flush_deferred(&id, generation);
                    }
                });
                log_attach(&self.id, listener_id, replaced, true);
            }
            _ => {
                let (_, replaced) = state.listeners.insert(listener_id, listener, None);
                if !replay.is_empty() && !state.listeners.deliver_to(listener_id, &replay) {
                    warn!(session_id = %self.id, listener_id = %listener_id, "replay delivery failed, detached");
                }
                log_attach(&self.id, listener_id, replaced, false);
            }
        }

        state.last_activity = Instant::now();
        state.last_activity_wall = SystemTime::now();
        if state.listeners.is_empty() {
            self.release_idle_subscription(&mut state);
        } else {
            self.ensure_data_subscription(&mut state);
        }
        true
    }

    fn flush_deferred(&self, listener_id: &str, generation: u64) {
        let mut state = self.state();
        if self.has_exited() {
            return;
        }
        if !state.listeners.release(listener_id, generation) {
            warn!(session_id = %self.id, listener_id = %listener_id, "deferred replay delivery failed, detached");
            self.release_idle_subscription(&mut state);
        }
    }

    pub(crate) fn detach(&self, listener_id: &str) -> bool {
        let mut state = self.state();
        let removed = state.listeners.remove(listener_id);
        if removed {
            debug!(session_id = %self.id, listener_id = %listener_id, "listener detached");
            self.release_idle_subscription(&mut state);
        }
        removed
    }

    /// Detach `listener_id` only if `listener` still owns that slot.
    pub(crate) fn detach_if(
        &self,
        listener_id: &str,
        listener: &Arc<dyn SessionListener>,
    ) -> bool {
        let mut state = self.state();
        let removed = state.listeners.remove_if(listener_id, listener);
        if removed {
            debug!(session_id = %self.id, listener_id = %listener_id, "listener detached");
            self.release_idle_subscription(&mut state);
        }
        removed
    }

    pub(crate) fn write(&self, data: &[u8]) -> MuxResult<()> {
        self.process.write(data)?;
        self.touch();
        Ok(())
    }

    pub(crate) fn resize(&self, cols: u16, rows: u16) -> MuxResult<()> {
        if cols == 0 || rows == 0 {
            return Err(MuxError::Pty(format!("invalid size {cols}x{rows}")));
        }
        self.process.resize(cols, rows)?;
        let mut state = self.state();
        state.cols = cols;
        state.rows = rows;
        state.last_activity = Instant::now();
        state.last_activity_wall = SystemTime::now();
        Ok(())
    }

    pub(crate) fn replay(&self) -> Vec<u8> {
        self.state().buffer.replay()
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            id: self.id.clone(),
            workspace_path: self.workspace_path.clone(),
            pane_id: self.pane_id.clone(),
            created_at: self.created_at,
            last_activity: state.last_activity_wall,
            idle_secs: state.last_activity.elapsed().as_secs(),
            listener_count: state.listeners.len(),
            cols: state.cols,
            rows: state.rows,
        }
    }

    /// Tear down after [`PtySession::mark_exited`] succeeded: release both
    /// subscriptions, optionally kill the process, then tell every listener.
    pub(crate) fn shutdown(&self, code: i32, kill: bool) {
        let (data, exit, listeners) = {
            let mut state = self.state();
            (
                state.data_subscription.take(),
                state.exit_subscription.take(),
                state.listeners.drain(),
            )
        };
        drop(data);
        drop(exit);

        if kill {
            if let Err(e) = self.process.kill() {
                warn!(session_id = %self.id, error = %e, "failed to kill PTY");
            }
        }
        for (_, listener) in listeners {
            notify_exit(listener.as_ref(), code);
        }
    }
}

fn log_attach(session_id: &SessionKey, listener_id: &str, replaced: bool, deferred: bool) {
    debug!(
        session_id = %session_id,
        listener_id = %listener_id,
        replaced,
        deferred,
        "listener attached"
    );
}
