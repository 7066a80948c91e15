//! Session registry: the single owner of every PTY session.
//!
//! Sessions are keyed by [`SessionKey`]. A deterministic key lets a
//! reconnecting client land on the same shell for the same workspace and
//! pane; a forced-new key always gets a fresh one. Sessions leave the
//! registry on process exit, explicit terminate, or idle sweep, all through
//! the same exit path.

use super::buffer::DEFAULT_MAX_BUFFER_SIZE;
use super::listeners::SessionListener;
use super::pty_session::PtySession;
use crate::error::{MuxError, MuxResult};
use crate::identity::SessionKey;
use crate::pty::{PtyBackend, ShellCommand, SpawnSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Exit code reported to listeners when a session is terminated or swept
/// rather than exiting on its own.
pub const EXIT_CODE_TERMINATED: i32 = -1;

/// When the registry holds a session's PTY data subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Subscribe at creation and keep buffering while nobody is attached.
    #[default]
    Always,
    /// Subscribe only while at least one listener is attached.
    WhileAttached,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_buffer_size: usize,
    pub buffer_policy: BufferPolicy,
    /// Hold the replay back this long after attach. Zero delivers it inline.
    pub replay_delay: Duration,
    /// Program to run; `None` picks the host default shell.
    pub shell: Option<ShellCommand>,
    /// Extra environment for every spawned shell.
    pub env: BTreeMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            buffer_policy: BufferPolicy::default(),
            replay_delay: Duration::ZERO,
            shell: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub workspace_path: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Always spawn a new session under a random key.
    pub force_new: bool,
    pub pane_id: Option<String>,
}

impl StartRequest {
    pub fn new(workspace_path: impl Into<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            cols,
            rows,
            force_new: false,
            pane_id: None,
        }
    }

    pub fn pane(mut self, pane_id: impl Into<String>) -> Self {
        self.pane_id = Some(pane_id.into());
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub session_id: SessionKey,
    /// False when an existing live session was reused.
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub skip_replay: bool,
}

/// Point-in-time description of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionKey,
    pub workspace_path: PathBuf,
    pub pane_id: Option<String>,
    pub created_at: SystemTime,
    pub last_activity: SystemTime,
    pub idle_secs: u64,
    pub listener_count: usize,
    pub cols: u16,
    pub rows: u16,
}

type SpawnGates = HashMap<SessionKey, Arc<AsyncMutex<()>>>;

struct Inner {
    backend: Arc<dyn PtyBackend>,
    config: RegistryConfig,
    sessions: Mutex<HashMap<SessionKey, Arc<PtySession>>>,
    /// Serializes start_or_attach per identity.
    gates: Mutex<SpawnGates>,
    next_seq: AtomicU64,
}

/// Cheap to clone; every clone shares the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn PtyBackend>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                sessions: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Reuse the live session for this workspace and pane, or spawn one.
    pub async fn start_or_attach(&self, request: StartRequest) -> MuxResult<StartOutcome> {
        let session_id = if request.force_new {
            SessionKey::fresh()
        } else {
            SessionKey::deterministic(&request.workspace_path, request.pane_id.as_deref())
        };

        let _gate = SpawnGate::acquire(&self.inner, &session_id).await;

        if !request.force_new {
            if let Some(session) = self.inner.live(session_id.as_str()) {
                session.touch();
                debug!(session_id = %session_id, "reusing live session");
                return Ok(StartOutcome {
                    session_id,
                    is_new: false,
                });
            }
        }

        self.spawn_session(session_id, request).await
    }

    async fn spawn_session(
        &self,
        session_id: SessionKey,
        request: StartRequest,
    ) -> MuxResult<StartOutcome> {
        validate_request(&request)?;
        let spec = self.spawn_spec(&session_id, &request);

        let backend = Arc::clone(&self.inner.backend);
        let process = tokio::task::spawn_blocking(move || backend.spawn(&spec))
            .await
            .map_err(|e| MuxError::Spawn(format!("spawn task failed: {e}")))?
            .map_err(|e| {
                warn!(
                    workspace = %request.workspace_path.display(),
                    error = %e,
                    "failed to spawn session"
                );
                match e {
                    MuxError::Spawn(_) => e,
                    other => MuxError::Spawn(other.to_string()),
                }
            })?;

        let pid = process.pid();
        let session = Arc::new(PtySession::new(
            session_id.clone(),
            request.workspace_path.clone(),
            request.pane_id.clone(),
            self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            process,
            self.inner.config.buffer_policy,
            self.inner.config.max_buffer_size,
            (request.cols, request.rows),
        ));

        self.inner
            .sessions()
            .insert(session_id.clone(), Arc::clone(&session));

        if self.inner.config.buffer_policy == BufferPolicy::Always {
            session.subscribe_data();
        }

        let weak_inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let weak_session = Arc::downgrade(&session);
        let exit_subscription = session.process().on_exit(Box::new(move |code| {
            if let (Some(inner), Some(session)) = (weak_inner.upgrade(), weak_session.upgrade()) {
                inner.finish(&session, code, false);
            }
        }));
        session.set_exit_subscription(exit_subscription);

        info!(
            session_id = %session_id,
            workspace = %request.workspace_path.display(),
            pane_id = ?request.pane_id,
            pid = ?pid,
            "session created"
        );
        Ok(StartOutcome {
            session_id,
            is_new: true,
        })
    }

    fn spawn_spec(&self, session_id: &SessionKey, request: &StartRequest) -> SpawnSpec {
        let shell = self
            .inner
            .config
            .shell
            .clone()
            .unwrap_or_else(ShellCommand::host_default);

        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("PANEMUX_SESSION_ID".to_string(), session_id.to_string()),
        ];
        env.extend(
            self.inner
                .config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        SpawnSpec {
            program: shell.program,
            args: shell.args,
            cwd: request.workspace_path.clone(),
            cols: request.cols,
            rows: request.rows,
            env,
        }
    }

    /// Send input to a session's PTY.
    pub fn write(&self, session_id: &str, data: &[u8]) -> MuxResult<()> {
        self.inner.require(session_id)?.write(data)
    }

    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> MuxResult<()> {
        self.inner.require(session_id)?.resize(cols, rows)
    }

    /// Attach (or replace) the listener `listener_id`. Returns false if the
    /// session does not exist.
    pub fn attach_listener(
        &self,
        session_id: &str,
        listener_id: &str,
        listener: Arc<dyn SessionListener>,
        options: AttachOptions,
    ) -> bool {
        match self.inner.live(session_id) {
            Some(session) => session.attach(
                listener_id,
                listener,
                options.skip_replay,
                self.inner.config.replay_delay,
            ),
            None => false,
        }
    }

    pub fn detach_listener(&self, session_id: &str, listener_id: &str) -> bool {
        self.inner
            .live(session_id)
            .map(|session| session.detach(listener_id))
            .unwrap_or(false)
    }

    /// Like [`SessionRegistry::detach_listener`], but leaves the slot alone
    /// when `listener_id` has since been re-attached with a different
    /// listener. Lets a stale connection clean up without evicting the
    /// connection that replaced it.
    pub fn detach_listener_if(
        &self,
        session_id: &str,
        listener_id: &str,
        listener: &Arc<dyn SessionListener>,
    ) -> bool {
        self.inner
            .live(session_id)
            .map(|session| session.detach_if(listener_id, listener))
            .unwrap_or(false)
    }

    /// Kill a session and notify its listeners. False if it was already gone.
    pub fn terminate(&self, session_id: &str) -> bool {
        let session = self.inner.sessions().get(session_id).cloned();
        match session {
            Some(session) => self.inner.finish(&session, EXIT_CODE_TERMINATED, true),
            None => false,
        }
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.inner.live(session_id).is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        self.inner.live(session_id).map(|s| s.summary())
    }

    /// Every live session, oldest first.
    pub fn get_all(&self) -> Vec<SessionSummary> {
        self.inner
            .all()
            .iter()
            .map(|session| session.summary())
            .collect()
    }

    /// The replay a listener would receive right now, without attaching.
    pub fn snapshot(&self, session_id: &str) -> Option<Vec<u8>> {
        self.inner.live(session_id).map(|s| s.replay())
    }

    /// Terminate every session idle for longer than `timeout`.
    pub fn sweep_idle(&self, timeout: Duration) -> Vec<SessionKey> {
        self.sweep_idle_at(Instant::now(), timeout)
    }

    /// [`SessionRegistry::sweep_idle`] measured against `now`.
    pub fn sweep_idle_at(&self, now: Instant, timeout: Duration) -> Vec<SessionKey> {
        let mut swept = Vec::new();
        for session in self.inner.all() {
            let idle = now
                .checked_duration_since(session.last_activity())
                .unwrap_or_default();
            if idle > timeout && self.inner.finish(&session, EXIT_CODE_TERMINATED, true) {
                info!(session_id = %session.id, idle_secs = idle.as_secs(), "idle session swept");
                swept.push(session.id.clone());
            }
        }
        swept
    }

    /// Terminate every session rooted at `workspace_path`.
    pub fn terminate_workspace(&self, workspace_path: &Path) -> usize {
        self.inner
            .all()
            .iter()
            .filter(|s| s.workspace_path == workspace_path)
            .filter(|s| self.inner.finish(s, EXIT_CODE_TERMINATED, true))
            .count()
    }

    pub fn terminate_all(&self) -> usize {
        self.inner
            .all()
            .iter()
            .filter(|s| self.inner.finish(s, EXIT_CODE_TERMINATED, true))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<PtySession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live(&self, session_id: &str) -> Option<Arc<PtySession>> {
        self.sessions()
            .get(session_id)
            .filter(|s| !s.has_exited())
            .cloned()
    }

    fn require(&self, session_id: &str) -> MuxResult<Arc<PtySession>> {
        self.live(session_id)
            .ok_or_else(|| MuxError::SessionNotFound(session_id.to_string()))
    }

    fn all(&self) -> Vec<Arc<PtySession>> {
        let mut sessions: Vec<_> = self
            .sessions()
            .values()
            .filter(|s| !s.has_exited())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
    }

    /// The one exit path. Runs at most once per session.
    fn finish(&self, session: &Arc<PtySession>, code: i32, kill: bool) -> bool {
        if !session.mark_exited() {
            return false;
        }

        {
            let mut sessions = self.sessions();
            if sessions
                .get(&session.id)
                .is_some_and(|current| Arc::ptr_eq(current, session))
            {
                sessions.remove(&session.id);
            }
        }

        session.shutdown(code, kill);
        if kill {
            info!(session_id = %session.id, "session terminated");
        } else {
            info!(session_id = %session.id, code, "session exited");
        }
        true
    }
}

/// Held across one start_or_attach. Removes its table entry on drop when
/// nobody else is queued on it.
struct SpawnGate {
    inner: Arc<Inner>,
    key: SessionKey,
    gate: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl SpawnGate {
    async fn acquire(inner: &Arc<Inner>, key: &SessionKey) -> Self {
        let gate = {
            let mut gates = inner.gates.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        let held = Arc::clone(&gate).lock_owned().await;
        Self {
            inner: Arc::clone(inner),
            key: key.clone(),
            gate,
            held: Some(held),
        }
    }
}

impl Drop for SpawnGate {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut gates = self.inner.gates.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the table, one here.
        if Arc::strong_count(&self.gate) == 2
            && gates
                .get(&self.key)
                .is_some_and(|g| Arc::ptr_eq(g, &self.gate))
        {
            gates.remove(&self.key);
        }
    }
}

fn validate_request(request: &StartRequest) -> MuxResult<()> {
    if request.cols == 0 || request.rows == 0 {
        return Err(MuxError::Spawn(format!(
            "invalid terminal size {}x{}",
            request.cols, request.rows
        )));
    }
    if !request.workspace_path.is_dir() {
        return Err(MuxError::Spawn(format!(
            "working directory {} does not exist",
            request.workspace_path.display()
        )));
    }
    Ok(())
}
