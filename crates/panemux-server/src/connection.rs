//! Per-connection protocol handling, independent of the transport.
//!
//! A transport decodes inbound [`Message`]s, hands them to
//! [`Connection::handle`] and writes out whatever arrives on the outbound
//! channel. Replies and streamed session output share that one channel, so
//! `Attached` always precedes the replay and `Exit` is the last thing a
//! session sends.

use panemux_core::{
    AttachOptions, DeliveryError, ErrorCode, Message, MuxError, SessionInfo, SessionKey,
    SessionListener, SessionRegistry, SessionSummary, StartRequest, EXIT_CODE_TERMINATED,
    PROTOCOL_VERSION,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type Outbound = mpsc::UnboundedSender<Message>;

/// Largest `data` payload per `Output` message. A replay can be as large as
/// the buffer cap, so it is split to keep every frame under
/// [`panemux_core::codec::MAX_FRAME_SIZE`].
pub const MAX_OUTPUT_CHUNK: usize = 256 * 1024;

/// Forwards one session's output into a connection's outbound queue.
struct ConnectionListener {
    session_id: String,
    outbound: Outbound,
}

impl SessionListener for ConnectionListener {
    fn on_data(&self, chunk: &[u8]) -> Result<(), DeliveryError> {
        for part in chunk.chunks(MAX_OUTPUT_CHUNK) {
            self.outbound
                .send(Message::Output {
                    session_id: self.session_id.clone(),
                    data: part.to_vec(),
                })
                .map_err(|_| DeliveryError::Closed)?;
        }
        Ok(())
    }

    fn on_exit(&self, code: i32) {
        let _ = self.outbound.send(Message::Exit {
            session_id: self.session_id.clone(),
            code,
        });
    }
}

pub struct Connection {
    registry: SessionRegistry,
    /// Listener id for every session this connection attaches.
    client_id: String,
    greeted: bool,
    /// Session id to the listener this connection registered there.
    attached: BTreeMap<String, Arc<dyn SessionListener>>,
    outbound: Outbound,
}

impl Connection {
    pub fn new(registry: SessionRegistry, outbound: Outbound) -> Self {
        Self {
            registry,
            client_id: SessionKey::fresh().to_string(),
            greeted: false,
            attached: BTreeMap::new(),
            outbound,
        }
    }

    fn send(&self, msg: Message) {
        // Only fails once the transport is gone, and then nobody is listening.
        let _ = self.outbound.send(msg);
    }

    /// Process one inbound message.
    pub async fn handle(&mut self, msg: Message) {
        match msg {
            Message::Hello { client_id } => self.hello(client_id),
            Message::Start {
                workspace_path,
                cols,
                rows,
                force_new,
                pane_id,
            } => {
                let request = StartRequest {
                    workspace_path: PathBuf::from(workspace_path),
                    cols,
                    rows,
                    force_new,
                    pane_id,
                };
                self.start(request).await;
            }
            Message::Attach {
                session_id,
                skip_replay,
            } => self.attach(session_id, skip_replay),
            Message::Detach { session_id } => {
                let detached = self.attached.remove(&session_id).is_some_and(|listener| {
                    self.registry.detach_listener_if(&session_id, &self.client_id, &listener)
                });
                if detached {
                    self.send(Message::Detached { session_id });
                } else {
                    self.send(not_found(&session_id));
                }
            }
            Message::Input { session_id, data } => {
                if let Err(e) = self.registry.write(&session_id, &data) {
                    self.send(error_reply(&e, &session_id));
                }
            }
            Message::Resize {
                session_id,
                cols,
                rows,
            } => {
                if let Err(e) = self.registry.resize(&session_id, cols, rows) {
                    self.send(error_reply(&e, &session_id));
                }
            }
            Message::Terminate { session_id } => {
                let was_attached = self.attached.remove(&session_id).is_some();
                if !self.registry.terminate(&session_id) {
                    self.send(not_found(&session_id));
                } else if !was_attached {
                    // Attached connections hear about it through their listener.
                    self.send(Message::Exit {
                        session_id,
                        code: EXIT_CODE_TERMINATED,
                    });
                }
            }
            Message::List => {
                let sessions = self.registry.get_all().iter().map(session_info).collect();
                self.send(Message::Sessions { sessions });
            }
            Message::Ping { id } => self.send(Message::Pong { id }),
            other => {
                warn!(client_id = %self.client_id, msg = ?other, "unexpected message from client");
                self.send(Message::error(
                    ErrorCode::InvalidMessage,
                    "server-to-client message sent by client",
                    None,
                ));
            }
        }
    }

    fn hello(&mut self, client_id: String) {
        self.prune_exited();
        if !self.attached.is_empty() {
            self.send(Message::error(
                ErrorCode::InvalidMessage,
                "hello must precede attach",
                None,
            ));
            return;
        }
        if !client_id.is_empty() {
            self.client_id = client_id;
        }
        self.greeted = true;
        debug!(client_id = %self.client_id, "client identified");
        self.send(Message::Welcome {
            client_id: self.client_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
        });
    }

    async fn start(&mut self, request: StartRequest) {
        let workspace = request.workspace_path.display().to_string();
        match self.registry.start_or_attach(request).await {
            Ok(outcome) => {
                info!(
                    client_id = %self.client_id,
                    session_id = %outcome.session_id,
                    is_new = outcome.is_new,
                    "start request served"
                );
                self.send(Message::Started {
                    session_id: outcome.session_id.to_string(),
                    is_new: outcome.is_new,
                });
            }
            Err(e) => {
                warn!(client_id = %self.client_id, workspace = %workspace, error = %e, "start failed");
                self.send(Message::StartFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn attach(&mut self, session_id: String, skip_replay: bool) {
        if !self.registry.has_session(&session_id) {
            self.send(not_found(&session_id));
            return;
        }
        self.send(Message::Attached {
            session_id: session_id.clone(),
        });

        let listener: Arc<dyn SessionListener> = Arc::new(ConnectionListener {
            session_id: session_id.clone(),
            outbound: self.outbound.clone(),
        });
        let attached = self.registry.attach_listener(
            &session_id,
            &self.client_id,
            Arc::clone(&listener),
            AttachOptions { skip_replay },
        );
        if attached {
            self.attached.insert(session_id, listener);
        } else {
            // Exited between the check and the attach.
            self.send(not_found(&session_id));
        }
    }

    /// Forget sessions that ended since they were attached.
    fn prune_exited(&mut self) {
        let registry = &self.registry;
        self.attached.retain(|id, _| registry.has_session(id));
    }

    /// Detach every listener this connection registered. Sessions keep
    /// running. A slot that another connection has since taken over under
    /// the same client id is left to that connection.
    pub fn close(&mut self) {
        let detached = std::mem::take(&mut self.attached)
            .into_iter()
            .filter(|(id, listener)| {
                self.registry.detach_listener_if(id, &self.client_id, listener)
            })
            .count();
        debug!(client_id = %self.client_id, greeted = self.greeted, detached, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.attached.is_empty() {
            self.close();
        }
    }
}

fn not_found(session_id: &str) -> Message {
    Message::error(
        ErrorCode::NotFound,
        format!("session not found: {session_id}"),
        Some(session_id),
    )
}

fn error_reply(e: &MuxError, session_id: &str) -> Message {
    let code = if e.is_not_found() {
        ErrorCode::NotFound
    } else {
        ErrorCode::Internal
    };
    Message::error(code, e.to_string(), Some(session_id))
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn session_info(summary: &SessionSummary) -> SessionInfo {
    SessionInfo {
        session_id: summary.id.to_string(),
        workspace_path: summary.workspace_path.display().to_string(),
        pane_id: summary.pane_id.clone(),
        created_at: epoch_millis(summary.created_at),
        last_activity: epoch_millis(summary.last_activity),
        idle_secs: summary.idle_secs,
        listeners: summary.listener_count as u32,
        cols: summary.cols,
        rows: summary.rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panemux_core::pty::MockPtyBackend;
    use panemux_core::{frame_encode, RegistryConfig};

    struct Harness {
        registry: SessionRegistry,
        backend: Arc<MockPtyBackend>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(RegistryConfig::default())
        }

        fn with_config(config: RegistryConfig) -> Self {
            let backend = Arc::new(MockPtyBackend::new());
            let registry = SessionRegistry::new(backend.clone(), config);
            Self { registry, backend }
        }

        fn connect(&self) -> (Connection, mpsc::UnboundedReceiver<Message>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Connection::new(self.registry.clone(), tx), rx)
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn start_msg() -> Message {
        Message::Start {
            workspace_path: std::env::temp_dir().display().to_string(),
            cols: 80,
            rows: 24,
            force_new: false,
            pane_id: None,
        }
    }

    async fn started(conn: &mut Connection, rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        conn.handle(start_msg()).await;
        match drain(rx).pop() {
            Some(Message::Started { session_id, .. }) => session_id,
            other => panic!("expected Started, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_sets_listener_id() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        conn.handle(Message::Hello {
            client_id: "tab-1".into(),
        })
        .await;
        assert_eq!(
            drain(&mut rx),
            vec![Message::Welcome {
                client_id: "tab-1".into(),
                version: PROTOCOL_VERSION.into(),
            }]
        );
        assert_eq!(conn.client_id, "tab-1");
    }

    #[tokio::test]
    async fn attach_replays_then_streams_then_exits() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        let id = started(&mut conn, &mut rx).await;
        h.backend.last().unwrap().emit(b"$ ");

        conn.handle(Message::Attach {
            session_id: id.clone(),
            skip_replay: false,
        })
        .await;
        conn.handle(Message::Input {
            session_id: id.clone(),
            data: b"ls\n".to_vec(),
        })
        .await;
        let pty = h.backend.last().unwrap();
        assert_eq!(pty.written(), b"ls\n");
        pty.emit(b"file\n");
        pty.exit(0);

        assert_eq!(
            drain(&mut rx),
            vec![
                Message::Attached {
                    session_id: id.clone()
                },
                Message::Output {
                    session_id: id.clone(),
                    data: b"$ ".to_vec()
                },
                Message::Output {
                    session_id: id.clone(),
                    data: b"file\n".to_vec()
                },
                Message::Exit {
                    session_id: id,
                    code: 0
                },
            ]
        );
    }

    #[tokio::test]
    async fn reconnect_with_same_client_id_replaces_listener() {
        let h = Harness::new();
        let (mut first, mut first_rx) = h.connect();
        first
            .handle(Message::Hello {
                client_id: "tab".into(),
            })
            .await;
        let id = started(&mut first, &mut first_rx).await;
        first
            .handle(Message::Attach {
                session_id: id.clone(),
                skip_replay: false,
            })
            .await;

        let (mut second, mut second_rx) = h.connect();
        second
            .handle(Message::Hello {
                client_id: "tab".into(),
            })
            .await;
        second
            .handle(Message::Attach {
                session_id: id.clone(),
                skip_replay: false,
            })
            .await;
        drain(&mut first_rx);
        drain(&mut second_rx);

        h.backend.last().unwrap().emit(b"x");
        assert!(drain(&mut first_rx).is_empty());
        assert_eq!(drain(&mut second_rx).len(), 1);
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 1);
    }

    async fn greet(conn: &mut Connection, client_id: &str) {
        conn.handle(Message::Hello {
            client_id: client_id.into(),
        })
        .await;
    }

    async fn attach(conn: &mut Connection, session_id: &str) {
        conn.handle(Message::Attach {
            session_id: session_id.into(),
            skip_replay: false,
        })
        .await;
    }

    #[tokio::test]
    async fn closing_a_stale_connection_keeps_the_replacement() {
        let h = Harness::new();
        let (mut old, mut old_rx) = h.connect();
        greet(&mut old, "tab").await;
        let id = started(&mut old, &mut old_rx).await;
        attach(&mut old, &id).await;

        let (mut new, mut new_rx) = h.connect();
        greet(&mut new, "tab").await;
        attach(&mut new, &id).await;
        drain(&mut new_rx);

        drop(old);
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 1);

        h.backend.last().unwrap().emit(b"after-switch");
        assert_eq!(
            drain(&mut new_rx),
            vec![Message::Output {
                session_id: id.clone(),
                data: b"after-switch".to_vec()
            }]
        );

        drop(new);
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 0);
    }

    #[tokio::test]
    async fn stale_detach_leaves_the_replacement_attached() {
        let h = Harness::new();
        let (mut old, mut old_rx) = h.connect();
        greet(&mut old, "tab").await;
        let id = started(&mut old, &mut old_rx).await;
        attach(&mut old, &id).await;

        let (mut new, _new_rx) = h.connect();
        greet(&mut new, "tab").await;
        attach(&mut new, &id).await;
        drain(&mut old_rx);

        old.handle(Message::Detach {
            session_id: id.clone(),
        })
        .await;
        assert!(matches!(
            drain(&mut old_rx).as_slice(),
            [Message::Error {
                code: ErrorCode::NotFound,
                ..
            }]
        ));
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 1);
    }

    #[tokio::test]
    async fn large_replay_is_split_into_encodable_frames() {
        let h = Harness::with_config(RegistryConfig {
            max_buffer_size: 4_000_000,
            ..RegistryConfig::default()
        });
        let (mut conn, mut rx) = h.connect();
        let id = started(&mut conn, &mut rx).await;
        let history = vec![b'x'; 2_000_000];
        h.backend.last().unwrap().emit(&history);

        attach(&mut conn, &id).await;
        let replies = drain(&mut rx);
        assert_eq!(
            replies[0],
            Message::Attached {
                session_id: id.clone()
            }
        );

        let mut replayed = Vec::new();
        for msg in &replies[1..] {
            frame_encode(msg).unwrap();
            match msg {
                Message::Output { data, .. } => {
                    assert!(data.len() <= MAX_OUTPUT_CHUNK);
                    replayed.extend_from_slice(data);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(replayed, history);
    }

    #[tokio::test]
    async fn hello_is_accepted_again_once_attached_sessions_exit() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        let id = started(&mut conn, &mut rx).await;
        attach(&mut conn, &id).await;

        greet(&mut conn, "early").await;
        assert!(matches!(
            drain(&mut rx).last(),
            Some(Message::Error {
                code: ErrorCode::InvalidMessage,
                ..
            })
        ));

        h.backend.last().unwrap().exit(0);
        drain(&mut rx);
        greet(&mut conn, "later").await;
        assert_eq!(
            drain(&mut rx),
            vec![Message::Welcome {
                client_id: "later".into(),
                version: PROTOCOL_VERSION.into(),
            }]
        );
        assert!(conn.attached.is_empty());
    }

    #[tokio::test]
    async fn close_detaches_but_keeps_session() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        let id = started(&mut conn, &mut rx).await;
        conn.handle(Message::Attach {
            session_id: id.clone(),
            skip_replay: false,
        })
        .await;
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 1);

        drop(conn);
        assert!(h.registry.has_session(&id));
        assert_eq!(h.registry.get(&id).unwrap().listener_count, 0);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        conn.handle(Message::Attach {
            session_id: "nope".into(),
            skip_replay: false,
        })
        .await;
        conn.handle(Message::Input {
            session_id: "nope".into(),
            data: b"x".to_vec(),
        })
        .await;
        conn.handle(Message::Terminate {
            session_id: "nope".into(),
        })
        .await;

        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 3);
        for reply in replies {
            assert!(matches!(
                reply,
                Message::Error {
                    code: ErrorCode::NotFound,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_start_failed() {
        let h = Harness::new();
        h.backend.fail_next_spawn("no shell");
        let (mut conn, mut rx) = h.connect();
        conn.handle(start_msg()).await;
        match drain(&mut rx).as_slice() {
            [Message::StartFailed { reason }] => assert!(reason.contains("no shell")),
            other => panic!("unexpected replies {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminate_and_list() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        let id = started(&mut conn, &mut rx).await;

        conn.handle(Message::List).await;
        match drain(&mut rx).as_slice() {
            [Message::Sessions { sessions }] => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session_id, id);
                assert_eq!((sessions[0].cols, sessions[0].rows), (80, 24));
            }
            other => panic!("unexpected replies {other:?}"),
        }

        conn.handle(Message::Terminate {
            session_id: id.clone(),
        })
        .await;
        assert_eq!(
            drain(&mut rx),
            vec![Message::Exit {
                session_id: id,
                code: EXIT_CODE_TERMINATED
            }]
        );
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn ping_and_stray_server_messages() {
        let h = Harness::new();
        let (mut conn, mut rx) = h.connect();
        conn.handle(Message::Ping { id: 9 }).await;
        conn.handle(Message::Pong { id: 1 }).await;
        let replies = drain(&mut rx);
        assert_eq!(replies[0], Message::Pong { id: 9 });
        assert!(matches!(
            replies[1],
            Message::Error {
                code: ErrorCode::InvalidMessage,
                ..
            }
        ));
    }
}
