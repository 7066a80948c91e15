//! Core server: binds the transports, accepts connections and runs the idle
//! sweep. Owns the shutdown broadcast.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::transport::websocket;
use panemux_core::{cbor_decode, cbor_encode, Message, MuxResult, SessionRegistry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[cfg(unix)]
use crate::transport::local;

#[cfg(unix)]
type LocalConnection = local::LocalConnection;
#[cfg(not(unix))]
type LocalConnection = std::convert::Infallible;

/// How long connection tasks get to flush `Shutdown` before sessions die.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Listeners that are bound but not yet serving.
pub struct Bound {
    pub ws_addr: Option<SocketAddr>,
    ws_rx: Option<mpsc::Receiver<websocket::WebSocketConnection>>,
    local_rx: Option<mpsc::Receiver<LocalConnection>>,
}

pub struct MuxServer {
    config: ServerConfig,
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<String>,
}

impl MuxServer {
    pub fn new(config: ServerConfig, registry: SessionRegistry) -> Self {
        Self {
            config,
            registry,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind every enabled transport.
    pub async fn bind(&self) -> MuxResult<Bound> {
        let (ws_addr, ws_rx) = match self.config.ws_addr {
            Some(addr) => {
                let (bound, rx) = websocket::start_listener(addr).await?;
                (Some(bound), Some(rx))
            }
            None => (None, None),
        };

        #[cfg(unix)]
        let local_rx = match &self.config.socket_path {
            Some(path) => Some(local::start_listener(path).await?),
            None => None,
        };
        #[cfg(not(unix))]
        let local_rx = {
            if self.config.socket_path.is_some() {
                warn!("local socket is only supported on Unix, skipping");
            }
            None
        };

        Ok(Bound {
            ws_addr,
            ws_rx,
            local_rx,
        })
    }

    pub async fn run(self: Arc<Self>) -> MuxResult<()> {
        let bound = self.bind().await?;
        self.serve(bound).await
    }

    /// Accept connections until every listener closes.
    pub async fn serve(self: Arc<Self>, bound: Bound) -> MuxResult<()> {
        let Bound {
            ws_addr,
            mut ws_rx,
            mut local_rx,
        } = bound;

        if let Some(timeout) = self.config.idle_timeout {
            self.spawn_sweeper(timeout);
        }

        info!(
            ws = ?ws_addr,
            socket = ?self.config.socket_path,
            idle_timeout = ?self.config.idle_timeout,
            "panemux-server ready"
        );

        loop {
            tokio::select! {
                Some(ws_conn) = recv_opt(&mut ws_rx) => {
                    let srv = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_websocket(ws_conn).await {
                            warn!(error = %e, "WebSocket connection error");
                        }
                    });
                }
                Some(local_conn) = recv_opt(&mut local_rx) => {
                    let srv = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = srv.handle_local(local_conn).await {
                            warn!(error = %e, "local connection error");
                        }
                    });
                }
                else => {
                    info!("all listeners closed");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_sweeper(&self, timeout: Duration) {
        let registry = self.registry.clone();
        let period = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = registry.sweep_idle(timeout);
                        if !swept.is_empty() {
                            info!(count = swept.len(), "idle sessions swept");
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }

    /// Tell every client the server is going away, then end all sessions.
    pub async fn shutdown(&self, reason: &str) -> usize {
        info!(reason, "broadcasting shutdown to connected clients");
        let _ = self.shutdown_tx.send(reason.to_string());
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        let terminated = self.registry.terminate_all();
        info!(terminated, "all sessions terminated");
        terminated
    }

    async fn handle_websocket(&self, mut conn: websocket::WebSocketConnection) -> MuxResult<()> {
        let remote = conn.remote_addr;
        debug!(remote = %remote, "WebSocket session loop started");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let mut connection = Connection::new(self.registry.clone(), out_tx);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            tokio::select! {
                reason = shutdown_rx.recv() => {
                    let msg = shutdown_message(reason);
                    if let Ok(payload) = cbor_encode(&msg) {
                        let _ = websocket::ws_send_binary(&mut conn.ws_stream, &payload).await;
                    }
                    break Ok(());
                }

                Some(msg) = out_rx.recv() => {
                    let payload = cbor_encode(&msg)?;
                    if let Err(e) = websocket::ws_send_binary(&mut conn.ws_stream, &payload).await {
                        break Err(e);
                    }
                }

                ws_result = websocket::ws_recv_binary(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(data)) => match cbor_decode::<Message>(&data) {
                            Ok(msg) => connection.handle(msg).await,
                            Err(e) => {
                                let reply = invalid_message(&e.to_string());
                                websocket::ws_send_binary(&mut conn.ws_stream, &cbor_encode(&reply)?).await?;
                            }
                        },
                        Ok(None) => {
                            debug!(remote = %remote, "WebSocket session ended (peer closed)");
                            break Ok(());
                        }
                        Err(e) => {
                            debug!(remote = %remote, error = %e, "WebSocket session ended");
                            break Ok(());
                        }
                    }
                }
            }
        };

        connection.close();
        result
    }

    #[cfg(unix)]
    async fn handle_local(&self, conn: local::LocalConnection) -> MuxResult<()> {
        let (read, mut write) = conn.stream.into_split();
        let mut reader = local::FrameReader::new(read);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let mut connection = Connection::new(self.registry.clone(), out_tx);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let result = loop {
            tokio::select! {
                reason = shutdown_rx.recv() => {
                    let msg = shutdown_message(reason);
                    let _ = local::send_frame(&mut write, &msg).await;
                    break Ok(());
                }

                Some(msg) = out_rx.recv() => {
                    if let Err(e) = local::send_frame(&mut write, &msg).await {
                        break Err(e);
                    }
                }

                next = reader.next() => {
                    match next {
                        Ok(Some(msg)) => connection.handle(msg).await,
                        Ok(None) => {
                            debug!("local session ended (peer closed)");
                            break Ok(());
                        }
                        Err(e) => {
                            // A corrupt frame leaves the stream unsynchronized.
                            let _ = local::send_frame(&mut write, &invalid_message(&e.to_string())).await;
                            break Err(e);
                        }
                    }
                }
            }
        };

        connection.close();
        result
    }

    #[cfg(not(unix))]
    async fn handle_local(&self, conn: LocalConnection) -> MuxResult<()> {
        match conn {}
    }
}

fn shutdown_message(reason: Result<String, broadcast::error::RecvError>) -> Message {
    Message::Shutdown {
        reason: reason.unwrap_or_else(|_| "server shutdown".to_string()),
    }
}

fn invalid_message(detail: &str) -> Message {
    Message::error(
        panemux_core::ErrorCode::InvalidMessage,
        format!("could not decode message: {detail}"),
        None,
    )
}

/// Receive from an optional channel; a missing channel never yields.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
