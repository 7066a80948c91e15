//! Transport adapters: a WebSocket relay for remote clients and a local
//! Unix socket for same-host IPC.

#[cfg(unix)]
pub mod local;
pub mod websocket;
