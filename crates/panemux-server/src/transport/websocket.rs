//! WebSocket relay listener using tokio-tungstenite.
//!
//! Each binary WebSocket message carries exactly one CBOR-encoded
//! [`panemux_core::Message`]; no length prefix is needed.

use futures_util::{SinkExt, StreamExt};
use panemux_core::codec::MAX_FRAME_SIZE;
use panemux_core::{MuxError, MuxResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// An accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Bind the relay and accept connections in the background.
///
/// Returns the bound address (useful with port 0) and a receiver yielding
/// connections that completed the WebSocket handshake.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> MuxResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| MuxError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| MuxError::Transport(format!("WS local_addr failed: {e}")))?;

    info!(addr = %local_addr, "WebSocket relay listening");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                return;
            }
        }
    });

    Ok((local_addr, rx))
}

pub async fn ws_send_binary(ws: &mut WebSocketStream<TcpStream>, data: &[u8]) -> MuxResult<()> {
    ws.send(WsMessage::Binary(data.to_vec().into()))
        .await
        .map_err(|e| MuxError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next binary message.
///
/// Returns `None` once the peer closes. Text frames are ignored and pings are
/// answered. Payloads over [`MAX_FRAME_SIZE`] are rejected.
pub async fn ws_recv_binary(ws: &mut WebSocketStream<TcpStream>) -> MuxResult<Option<Vec<u8>>> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => {
                if data.len() > MAX_FRAME_SIZE {
                    return Err(MuxError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        data.len()
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Some(Ok(WsMessage::Close(_))) => return Ok(None),
            Some(Ok(WsMessage::Ping(payload))) => {
                let _ = ws.send(WsMessage::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(MuxError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panemux_core::{cbor_decode, cbor_encode, Message};

    #[tokio::test]
    async fn binary_round_trip() {
        let (addr, mut rx) = start_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
                .await
                .unwrap();
            let ping = cbor_encode(&Message::Ping { id: 5 }).unwrap();
            ws.send(WsMessage::Binary(ping.into())).await.unwrap();
            loop {
                match ws.next().await.unwrap().unwrap() {
                    WsMessage::Binary(data) => break cbor_decode::<Message>(&data).unwrap(),
                    _ => continue,
                }
            }
        });

        let mut conn = rx.recv().await.unwrap();
        let inbound = ws_recv_binary(&mut conn.ws_stream).await.unwrap().unwrap();
        let msg: Message = cbor_decode(&inbound).unwrap();
        assert_eq!(msg, Message::Ping { id: 5 });

        let reply = cbor_encode(&Message::Pong { id: 5 }).unwrap();
        ws_send_binary(&mut conn.ws_stream, &reply).await.unwrap();
        assert_eq!(client.await.unwrap(), Message::Pong { id: 5 });
    }
}
