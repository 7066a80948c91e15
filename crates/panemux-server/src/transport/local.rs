//! Local IPC over a Unix domain socket.
//!
//! The stream carries length-prefixed CBOR frames in both directions
//! (`frame_encode` / [`FrameDecoder`]).

use panemux_core::{frame_encode, FrameDecoder, Message, MuxError, MuxResult};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const READ_BUF_SIZE: usize = 16 * 1024;

pub struct LocalConnection {
    pub stream: UnixStream,
}

/// Bind the socket (replacing a stale one) and accept in the background.
pub async fn start_listener(path: &Path) -> MuxResult<mpsc::Receiver<LocalConnection>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| MuxError::Transport(format!("bind {} failed: {e}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    info!(path = %path.display(), "local socket listening");

    let (tx, rx) = mpsc::channel::<LocalConnection>(64);
    let socket_path: PathBuf = path.to_path_buf();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!(path = %socket_path.display(), "local connection accepted");
                    if tx.send(LocalConnection { stream }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "local accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Reads whole messages off the read half of a local stream.
pub struct FrameReader {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    ready: std::collections::VecDeque<Message>,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            ready: std::collections::VecDeque::new(),
            buf: vec![0u8; READ_BUF_SIZE],
        }
    }

    /// Next decoded message, or `None` at EOF.
    ///
    /// Cancel safe: a partially read frame stays in the decoder.
    pub async fn next(&mut self) -> MuxResult<Option<Message>> {
        loop {
            if let Some(msg) = self.ready.pop_front() {
                return Ok(Some(msg));
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.ready.extend(self.decoder.feed::<Message>(&self.buf[..n])?);
        }
    }
}

pub async fn send_frame(writer: &mut OwnedWriteHalf, msg: &Message) -> MuxResult<()> {
    let frame = frame_encode(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| MuxError::Transport(format!("local write failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_split_reads() {
        let (client, server) = UnixStream::pair().unwrap();
        let (server_read, _server_write) = server.into_split();
        let (_client_read, mut client_write) = client.into_split();
        let mut reader = FrameReader::new(server_read);

        let mut bytes = frame_encode(&Message::Ping { id: 1 }).unwrap();
        bytes.extend(frame_encode(&Message::List).unwrap());
        let (head, tail) = bytes.split_at(3);
        client_write.write_all(head).await.unwrap();
        client_write.write_all(tail).await.unwrap();
        drop(client_write);

        assert_eq!(reader.next().await.unwrap(), Some(Message::Ping { id: 1 }));
        assert_eq!(reader.next().await.unwrap(), Some(Message::List));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");
        std::fs::write(&path, b"stale").unwrap();

        let mut rx = start_listener(&path).await.unwrap();
        let client = UnixStream::connect(&path).await.unwrap();
        let (_, mut write) = client.into_split();
        send_frame(&mut write, &Message::Ping { id: 2 }).await.unwrap();

        let conn = rx.recv().await.unwrap();
        let (read, _) = conn.stream.into_split();
        let mut reader = FrameReader::new(read);
        assert_eq!(reader.next().await.unwrap(), Some(Message::Ping { id: 2 }));
    }
}
