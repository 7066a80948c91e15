//! CBOR encoding for the panemux wire protocol.
//!
//! The WebSocket relay sends one CBOR message per binary WebSocket message.
//! Stream transports (the local IPC socket) use length-prefixed frames:
//! `[4-byte big-endian length][CBOR payload]`.

use crate::error::{MuxError, MuxResult};
use std::io::Cursor;

/// Largest payload accepted in either framing (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value as a bare CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> MuxResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> MuxResult<Vec<u8>> {
    let payload = cbor_encode(value)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(MuxError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> MuxResult<T> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(MuxError::InvalidMessage(format!(
            "message too large: {} bytes (max {MAX_FRAME_SIZE})",
            data.len()
        )));
    }
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return every complete decoded message.
    ///
    /// A length prefix above [`MAX_FRAME_SIZE`] is an error; the stream cannot
    /// be resynchronised after that and the caller should drop the connection.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> MuxResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;

            if len > MAX_FRAME_SIZE {
                return Err(MuxError::InvalidMessage(format!(
                    "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let msg: T = cbor_decode(&self.buffer[4..4 + len])?;
            messages.push(msg);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
