//! panemux wire protocol messages.
//!
//! One enum covers both directions; the `type` field carries the variant
//! name in snake_case. Terminal bytes travel as CBOR byte strings.

use serde::{Deserialize, Serialize};

/// Protocol version string.
pub const PROTOCOL_VERSION: &str = "panemux-v1";

/// Machine-readable error category carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The referenced session is gone; clients should start a new one.
    NotFound,
    InvalidMessage,
    Internal,
}

/// Session listing entry sent in [`Message::Sessions`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub workspace_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
    pub idle_secs: u64,
    pub listeners: u32,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ── Client → server ─────────────────────────────────────────────
    /// Names the client. The id becomes the listener id for every session
    /// the connection attaches, so a reconnect replaces the old listener.
    Hello {
        client_id: String,
    },
    Start {
        workspace_path: String,
        cols: u16,
        rows: u16,
        #[serde(default)]
        force_new: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pane_id: Option<String>,
    },
    Attach {
        session_id: String,
        #[serde(default)]
        skip_replay: bool,
    },
    Detach {
        session_id: String,
    },
    Input {
        session_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Terminate {
        session_id: String,
    },
    List,
    Ping {
        id: u64,
    },

    // ── Server → client ─────────────────────────────────────────────
    Welcome {
        client_id: String,
        version: String,
    },
    Started {
        session_id: String,
        is_new: bool,
    },
    StartFailed {
        reason: String,
    },
    Attached {
        session_id: String,
    },
    Detached {
        session_id: String,
    },
    Output {
        session_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Exit {
        session_id: String,
        code: i32,
    },
    Sessions {
        sessions: Vec<SessionInfo>,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Pong {
        id: u64,
    },
    Shutdown {
        reason: String,
    },
}

impl Message {
    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<&str>) -> Self {
        Message::Error {
            code,
            message: message.into(),
            session_id: session_id.map(str::to_string),
        }
    }
}

// ── Byte strings ─────────────────────────────────────────────────────

mod serde_bytes {
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}
