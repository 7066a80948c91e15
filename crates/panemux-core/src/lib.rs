//! panemux-core: the session multiplexing engine behind panemux.
//!
//! Owns PTY process lifecycles, gives each session a stable identity, fans
//! PTY output out to any number of listeners and keeps a bounded replay
//! buffer so that a listener (re)attaching after a UI remount or a transport
//! switch sees recent scrollback before live output.
//!
//! Also carries the wire protocol shared by the transport adapters.

pub mod codec;
pub mod error;
pub mod identity;
pub mod messages;
pub mod pty;
pub mod session;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, frame_encode, FrameDecoder};
pub use error::{DeliveryError, MuxError, MuxResult};
pub use identity::SessionKey;
pub use messages::{ErrorCode, Message, SessionInfo, PROTOCOL_VERSION};
pub use pty::{PtyBackend, PtyProcess, ShellCommand, SpawnSpec, Subscription};
pub use session::{
    AttachOptions, BufferPolicy, OutputBuffer, RegistryConfig, SessionListener, SessionRegistry,
    SessionSummary, StartOutcome, StartRequest, EXIT_CODE_TERMINATED,
};
