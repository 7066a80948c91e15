//! PTY session engine: identity-keyed sessions, replay buffers, listener
//! fanout and the exit path.

pub mod buffer;
pub mod listeners;
mod pty_session;
pub mod registry;

pub use buffer::{OutputBuffer, DEFAULT_MAX_BUFFER_SIZE};
pub use listeners::{listener_fn, FnListener, ListenerSet, SessionListener};
pub use registry::{
    AttachOptions, BufferPolicy, RegistryConfig, SessionRegistry, SessionSummary, StartOutcome,
    StartRequest, EXIT_CODE_TERMINATED,
};
