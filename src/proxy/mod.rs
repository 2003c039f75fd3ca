//! Proxy worker core
//!
//! The reactor owns every connection and serializes all state changes; the
//! other modules are the stages it drives: handshake and relay over the
//! channel abstraction, reverse lookup, the credential-stamped identity
//! handshake, and parent liveness detection.

pub mod connection;
pub mod creds;
pub mod monitor;
pub mod reactor;
pub mod relay;
pub mod resolver;

pub use connection::{ConnId, ConnState, Connection, Event, HandshakeFailure};
pub use monitor::{current_parent_pid, ParentMonitor, Strategy};
pub use reactor::{Reactor, ShutdownHandle, HANDSHAKE_TIMEOUT};
pub use relay::{RelayOutcome, ShutdownMode};
