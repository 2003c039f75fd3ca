//! TLS Worker: TLS-terminating proxy for a trusted parent server
//!
//! This library implements a standalone proxy worker spawned by a parent
//! server. It accepts TLS client connections, performs the handshake,
//! reverse-resolves the peer address, then bridges decrypted bytes to a
//! local Unix rendezvous socket, prefixing the stream with one
//! credential-stamped identity line of the form `ip^host\r\n`. The worker
//! watches its parent's liveness and tears down cleanly on SIGTERM or
//! parent death.
//!
//! # Architecture
//!
//! Everything runs on a single-threaded reactor ([`proxy::Reactor`]): one
//! serialized dispatch loop owns the connection registry and advances each
//! connection through an explicit state machine (handshake → reverse lookup
//! → local connect → established relay → teardown). Stage I/O happens in
//! spawned tasks that report completions back over an event channel, so no
//! connection state is ever touched concurrently.

// Public modules
pub mod common;
pub mod config;
pub mod proxy;
pub mod tls;

// Re-export commonly used structures and functions for convenience
pub use common::{Result, WorkerError};
pub use config::WorkerConfig;
pub use proxy::Reactor;
pub use tls::create_tls_acceptor;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
