//! TLS module
//!
//! This module builds the server-side TLS context from the startup
//! configuration record.

pub mod acceptor;

pub use acceptor::create_tls_acceptor;
