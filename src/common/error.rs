//! Error handling module
//!
//! This module defines the error types and result type aliases used in the worker.

use thiserror::Error;
use std::io;

/// Worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `WorkerError`.
pub type Result<T> = std::result::Result<T, WorkerError>;
