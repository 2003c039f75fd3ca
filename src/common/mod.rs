//! Common module
//!
//! This module contains shared types, errors, and utility functions used throughout the worker.

pub mod error;
pub mod log;

// Re-export commonly used types and functions
pub use error::{Result, WorkerError};
pub use log::init_logger;
