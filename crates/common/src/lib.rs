//! Common utilities for rust-rtl88xxau
//!
//! This crate provides shared functionality for the driver core and its
//! binary: error handling, logging setup, and the async channel bridge
//! between the Tokio runtime and the blocking driver thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{CommandBridge, CommandWorker, create_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
