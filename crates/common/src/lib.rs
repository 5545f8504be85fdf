//! Specter Common Library
//!
//! Shared types, wire messages, and error taxonomy for the Specter
//! visual-regression platform.

pub mod error;
pub mod messages;
pub mod types;

pub use error::{Error, Result};
pub use messages::Message;
pub use types::*;

/// Specter version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
