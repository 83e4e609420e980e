//! Nydus Convert Core - Foundational Types
//!
//! This crate provides the error taxonomy and configuration types shared
//! by the conversion engine and its command-line front end.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{ConvertConfig, IndexMarker};
pub use error::{ConvertError, Result, ResultExt};

/// Nydus Convert version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
