//! # Hotfire – Core
//!
//! Shared building blocks for the test-stand ground station:
//!
//! - **Configuration** – station config model, defaults, loader and semantic
//!   validation (serial link, protocol tuning, failsafe roles, mappings)
//! - **Sequence definitions** – the on-disk sequence format and the
//!   executable step model shared by the safety and sequence crates
//! - **Errors** – configuration / definition loading errors

pub mod config;
pub mod error;
pub mod sequences;

pub use config::*;
pub use error::ConfigError;
pub use sequences::*;
