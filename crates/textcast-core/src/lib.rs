//! # Textcast Core
//!
//! Shared building blocks for the delivery engine crates:
//! configuration loading, the workspace-wide error type, and
//! epoch-millisecond timestamp normalization.

pub mod config;
pub mod error;
pub mod time;

pub use config::TextcastConfig;
pub use error::{Result, TextcastError};
