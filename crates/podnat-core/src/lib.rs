//! Podnat Core Library
//!
//! Shared types, annotation parsing and host-network helpers used by the
//! podnat controller crates.

pub mod annotation;
pub mod error;
pub mod netutil;
pub mod types;

pub use error::{Error, Result};
