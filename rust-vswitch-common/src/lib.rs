//! Common types and utilities for the userspace VXLAN virtual switch.
//!
//! This crate provides the value types, metrics primitives and packet codecs
//! shared by the packet pipeline and the binaries that drive it.

pub mod error;
pub mod metrics;
pub mod packet;
pub mod types;

/// Reexport of common types
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
