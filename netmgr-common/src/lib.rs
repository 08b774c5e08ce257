//! Common types and utilities for the netmgr cluster network manager.
//!
//! This crate provides the pieces shared between the kernel event source and
//! the network state engine: node identity (UUID), hardware addresses and the
//! EUI-64 link-local derivation, interface ordinals, and the on-disk host
//! table format.

pub mod error;
pub mod hosts;
pub mod types;
pub mod uuid;

/// Reexport of common types
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
