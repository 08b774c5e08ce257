//! Error types for the netmgr implementation.

use thiserror::Error;

/// All possible errors that can occur within the netmgr common layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A UUID string did not have the canonical 8-4-4-4-12 form.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// A MAC address string could not be parsed.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// A host table record could not be encoded or decoded.
    #[error("host table error: {0}")]
    HostTable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}
