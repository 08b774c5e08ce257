//! Kernel event source for netmgr.
//!
//! This crate wraps the rtnetlink channel to the kernel in two halves: a
//! blocking notification socket subscribed to the link/address multicast
//! groups, decoded into typed [`Event`]s, and an async request client used
//! for one-shot link dumps, address installation, and administrative link
//! up/down. Neighbor and route groups are deliberately not subscribed; under
//! load they arrive by the hundreds per second and overflow the socket
//! buffer, losing link events.

pub mod client;
pub mod events;
pub mod source;

pub use client::{AddressOutcome, NetlinkClient};
pub use events::{AddressEvent, Event, LinkFamily, LinkSnapshot, OperState};
pub use source::EventSource;

use thiserror::Error;

/// Errors surfaced by the kernel event source.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error on the notification socket.
    #[error("netlink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Request/response error from the rtnetlink connection.
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),

    /// A message could not be decoded.
    #[error("netlink decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
