//! Request side of the kernel channel.
//!
//! A separate rtnetlink connection is used for request/response traffic so
//! dump replies never compete with the notification stream for socket
//! buffer space. Administrative link up/down goes through the same handle,
//! replacing the historical shell-out to `/sbin/ip`.

use std::net::{IpAddr, Ipv6Addr};

use futures::TryStreamExt;
use log::debug;
use rtnetlink::{new_connection, Error::NetlinkError, Handle, LinkUnspec};
use thiserror::Error;

use crate::events::{self, LinkSnapshot};
use crate::Result;

/// Outcome of an address installation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressOutcome {
    /// The address was installed.
    Installed,
    /// The kernel already had this address on the interface.
    AlreadyPresent,
}

/// Failure kinds of an address installation request, mirrored from the
/// kernel error codes the engine reacts to.
#[derive(Error, Debug)]
pub enum SetAddressError {
    #[error("invalid arguments to addr config request")]
    InvalidArguments,
    #[error("network is down")]
    NetworkDown,
    #[error("addr config request failed: {0}")]
    Other(rtnetlink::Error),
}

/// Async rtnetlink request client.
#[derive(Clone)]
pub struct NetlinkClient {
    handle: Handle,
}

impl NetlinkClient {
    /// Open the request connection. The connection task is spawned onto the
    /// current tokio runtime.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _receiver) = new_connection()?;
        tokio::spawn(connection);
        Ok(NetlinkClient { handle })
    }

    /// One-shot dump of all current links.
    pub async fn list_links(&self) -> Result<Vec<LinkSnapshot>> {
        let mut response = self.handle.link().get().execute();
        let mut snapshots = Vec::new();
        while let Some(msg) = response.try_next().await? {
            snapshots.push(events::decode_link(&msg));
        }
        debug!("link dump returned {} links", snapshots.len());
        Ok(snapshots)
    }

    /// Install a link-scope IPv6 address on an interface.
    pub async fn set_address(
        &self,
        index: u32,
        address: Ipv6Addr,
        prefix_len: u8,
    ) -> std::result::Result<AddressOutcome, SetAddressError> {
        match self
            .handle
            .address()
            .add(index, IpAddr::V6(address), prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(AddressOutcome::Installed),
            Err(e) if matches!(&e, NetlinkError(err) if err.raw_code() == -libc::EEXIST) => {
                Ok(AddressOutcome::AlreadyPresent)
            }
            Err(e) if matches!(&e, NetlinkError(err) if err.raw_code() == -libc::EINVAL) => {
                Err(SetAddressError::InvalidArguments)
            }
            Err(e) if matches!(&e, NetlinkError(err) if err.raw_code() == -libc::ENETDOWN) => {
                Err(SetAddressError::NetworkDown)
            }
            Err(e) => Err(SetAddressError::Other(e)),
        }
    }

    /// Administratively bring a link up. Idempotent.
    pub async fn set_link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    /// Administratively bring a link down. Idempotent.
    pub async fn set_link_down(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await?;
        Ok(())
    }
}
