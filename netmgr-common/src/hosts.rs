//! On-disk host table format.
//!
//! The host table is the cluster membership snapshot netmgr publishes for
//! other host services: a fixed-size binary file of [`HOST_TABLE_ENTRIES`]
//! records, rewritten atomically on every reconciliation tick. Each record
//! describes either a local interface or a partner peer seen on one.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::MacAddr;
use crate::uuid::Uuid;
use crate::Error;

/// Number of records in the host table.
pub const HOST_TABLE_ENTRIES: usize = 256;

/// Size of one encoded [`HostEntry`].
pub const HOST_ENTRY_SIZE: usize = 64;

/// Size of the host table file.
pub const HOST_TABLE_SIZE: usize = HOST_ENTRY_SIZE * HOST_TABLE_ENTRIES;

const FLAG_VALID: u32 = 1 << 0;
const FLAG_PARTNER: u32 = 1 << 1;
const FLAG_PRIVATE: u32 = 1 << 2;

/// One record of the host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub node_uuid: Uuid,
    pub cluster_uuid: Uuid,
    pub primary_address: Ipv6Addr,
    pub v4_address: Ipv4Addr,
    pub valid: bool,
    pub partner: bool,
    pub is_private: bool,
    pub mac: MacAddr,
    pub node_ordinal: u8,
    pub interface_ordinal: u8,
}

impl Default for HostEntry {
    fn default() -> Self {
        HostEntry {
            node_uuid: Uuid::NIL,
            cluster_uuid: Uuid::NIL,
            primary_address: Ipv6Addr::UNSPECIFIED,
            v4_address: Ipv4Addr::UNSPECIFIED,
            valid: false,
            partner: false,
            is_private: false,
            mac: MacAddr::default(),
            node_ordinal: 0,
            interface_ordinal: 0,
        }
    }
}

impl HostEntry {
    /// Append the 64-byte wire form of this record to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.node_uuid.as_bytes());
        buf.put_slice(self.cluster_uuid.as_bytes());
        buf.put_slice(&self.primary_address.octets());
        buf.put_slice(&self.v4_address.octets());

        let mut flags = 0u32;
        if self.valid {
            flags |= FLAG_VALID;
        }
        if self.partner {
            flags |= FLAG_PARTNER;
        }
        if self.is_private {
            flags |= FLAG_PRIVATE;
        }
        buf.put_u32_le(flags);

        buf.put_slice(&self.mac.octets());
        buf.put_u8(self.node_ordinal);
        buf.put_u8(self.interface_ordinal);
    }

    /// Decode one record from its 64-byte wire form.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HOST_ENTRY_SIZE {
            return Err(Error::HostTable(format!(
                "short host entry: {} bytes",
                bytes.len()
            )));
        }

        let mut uuid = [0u8; 16];
        bytes.copy_to_slice(&mut uuid);
        let node_uuid = Uuid::from_bytes(uuid);
        bytes.copy_to_slice(&mut uuid);
        let cluster_uuid = Uuid::from_bytes(uuid);

        let mut v6 = [0u8; 16];
        bytes.copy_to_slice(&mut v6);
        let mut v4 = [0u8; 4];
        bytes.copy_to_slice(&mut v4);

        let flags = bytes.get_u32_le();

        let mut mac = [0u8; 6];
        bytes.copy_to_slice(&mut mac);
        let node_ordinal = bytes.get_u8();
        let interface_ordinal = bytes.get_u8();

        Ok(HostEntry {
            node_uuid,
            cluster_uuid,
            primary_address: Ipv6Addr::from(v6),
            v4_address: Ipv4Addr::from(v4),
            valid: flags & FLAG_VALID != 0,
            partner: flags & FLAG_PARTNER != 0,
            is_private: flags & FLAG_PRIVATE != 0,
            mac: MacAddr(mac),
            node_ordinal,
            interface_ordinal,
        })
    }
}

/// Decode every valid record of a host table image.
pub fn decode_table(image: &[u8]) -> Result<Vec<HostEntry>, Error> {
    if image.len() != HOST_TABLE_SIZE {
        return Err(Error::HostTable(format!(
            "host table is {} bytes, expected {}",
            image.len(),
            HOST_TABLE_SIZE
        )));
    }
    let mut entries = Vec::new();
    for chunk in image.chunks(HOST_ENTRY_SIZE) {
        let entry = HostEntry::decode(chunk)?;
        if entry.valid {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> HostEntry {
        HostEntry {
            node_uuid: Uuid::parse("99999999-8888-7777-6666-555555555555").unwrap(),
            cluster_uuid: Uuid::NIL,
            primary_address: "fe80::203:4ff:fe05:6a7b".parse().unwrap(),
            v4_address: Ipv4Addr::UNSPECIFIED,
            valid: true,
            partner: true,
            is_private: false,
            mac: MacAddr([0x00, 0x03, 0x04, 0x05, 0x6a, 0x7b]),
            node_ordinal: 1,
            interface_ordinal: 0,
        }
    }

    #[test]
    fn test_entry_size() {
        let mut buf = BytesMut::new();
        sample_entry().encode(&mut buf);
        assert_eq!(buf.len(), HOST_ENTRY_SIZE);
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = sample_entry();
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        let decoded = HostEntry::decode(&buf).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_decode_table() {
        let mut image = BytesMut::with_capacity(HOST_TABLE_SIZE);
        sample_entry().encode(&mut image);
        image.resize(HOST_TABLE_SIZE, 0);

        let entries = decode_table(&image).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], sample_entry());

        assert!(decode_table(&image[..128]).is_err());
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let image = vec![0u8; HOST_TABLE_SIZE];
        assert!(decode_table(&image).unwrap().is_empty());
    }

    #[test]
    fn test_short_entry_rejected() {
        assert!(HostEntry::decode(&[0u8; 10]).is_err());
    }
}
