//! Node identity UUIDs.
//!
//! A node identity is a 128-bit opaque value that round-trips between a
//! 16-byte binary form (the heartbeat payload and host table format) and the
//! canonical lowercase `8-4-4-4-12` text form (the partner cache and log
//! lines). Equality is bytewise; nothing in netmgr interprets the contents.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// A 128-bit node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Uuid([u8; 16]);

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Uuid::parse(&text).map_err(serde::de::Error::custom)
    }
}

impl Uuid {
    /// The all-zero UUID, used for never-assigned identity fields.
    pub const NIL: Uuid = Uuid([0u8; 16]);

    /// Construct from the 16-byte binary form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    /// The 16-byte binary form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the all-zero UUID.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Parse the canonical `8-4-4-4-12` text form. Both hex cases are
    /// accepted on input; formatting always produces lowercase.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let s = input.trim();
        let bytes = s.as_bytes();
        if bytes.len() != 36 {
            return Err(Error::InvalidUuid(s.to_string()));
        }
        for &pos in &[8usize, 13, 18, 23] {
            if bytes[pos] != b'-' {
                return Err(Error::InvalidUuid(s.to_string()));
            }
        }
        let mut data = [0u8; 16];
        let mut di = 0;
        let mut si = 0;
        while di < 16 {
            if bytes[si] == b'-' {
                si += 1;
                continue;
            }
            let hi = hexval(bytes[si]).ok_or_else(|| Error::InvalidUuid(s.to_string()))?;
            let lo = hexval(bytes[si + 1]).ok_or_else(|| Error::InvalidUuid(s.to_string()))?;
            data[di] = (hi << 4) | lo;
            di += 1;
            si += 2;
        }
        Ok(Uuid(data))
    }

    /// Read a UUID from the given file, or assign a fresh one from the
    /// kernel's random UUID source and persist it. Used once at startup for
    /// the node identity.
    pub fn load_or_assign(path: &Path) -> Result<Self, Error> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let uuid = Uuid::parse(&contents)?;
                Ok(uuid)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("node UUID not configured yet, assigning one");
                let random = fs::read_to_string("/proc/sys/kernel/random/uuid")?;
                let uuid = Uuid::parse(&random)?;
                match fs::File::create(path) {
                    Ok(mut f) => {
                        writeln!(f, "{uuid}")?;
                        info!("node UUID set to '{uuid}'");
                    }
                    Err(err) => {
                        warn!("could not save node UUID to {}: {}", path.display(), err);
                    }
                }
                Ok(uuid)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            d[0], d[1], d[2], d[3], d[4], d[5], d[6], d[7],
            d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]
        )
    }
}

impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse(s)
    }
}

fn hexval(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_round_trip() {
        let text = "11111111-2222-3333-4444-555555555555";
        let uuid = Uuid::parse(text).unwrap();
        assert_eq!(uuid.to_string(), text);

        let uuid2 = Uuid::parse(&uuid.to_string()).unwrap();
        assert_eq!(uuid, uuid2);
    }

    #[test]
    fn test_format_is_lowercase() {
        let uuid = Uuid::parse("DEADBEEF-0000-0000-0000-CAFEBABE0000").unwrap();
        assert_eq!(uuid.to_string(), "deadbeef-0000-0000-0000-cafebabe0000");
    }

    #[test]
    fn test_binary_round_trip() {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8 * 17;
        }
        let uuid = Uuid::from_bytes(bytes);
        assert_eq!(*uuid.as_bytes(), bytes);
        assert_eq!(Uuid::parse(&uuid.to_string()).unwrap(), uuid);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Uuid::parse("").is_err());
        assert!(Uuid::parse("11111111222233334444555555555555").is_err());
        assert!(Uuid::parse("11111111-2222-3333-4444-55555555555g").is_err());
        assert!(Uuid::parse("11111111-2222-3333-4444-5555555555").is_err());
    }

    #[test]
    fn test_nil() {
        assert!(Uuid::NIL.is_nil());
        assert!(!Uuid::parse("11111111-2222-3333-4444-555555555555")
            .unwrap()
            .is_nil());
    }
}
