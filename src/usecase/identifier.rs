// SPDX-License-Identifier: GPL-3.0-only

//! Use-case identifiers
//!
//! Use cases, calibration blobs and processing parameter sets are keyed by a
//! 16-byte identifier. Tooling writes them either as a real RFC4122 UUID or
//! as a name that gets hashed deterministically; both forms end up in the
//! same table key space.

use crate::errors::{CoreError, CoreResult};
use crc::crc32;
use std::fmt;
use uuid::Uuid;

/// 16-byte key for use-case tables
///
/// The all-zero value is a sentinel meaning "no identifier assigned"; tables
/// never contain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UseCaseIdentifier {
    data: [u8; 16],
}

impl UseCaseIdentifier {
    pub fn new(data: [u8; 16]) -> Self {
        Self { data }
    }

    /// Parse an RFC4122 text form such as
    /// "b932ae9a-a066-4cfc-9e48-9f65d2840884".
    pub fn parse_rfc4122(s: &str) -> CoreResult<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| CoreError::InvalidValue(format!("not an RFC4122 identifier: {e}")))?;
        Ok(Self {
            data: *uuid.as_bytes(),
        })
    }

    /// Derive an identifier from an arbitrary name.
    ///
    /// The result is the first 12 bytes of the name (zero-padded when the
    /// name is shorter) followed by the little-endian CRC32 of the whole
    /// name. Equal names always map to equal identifiers; this is a stable
    /// key derivation, not a universally unique one.
    pub fn from_name(s: &str) -> Self {
        let bytes = s.as_bytes();
        let mut data = [0u8; 16];
        let head = bytes.len().min(12);
        data[..head].copy_from_slice(&bytes[..head]);
        data[12..].copy_from_slice(&crc32::checksum_ieee(bytes).to_le_bytes());
        Self { data }
    }

    pub fn data(&self) -> &[u8; 16] {
        &self.data
    }

    /// True for the all-zero sentinel produced by `Default`
    pub fn is_sentinel(&self) -> bool {
        self.data == [0u8; 16]
    }
}

impl fmt::Display for UseCaseIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.data))
    }
}

impl From<[u8; 16]> for UseCaseIdentifier {
    fn from(data: [u8; 16]) -> Self {
        Self { data }
    }
}
