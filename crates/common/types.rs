//! Core value types shared across the engine crates.

use std::fmt;

use bytes::Bytes;

/// Version under which a record was written. Supplied by callers; the
/// engine never invents epochs.
pub type Epoch = u64;

/// 64-bit record index within a `(dkey, akey)` group.
pub type RecordIndex = u64;

/// 128-bit container identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId([u8; 16]);

impl ContainerId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(v: u128) -> Self {
        Self(v.to_le_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", hex::encode(self.0))
    }
}

/// 128-bit object identifier within a container.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub const fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Little-endian `[lo ‖ hi]`, the form stored in object-table records.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.lo.to_le_bytes());
        out[8..].copy_from_slice(&self.hi.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..]);
        Self {
            hi: u64::from_le_bytes(hi),
            lo: u64::from_le_bytes(lo),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.hi, self.lo)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Ordered scatter-gather list of value fragments. The record value is the
/// concatenation of all fragments; empty fragments are legal and ignored.
#[derive(Debug, Clone, Default)]
pub struct SgList {
    pub fragments: Vec<Bytes>,
}

impl SgList {
    pub fn single(fragment: Bytes) -> Self {
        Self {
            fragments: vec![fragment],
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::single(Bytes::copy_from_slice(data))
    }

    /// Total value length across all fragments.
    pub fn total_len(&self) -> u64 {
        self.fragments.iter().map(|f| f.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Concatenate every fragment into one owned buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len() as usize);
        for frag in &self.fragments {
            out.extend_from_slice(frag);
        }
        out
    }
}

/// A content checksum attached to a record: family tag plus digest bytes.
/// The tag is opaque at this layer; the checksum service defines the
/// known families.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Checksum {
    pub kind: u16,
    pub bytes: Bytes,
}

impl Checksum {
    pub fn new(kind: u16, bytes: Bytes) -> Self {
        Self { kind, bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}
