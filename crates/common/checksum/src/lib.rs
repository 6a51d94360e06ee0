//! Content checksums over record values.
//!
//! A checksum family is selected once (by tag, normally from the
//! `VOS_CHECKSUM` environment variable) and then streamed over every value
//! fragment at record-allocation time. Stored checksums are returned
//! verbatim on fetch; they are never recomputed by the engine.

use bytes::Bytes;
use crc::{CRC_64_ECMA_182, Crc};
use tracing::debug;
use verso_common::{Checksum, SgList};

static CRC64_ECMA: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("unknown checksum family tag {0:?}")]
    UnknownFamily(String),

    #[error("unknown checksum wire type {0}")]
    UnknownWireType(u16),
}

/// Supported checksum families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc32,
    Crc64,
}

impl ChecksumKind {
    /// Parse a family tag. Unrecognized tags are `None`, which callers
    /// treat as "checksumming disabled".
    pub fn from_tag(tag: &str) -> Option<ChecksumKind> {
        match tag.to_ascii_lowercase().as_str() {
            "crc32" => Some(ChecksumKind::Crc32),
            "crc64" => Some(ChecksumKind::Crc64),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            ChecksumKind::Crc32 => "crc32",
            ChecksumKind::Crc64 => "crc64",
        }
    }

    /// Fixed digest width of the family.
    pub fn size(self) -> usize {
        match self {
            ChecksumKind::Crc32 => 4,
            ChecksumKind::Crc64 => 8,
        }
    }

    /// Tag stored in record headers.
    pub fn wire_type(self) -> u16 {
        match self {
            ChecksumKind::Crc32 => 1,
            ChecksumKind::Crc64 => 2,
        }
    }

    pub fn from_wire_type(wire: u16) -> Result<ChecksumKind, ChecksumError> {
        match wire {
            1 => Ok(ChecksumKind::Crc32),
            2 => Ok(ChecksumKind::Crc64),
            other => Err(ChecksumError::UnknownWireType(other)),
        }
    }
}

enum State {
    Crc32(crc32fast::Hasher),
    Crc64(crc::Digest<'static, u64>),
}

/// Streaming checksum state: reset, update per fragment, finalize.
pub struct Checksummer {
    kind: ChecksumKind,
    state: State,
}

impl std::fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checksummer").field("kind", &self.kind).finish()
    }
}

fn fresh_state(kind: ChecksumKind) -> State {
    match kind {
        ChecksumKind::Crc32 => State::Crc32(crc32fast::Hasher::new()),
        ChecksumKind::Crc64 => State::Crc64(CRC64_ECMA.digest()),
    }
}

impl Checksummer {
    pub fn new(kind: ChecksumKind) -> Checksummer {
        debug!(family = kind.tag(), "checksumming enabled");
        Checksummer {
            kind,
            state: fresh_state(kind),
        }
    }

    pub fn kind(&self) -> ChecksumKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.kind.size()
    }

    pub fn reset(&mut self) {
        self.state = fresh_state(self.kind);
    }

    /// Accumulate a partial checksum of one input fragment.
    pub fn update(&mut self, buf: &[u8]) {
        match &mut self.state {
            State::Crc32(hasher) => hasher.update(buf),
            State::Crc64(digest) => digest.update(buf),
        }
    }

    /// Finish the digest and reset for the next record. The returned bytes
    /// are little-endian and exactly `size()` long.
    pub fn finalize(&mut self) -> Bytes {
        let state = std::mem::replace(&mut self.state, fresh_state(self.kind));
        match state {
            State::Crc32(hasher) => Bytes::copy_from_slice(&hasher.finalize().to_le_bytes()),
            State::Crc64(digest) => Bytes::copy_from_slice(&digest.finalize().to_le_bytes()),
        }
    }

    /// Checksum a scatter-gather list. Null or empty fragments are skipped;
    /// an empty list produces no checksum at all.
    pub fn compute_sgl(&mut self, sgl: &SgList) -> Option<Checksum> {
        if sgl.fragments.is_empty() {
            return None;
        }
        self.reset();
        for frag in &sgl.fragments {
            if frag.is_empty() {
                continue;
            }
            self.update(frag);
        }
        Some(Checksum::new(self.kind.wire_type(), self.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_reference_vector() {
        let mut cs = Checksummer::new(ChecksumKind::Crc32);
        cs.update(b"123456789");
        assert_eq!(cs.finalize().as_ref(), 0xCBF4_3926u32.to_le_bytes());
    }

    #[test]
    fn crc64_matches_reference_vector() {
        let mut cs = Checksummer::new(ChecksumKind::Crc64);
        cs.update(b"123456789");
        assert_eq!(
            cs.finalize().as_ref(),
            0x6C40_DF5F_0B49_7347u64.to_le_bytes()
        );
    }

    #[test]
    fn streaming_equals_one_shot() {
        let mut cs = Checksummer::new(ChecksumKind::Crc64);
        cs.update(b"data");
        cs.update(b"\0");
        let streamed = cs.finalize();

        cs.update(b"data\0");
        assert_eq!(streamed, cs.finalize());
    }

    #[test]
    fn sgl_skips_empty_fragments() {
        let mut cs = Checksummer::new(ChecksumKind::Crc32);
        let with_gaps = SgList {
            fragments: vec![
                Bytes::from_static(b"da"),
                Bytes::new(),
                Bytes::from_static(b"ta"),
            ],
        };
        let contiguous = SgList::from_slice(b"data");

        let a = cs.compute_sgl(&with_gaps).expect("checksum");
        let b = cs.compute_sgl(&contiguous).expect("checksum");
        assert_eq!(a, b);
        assert_eq!(a.len(), ChecksumKind::Crc32.size());
    }

    #[test]
    fn empty_sgl_yields_no_checksum() {
        let mut cs = Checksummer::new(ChecksumKind::Crc64);
        assert!(cs.compute_sgl(&SgList::default()).is_none());
    }

    #[test]
    fn tag_parsing() {
        assert_eq!(ChecksumKind::from_tag("crc64"), Some(ChecksumKind::Crc64));
        assert_eq!(ChecksumKind::from_tag("CRC32"), Some(ChecksumKind::Crc32));
        assert_eq!(ChecksumKind::from_tag("md5"), None);

        let kind = ChecksumKind::Crc64;
        assert_eq!(
            ChecksumKind::from_wire_type(kind.wire_type()).expect("wire"),
            kind
        );
        assert!(ChecksumKind::from_wire_type(99).is_err());
    }
}
