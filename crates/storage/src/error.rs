//! Engine error surface.

use verso_arena::ArenaError;
use verso_btree::BtreeError;
use verso_checksum::ChecksumError;

/// Errors surfaced by the engine. Every lower-layer failure maps onto one
/// of five codes; `code()` yields the stable wire tag for RPC layers.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("no permission: {0}")]
    NoPermission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),
}

impl StorageError {
    /// Stable error code, surfaced verbatim to callers.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidArgument(_) => "invalid-argument",
            StorageError::NoMemory(_) => "no-memory",
            StorageError::NoPermission(_) => "no-permission",
            StorageError::NotFound(_) => "not-found",
            StorageError::Io(_) => "io-error",
        }
    }
}

impl From<ArenaError> for StorageError {
    fn from(err: ArenaError) -> Self {
        match err {
            ArenaError::NoMemory { .. } => StorageError::NoMemory(err.to_string()),
            ArenaError::Io(_) | ArenaError::BadFormat(_) => StorageError::Io(err.to_string()),
            ArenaError::InvalidHandle(_) | ArenaError::OutOfBounds { .. } => {
                StorageError::Io(err.to_string())
            }
        }
    }
}

impl From<BtreeError> for StorageError {
    fn from(err: BtreeError) -> Self {
        match err {
            BtreeError::InvalidArgument(msg) => StorageError::InvalidArgument(msg),
            BtreeError::NoPermission(msg) => StorageError::NoPermission(msg),
            BtreeError::NotFound => StorageError::NotFound("record not found".to_string()),
            BtreeError::UnknownClass(class) => {
                StorageError::InvalidArgument(format!("unknown tree class {class}"))
            }
            BtreeError::Arena(inner) => inner.into(),
        }
    }
}

impl From<ChecksumError> for StorageError {
    fn from(err: ChecksumError) -> Self {
        StorageError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(StorageError::InvalidArgument(String::new()).code(), "invalid-argument");
        assert_eq!(StorageError::NoMemory(String::new()).code(), "no-memory");
        assert_eq!(StorageError::NoPermission(String::new()).code(), "no-permission");
        assert_eq!(StorageError::NotFound(String::new()).code(), "not-found");
        assert_eq!(StorageError::Io(String::new()).code(), "io-error");
    }

    #[test]
    fn btree_errors_keep_their_code() {
        let err: StorageError = BtreeError::NoPermission("overwrite".to_string()).into();
        assert_eq!(err.code(), "no-permission");

        let err: StorageError = BtreeError::NotFound.into();
        assert_eq!(err.code(), "not-found");
    }
}
