//! Error types for the translation table.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::types::GuestAddr;

/// Errors returned by translation table operations.
///
/// Lookup misses and stale chain requests are ordinary outcomes and are
/// never reported through this type.
#[derive(Debug, Error)]
pub enum TcacheError {
    /// A translation must cover between one and three guest extents.
    #[error("translation covers {0} extents, expected 1..=3")]
    InvalidExtentCount(usize),

    /// One of the guest extents has zero length.
    #[error("empty guest extent at {base:#x}")]
    EmptyExtent {
        /// Base address of the offending extent.
        base: GuestAddr,
    },

    /// The translation carries no host code.
    #[error("translation has no host code")]
    EmptyCode,

    /// The host code does not fit in a single sector.
    #[error("host code of {len} bytes exceeds the {max} byte limit")]
    CodeTooLarge {
        /// Length submitted.
        len: usize,
        /// Largest accepted length.
        max: usize,
    },

    /// The profile counter immediate lies outside the host code.
    #[error("profile counter offset {offset} outside {len} bytes of code")]
    BadProfileOffset {
        /// Offset submitted.
        offset: u32,
        /// Length of the host code.
        len: usize,
    },

    /// The backend could not map a code arena.
    #[error("cannot map {bytes} byte code arena")]
    ArenaMap {
        /// Arena size requested.
        bytes: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl TcacheError {
    /// Whether the engine can keep running after this error.
    ///
    /// Without a code arena no guest code can execute at all, so an
    /// embedder should terminate on a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TcacheError::ArenaMap { .. })
    }
}

/// Result alias for translation table operations.
pub type TcacheResult<T> = Result<T, TcacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_only_arena_map_is_fatal() {
        let err = TcacheError::ArenaMap {
            bytes: 4096,
            source: io::Error::new(io::ErrorKind::OutOfMemory, "no"),
        };
        assert!(err.is_fatal());
        assert!(err.source().is_some());
        assert!(!TcacheError::EmptyCode.is_fatal());
        assert!(!TcacheError::InvalidExtentCount(4).is_fatal());
    }

    #[test]
    fn test_config_error_converts() {
        let err: TcacheError = ConfigError::SectorCount(1).into();
        assert!(matches!(err, TcacheError::Config(ConfigError::SectorCount(1))));
        assert!(err.to_string().contains("sector count 1"));
    }

    #[test]
    fn test_messages() {
        let err = TcacheError::CodeTooLarge { len: 10, max: 5 };
        assert_eq!(err.to_string(), "host code of 10 bytes exceeds the 5 byte limit");
        let err = TcacheError::EmptyExtent { base: 0x1000 };
        assert_eq!(err.to_string(), "empty guest extent at 0x1000");
    }
}
