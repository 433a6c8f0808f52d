//! Torrent identity, metadata and per-torrent session state.

pub mod metadata;
pub mod piece_store;
pub mod session;

use std::fmt;

pub use metadata::{MetadataError, MetadataSource, TorrentMetadata, TorrentMetadataLoader};
pub use piece_store::{FakePieceStore, PieceStoreError};
pub use session::{ResumeData, SessionCounters, SessionState, TorrentSession};

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses a 40-character hex string.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Invalid` - Not valid hex or not 20 bytes long
    pub fn from_hex(hex_str: &str) -> Result<Self, MetadataError> {
        let bytes = hex::decode(hex_str).map_err(|e| MetadataError::Invalid {
            reason: format!("info hash is not valid hex: {e}"),
        })?;
        let hash: [u8; 20] = bytes.try_into().map_err(|_| MetadataError::Invalid {
            reason: "info hash must be 20 bytes".to_string(),
        })?;
        Ok(Self(hash))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
