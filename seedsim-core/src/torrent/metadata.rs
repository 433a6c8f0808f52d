//! Parsed torrent metadata and the loader seam that supplies it.
//!
//! Torrent files and magnet links are parsed outside this crate; the engine
//! only consumes the result through [`TorrentMetadataLoader`].

use std::path::PathBuf;

use super::{InfoHash, PieceIndex};

/// Errors produced while loading or validating torrent metadata.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid torrent metadata: {reason}")]
    Invalid { reason: String },

    #[error("Metadata source not supported: {source_kind}")]
    Unsupported { source_kind: String },
}

/// Immutable description of a torrent as far as the network layer cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub piece_count: u32,
    pub total_size: u64,
    /// Flattened announce tiers, first-seen order, duplicates removed
    pub announce_urls: Vec<String>,
}

impl TorrentMetadata {
    /// Builds metadata, deriving the piece count and flattening announce tiers.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Invalid` - Zero piece length or empty torrent
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        piece_length: u32,
        total_size: u64,
        announce_tiers: Vec<Vec<String>>,
    ) -> Result<Self, MetadataError> {
        if piece_length == 0 {
            return Err(MetadataError::Invalid {
                reason: "piece length must be greater than zero".to_string(),
            });
        }
        if total_size == 0 {
            return Err(MetadataError::Invalid {
                reason: "torrent must not be empty".to_string(),
            });
        }

        let piece_count = total_size.div_ceil(u64::from(piece_length));
        let piece_count = u32::try_from(piece_count).map_err(|_| MetadataError::Invalid {
            reason: format!("piece count {piece_count} does not fit in 32 bits"),
        })?;

        let mut announce_urls: Vec<String> = Vec::new();
        for url in announce_tiers.into_iter().flatten() {
            let url = url.trim().to_string();
            if !url.is_empty() && !announce_urls.contains(&url) {
                announce_urls.push(url);
            }
        }

        Ok(Self {
            info_hash,
            name: name.into(),
            piece_length,
            piece_count,
            total_size,
            announce_urls,
        })
    }

    /// Size in bytes of the given piece, accounting for a short last piece.
    pub fn piece_size(&self, index: PieceIndex) -> Option<u32> {
        if index.as_u32() >= self.piece_count {
            return None;
        }
        if index.as_u32() + 1 < self.piece_count {
            return Some(self.piece_length);
        }
        let full = u64::from(self.piece_length) * u64::from(self.piece_count - 1);
        Some((self.total_size - full) as u32)
    }

    /// Number of bytes in a wire bitfield for this torrent.
    pub fn bitfield_len(&self) -> usize {
        (self.piece_count as usize).div_ceil(8)
    }
}

/// Where metadata comes from; interpretation belongs to the loader.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataSource {
    TorrentFile(PathBuf),
    Magnet(String),
}

/// External collaborator that parses torrents into [`TorrentMetadata`].
pub trait TorrentMetadataLoader: Send + Sync {
    /// Loads metadata for the given source.
    ///
    /// # Errors
    ///
    /// - `MetadataError::Unsupported` - The loader cannot handle this source kind
    /// - `MetadataError::Invalid` - The source could not be parsed
    fn load(&self, source: &MetadataSource) -> Result<TorrentMetadata, MetadataError>;
}
