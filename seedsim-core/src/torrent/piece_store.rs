//! Deterministic pseudo-random piece content.
//!
//! Nothing is ever read from disk. Blocks are derived from the info hash,
//! piece index and a per-store seed, so the same request always yields the
//! same bytes and no two pieces look alike on the wire.

use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::{PieceIndex, TorrentMetadata};

/// Requests the store cannot satisfy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PieceStoreError {
    #[error("Block out of bounds: piece {piece} offset {offset} length {length}")]
    OutOfBounds {
        piece: PieceIndex,
        offset: u32,
        length: u32,
    },
}

const DIGEST_LEN: usize = 20;

/// Generates filler bytes for any block of a torrent.
#[derive(Debug, Clone)]
pub struct FakePieceStore {
    info_hash: [u8; 20],
    piece_length: u32,
    total_size: u64,
    piece_count: u32,
    seed: u64,
}

impl FakePieceStore {
    /// Creates a store covering the pieces described by `metadata`.
    pub fn new(metadata: &TorrentMetadata, seed: u64) -> Self {
        Self {
            info_hash: *metadata.info_hash.as_bytes(),
            piece_length: metadata.piece_length,
            total_size: metadata.total_size,
            piece_count: metadata.piece_count,
            seed,
        }
    }

    fn piece_size(&self, piece: PieceIndex) -> Option<u32> {
        if piece.as_u32() >= self.piece_count {
            return None;
        }
        let start = u64::from(piece.as_u32()) * u64::from(self.piece_length);
        Some((self.total_size - start).min(u64::from(self.piece_length)) as u32)
    }

    /// Checks that a block lies entirely inside an existing piece.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::OutOfBounds` - Piece does not exist or range exceeds it
    pub fn check_range(
        &self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), PieceStoreError> {
        let fits = self
            .piece_size(piece)
            .zip(offset.checked_add(length))
            .is_some_and(|(size, end)| end <= size);
        if fits {
            Ok(())
        } else {
            Err(PieceStoreError::OutOfBounds {
                piece,
                offset,
                length,
            })
        }
    }

    /// Returns `length` bytes starting at `offset` within `piece`.
    ///
    /// # Errors
    ///
    /// - `PieceStoreError::OutOfBounds` - Piece does not exist or range exceeds it
    pub fn read_block(
        &self,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, PieceStoreError> {
        self.check_range(piece, offset, length)?;
        let end = offset + length;

        let mut buf = BytesMut::with_capacity(length as usize);
        let mut position = offset as usize;
        let end = end as usize;
        while position < end {
            let chunk = position / DIGEST_LEN;
            let digest = self.chunk_digest(piece, chunk as u64);
            let start_in_chunk = position % DIGEST_LEN;
            let take = (DIGEST_LEN - start_in_chunk).min(end - position);
            buf.put_slice(&digest[start_in_chunk..start_in_chunk + take]);
            position += take;
        }
        Ok(buf.freeze())
    }

    fn chunk_digest(&self, piece: PieceIndex, chunk: u64) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(self.info_hash);
        hasher.update(piece.as_u32().to_be_bytes());
        hasher.update(chunk.to_be_bytes());
        hasher.finalize().into()
    }
}
