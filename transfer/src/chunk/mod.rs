use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::Error;

mod chunker;
pub use chunker::*;

mod reassembler;
pub use reassembler::*;

mod workarea;
pub use workarea::*;

mod keys;
pub use keys::*;

/// A chunk index, contiguous from 0 within a manifest.
pub type ChunkIndex = u32;

/// Chunk description.
///
/// During an upload the chunk payload lives in the job [`WorkArea`], during a download it is staged there again once fetched.
/// The description itself never carries the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in the source, starting at 0.
    pub index: ChunkIndex,

    /// Byte offset of the chunk in the source, always `index * chunk_size`.
    pub offset: u64,

    /// Payload length, equal to `chunk_size` except for the final chunk.
    pub length: u64,

    /// Digest of the chunk payload.
    pub checksum: Checksum,
}

impl Chunk {
    /// Byte range covered by this chunk in the source.
    #[inline]
    pub fn range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Transfer manifest.
///
/// The ordered record of every chunk of a source plus its whole-file digest. It is built once by the [`Chunker`] and is never
/// modified afterwards; the object store keeps it under [`manifest_key`] next to the chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version.
    pub version: u32,

    /// Size every chunk but the last one has.
    pub chunk_size: NonZeroU64,

    /// Total source length in bytes.
    pub total_size: u64,

    /// Digest of the whole source.
    pub source_checksum: Checksum,

    /// Chunks in ascending index order.
    pub chunks: Vec<Chunk>,
}

impl Manifest {
    pub const CURRENT_VERSION: u32 = 1;

    /// Create an empty manifest, describing a zero-length source.
    pub fn empty(chunk_size: NonZeroU64) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            chunk_size,
            total_size: 0,
            source_checksum: crate::checksum::checksum_bytes(&[]),
            chunks: vec![],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    pub fn chunk(&self, index: ChunkIndex) -> Option<&Chunk> {
        self.chunks.get(index as usize)
    }

    /// Encode the manifest as pretty-printed JSON.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode and validate a manifest.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;

        Ok(manifest)
    }

    /// Check chunk layout consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.version != Self::CURRENT_VERSION {
            return Err(Error::Manifest(format!("unsupported version {}", self.version)));
        }

        let chunk_size = self.chunk_size.get();
        let last = self.chunks.len().checked_sub(1);
        let mut total = 0u64;

        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(Error::Manifest(format!("chunk #{position} has index {}", chunk.index)));
            }
            if u64::from(chunk.index).checked_mul(chunk_size) != Some(chunk.offset) {
                return Err(Error::Manifest(format!("chunk #{} has offset {}", chunk.index, chunk.offset)));
            }

            let valid_length = if Some(position) == last {
                (1..=chunk_size).contains(&chunk.length)
            } else {
                chunk.length == chunk_size
            };
            if !valid_length {
                return Err(Error::Manifest(format!("chunk #{} has length {}", chunk.index, chunk.length)));
            }

            total = total
                .checked_add(chunk.length)
                .ok_or_else(|| Error::Manifest(format!("chunks add up to more than {} bytes", u64::MAX)))?;
        }

        if total != self.total_size {
            return Err(Error::Manifest(format!(
                "chunks add up to {total} bytes instead of {}",
                self.total_size
            )));
        }

        Ok(())
    }
}
