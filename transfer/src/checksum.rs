//! This module provides SHA-256 digests over byte streams, files and in-memory buffers.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, io};

/// Size of the blocks read while streaming an input through the hasher.
pub const BLOCK_SIZE: usize = 64 * 1_024;

/// A SHA-256 digest, serialized as a lower-case hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(#[serde(with = "hex::serde")] [u8; 32]);

impl Checksum {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

/// Incremental digest computation, fed block by block.
#[derive(Debug, Clone, Default)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn update(&mut self, block: &[u8]) {
        self.0.update(block);
    }

    pub fn finish(self) -> Checksum {
        Checksum(self.0.finalize().into())
    }
}

/// Digest of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Digest of a byte stream, read in blocks of [`BLOCK_SIZE`] bytes until EOF.
pub async fn checksum_reader<R: io::AsyncRead + Unpin>(mut reader: R) -> io::Result<Checksum> {
    use io::AsyncReadExt;

    let mut hasher = Hasher::new();
    let mut block = vec![0; BLOCK_SIZE];

    loop {
        match reader.read(&mut block).await? {
            0 => break,
            n => hasher.update(&block[..n]),
        }
    }

    Ok(hasher.finish())
}

/// Digest of a whole local file.
pub async fn checksum_file(path: impl AsRef<Path>) -> io::Result<Checksum> {
    let file = fs::File::open(path.as_ref()).await?;

    checksum_reader(file).await
}
