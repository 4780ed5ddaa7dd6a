use std::num::NonZeroU64;

use tokio::{fs, io};

use super::{Chunk, ChunkIndex, Manifest, WorkArea};
use crate::checksum::{Hasher, BLOCK_SIZE};
use crate::Error;

/// Source splitter.
///
/// Reads a source sequentially from its first byte and stages it as fixed-size chunk files in a [`WorkArea`], digesting both
/// every chunk and the whole source along the way. Only the last chunk may be shorter than the chunk size, and an empty source
/// yields a manifest without any chunk.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: NonZeroU64,
}

impl Chunker {
    pub fn new(chunk_size: NonZeroU64) -> Self {
        Self { chunk_size }
    }

    #[inline]
    pub fn chunk_size(&self) -> NonZeroU64 {
        self.chunk_size
    }

    /// Split `source` into chunk files staged in `area` and return their manifest.
    pub async fn chunk<R: io::AsyncRead + Unpin>(&self, source: R, area: &WorkArea) -> Result<Manifest, Error> {
        use io::{AsyncBufReadExt, AsyncWriteExt};

        let chunk_size = self.chunk_size.get();

        let mut reader = io::BufReader::with_capacity(BLOCK_SIZE, source);
        let mut source_hasher = Hasher::new();
        let mut manifest = Manifest::empty(self.chunk_size);

        // a chunk file is only created once at least one byte is available for it
        while !reader.fill_buf().await?.is_empty() {
            let index = ChunkIndex::try_from(manifest.chunks.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("chunk size {chunk_size} yields too many chunks")))?;
            let path = area.chunk_path(index);

            let file = fs::File::options().write(true).create_new(true).open(&path).await?;
            let mut writer = io::BufWriter::new(file);
            let mut chunk_hasher = Hasher::new();
            let mut length = 0u64;

            while length < chunk_size {
                let block = reader.fill_buf().await?;
                if block.is_empty() {
                    break;
                }

                let n = block.len().min((chunk_size - length).try_into().unwrap_or(usize::MAX));
                let block = &block[..n];

                writer.write_all(block).await?;
                chunk_hasher.update(block);
                source_hasher.update(block);

                reader.consume(n);
                length += n as u64;
            }

            writer.shutdown().await?;
            writer.into_inner().sync_all().await?;

            let chunk = Chunk {
                index,
                offset: u64::from(index) * chunk_size,
                length,
                checksum: chunk_hasher.finish(),
            };

            tracing::trace!("Staged chunk #{index} ({length} bytes, {}): `{}`", chunk.checksum, path.display());

            manifest.total_size += length;
            manifest.chunks.push(chunk);
        }

        manifest.source_checksum = source_hasher.finish();

        tracing::debug!(
            "Chunked {} bytes into {} parts of up to {chunk_size} bytes: `{}`",
            manifest.total_size,
            manifest.len(),
            area.path().display()
        );

        Ok(manifest)
    }
}
