use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::{fs, io};

use super::{ChunkIndex, Manifest};
use crate::Error;

/// In-order writer of chunks arriving in any order.
///
/// Chunks are pushed as staged files as soon as they are available. A chunk is only ever written to the destination right after
/// its predecessor; early arrivals are kept pending (by path, not by payload) until the gap before them is filled.
#[derive(Debug)]
pub struct Reassembler<'a, W> {
    manifest: &'a Manifest,
    writer: W,
    /// Index of the next chunk to write.
    next: ChunkIndex,
    /// Out-of-order arrivals waiting for their predecessors.
    pending: BTreeMap<ChunkIndex, PathBuf>,
    written: u64,
}

impl<'a, W: io::AsyncWrite + Unpin> Reassembler<'a, W> {
    pub fn new(manifest: &'a Manifest, writer: W) -> Self {
        Self {
            manifest,
            writer,
            next: 0,
            pending: BTreeMap::new(),
            written: 0,
        }
    }

    /// Number of chunks already written to the destination.
    #[inline]
    pub fn written_chunks(&self) -> usize {
        self.next as usize
    }

    /// Number of bytes already written to the destination.
    #[inline]
    pub fn written_bytes(&self) -> u64 {
        self.written
    }

    /// Accept chunk `index` staged at `path`, writing it and any pending successor that can now follow.
    ///
    /// Staged files are deleted once written.
    pub async fn push(&mut self, index: ChunkIndex, path: PathBuf) -> Result<(), Error> {
        if self.manifest.chunk(index).is_none() {
            return Err(Error::Manifest(format!("chunk #{index} is out of the manifest range")));
        }
        if index < self.next || self.pending.insert(index, path).is_some() {
            return Err(Error::Manifest(format!("chunk #{index} received twice")));
        }

        while let Some(path) = self.pending.remove(&self.next) {
            self.write(self.next, path).await?;
            self.next += 1;
        }

        if !self.pending.is_empty() {
            tracing::trace!("Waiting for chunk #{} with {} chunks pending", self.next, self.pending.len());
        }

        Ok(())
    }

    async fn write(&mut self, index: ChunkIndex, path: PathBuf) -> Result<(), Error> {
        let mut file = fs::File::open(&path).await?;
        let copied = io::copy(&mut file, &mut self.writer).await?;
        drop(file);

        tracing::trace!("Reassembled chunk #{index} ({copied} bytes): `{}`", path.display());

        self.written += copied;
        fs::remove_file(&path).await?;

        Ok(())
    }

    /// Flush the destination and check it is complete.
    ///
    /// Fails with [`Error::LengthMismatch`] when some chunks are missing or when the written length differs from the manifest.
    pub async fn finish(mut self) -> Result<(W, u64), Error> {
        use io::AsyncWriteExt;

        self.writer.flush().await?;

        if self.written_chunks() != self.manifest.len() || self.written != self.manifest.total_size {
            return Err(Error::LengthMismatch {
                what: format!("reassembled destination ({} of {} chunks)", self.next, self.manifest.len()),
                expected: self.manifest.total_size,
                actual: self.written,
            });
        }

        Ok((self.writer, self.written))
    }
}

/// Reassemble every chunk of `manifest` from `source`, which hands out staged chunk files in any order.
///
/// Returns the destination writer and the number of bytes written to it.
pub async fn reassemble<W, I>(manifest: &Manifest, source: I, writer: W) -> Result<(W, u64), Error>
where
    W: io::AsyncWrite + Unpin,
    I: IntoIterator<Item = (ChunkIndex, PathBuf)>,
{
    let mut reassembler = Reassembler::new(manifest, writer);

    for (index, path) in source {
        reassembler.push(index, path).await?;
    }

    reassembler.finish().await
}
