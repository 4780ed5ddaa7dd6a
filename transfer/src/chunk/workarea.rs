use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::ChunkIndex;

/// Per-job scratch directory staging chunk payloads.
///
/// Each job gets its own uniquely named directory under a common root, so concurrent jobs never share staged chunks.
/// The directory and everything in it is deleted by [`WorkArea::close()`] or, on any other exit path, when dropped.
///
/// ```text
///     - work dir root
///       L job-{job_id}-{random}
///         L part0
///         L part1
///         L part...
/// ```
#[derive(Debug)]
pub struct WorkArea {
    job_id: Uuid,
    dir: tempfile::TempDir,
}

impl WorkArea {
    /// Allocate a new work area for `job_id` under `root`, creating `root` if needed.
    pub fn create(root: &Path, job_id: Uuid) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;

        let dir = tempfile::Builder::new().prefix(&format!("job-{job_id}-")).tempdir_in(root)?;

        tracing::debug!("Allocated work area for job {job_id}: `{}`", dir.path().display());

        Ok(Self { job_id, dir })
    }

    #[inline]
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Return the staging path of chunk `index`.
    pub fn chunk_path(&self, index: ChunkIndex) -> PathBuf {
        self.dir.path().join(format!("part{index}"))
    }

    /// Delete the work area, reporting any failure to do so.
    pub fn close(self) -> std::io::Result<()> {
        tracing::debug!("Releasing work area for job {}: `{}`", self.job_id, self.dir.path().display());

        self.dir.close()
    }
}
