//! This module provides the transfer coordinator, driving upload and download jobs from start to terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::time::Instant;
use tokio::{fs, io};

use crate::checksum::{checksum_bytes, checksum_file};
use crate::chunk::{chunk_key, manifest_key, Chunk, ChunkIndex, Chunker, Manifest, Reassembler, WorkArea};
use crate::config::{Config, Profile, StoreConfig};
use crate::job::{Job, JobReport, JobState};
use crate::pool::{self, Direction, TransferTask};
use crate::store::{Bytes, HttpStore, ObjectStore};
use crate::{Error, ErrorKind};

const TEMP_EXT: &str = "tmp";

/// Transfer coordinator.
///
/// Runs one job at a time per call, but calls may run concurrently: every job gets its own [`WorkArea`] and the object store is
/// only ever shared read-only.
#[derive(Debug)]
pub struct Coordinator<S> {
    store: Arc<S>,
    config: Arc<Config>,
}

impl<S> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl Coordinator<HttpStore> {
    /// Create a coordinator for an HTTP object store, reading every setting from the process environment.
    pub fn from_env(profile: Profile) -> Result<Self, Error> {
        let store_config = StoreConfig::from_env(profile);
        store_config.validate()?;

        Self::new(HttpStore::new(&store_config)?, Config::from_env()?)
    }
}

impl<S: ObjectStore> Coordinator<S> {
    pub fn new(store: S, config: Config) -> Result<Self, Error> {
        Self::with_shared(Arc::new(store), Arc::new(config))
    }

    /// Create a coordinator sharing `store` and `config` with other components.
    pub fn with_shared(store: Arc<S>, config: Arc<Config>) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self { store, config })
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Upload local file `src` under destination prefix `dst`.
    ///
    /// The manifest is stored before any chunk. Chunk failures do not fail the call, they are reported in the returned
    /// [`JobReport`] together with the terminal state.
    pub async fn upload(&self, src: impl AsRef<Path>, dst: &str) -> Result<JobReport, Error> {
        let src = src.as_ref();
        let bucket = self.config.bucket.as_str();
        let mut job = Job::new(Direction::Upload);

        tracing::info!("Job {}: uploading `{}` to `{bucket}/{dst}`", job.id(), src.display());

        // local resources come before any network activity
        let area = WorkArea::create(&self.config.work_dir, job.id())?;
        let source = fs::File::open(src).await?;

        job.advance(JobState::Chunking);
        let started = Instant::now();

        let manifest = Chunker::new(self.config.chunk_size).chunk(source, &area).await?;

        job.timings_mut().preparation = started.elapsed();
        job.set_manifest(manifest.clone());

        tracing::info!(
            "Job {}: chunked {} bytes into {} parts in {:?}, checksum {}",
            job.id(),
            manifest.total_size,
            manifest.len(),
            job.timings().preparation,
            manifest.source_checksum
        );

        job.advance(JobState::Uploading);
        let started = Instant::now();

        self.ensure_bucket().await?;
        self.put_manifest(dst, &manifest).await?;

        let tasks = (0..manifest.len() as ChunkIndex).map(|index| TransferTask::new(index, Direction::Upload));
        let context = Arc::new(ChunkContext {
            store: Arc::clone(&self.store),
            area,
            manifest,
            bucket: bucket.to_owned(),
            dst: dst.to_owned(),
        });

        let batch = {
            let context = Arc::clone(&context);
            pool::execute(tasks, self.config.workers, self.config.retry, self.config.failure_policy, move |task| {
                let context = Arc::clone(&context);
                async move { context.upload(task).await }
            })
        };

        for result in batch.collect().await {
            job.record(result);
        }

        job.timings_mut().transfer = started.elapsed();
        tracing::info!("Job {}: uploaded chunks in {:?}", job.id(), job.timings().transfer);

        job.advance(JobState::CleaningUp);
        let started = Instant::now();

        let manifest = context.manifest.clone();
        release(&job, context);

        job.timings_mut().completion = started.elapsed();

        job.advance(JobState::Verifying);
        let started = Instant::now();

        let failed = job.failed_chunks();
        let state = if failed.iter().any(|chunk| chunk.kind == ErrorKind::Integrity) {
            JobState::VerificationFailed
        } else if !failed.is_empty() {
            JobState::PartiallyFailed
        } else {
            // the source must not have changed while being transferred
            let current = checksum_file(src).await?;

            if current == manifest.source_checksum {
                JobState::Completed
            } else {
                tracing::warn!(
                    "Job {}: source changed during upload, checksum {current} instead of {}",
                    job.id(),
                    manifest.source_checksum
                );
                JobState::VerificationFailed
            }
        };

        job.timings_mut().verification = started.elapsed();

        Ok(self.terminate(job, state))
    }

    /// Download the file stored under destination prefix `dst` to local path `out`.
    ///
    /// `out` is only created or replaced once the reassembled file matches the source checksum.
    pub async fn download(&self, dst: &str, out: impl AsRef<Path>) -> Result<JobReport, Error> {
        let out = out.as_ref();
        let bucket = self.config.bucket.as_str();
        let mut job = Job::new(Direction::Download);

        tracing::info!("Job {}: downloading `{bucket}/{dst}` to `{}`", job.id(), out.display());

        let area = WorkArea::create(&self.config.work_dir, job.id())?;

        job.advance(JobState::FetchingManifest);
        let started = Instant::now();

        if !self.store.bucket_exists(bucket).await? {
            return Err(Error::NotFound {
                bucket: bucket.to_owned(),
                key: manifest_key(dst),
            });
        }
        let manifest = self.get_manifest(dst).await?;

        job.timings_mut().preparation = started.elapsed();
        job.set_manifest(manifest.clone());

        tracing::info!(
            "Job {}: fetched manifest of {} bytes in {} parts, checksum {}",
            job.id(),
            manifest.total_size,
            manifest.len(),
            manifest.source_checksum
        );

        job.advance(JobState::Downloading);
        let started = Instant::now();

        let output = TempOutput::create(out, &job).await?;
        let writer = io::BufWriter::new(fs::OpenOptions::new().write(true).create_new(true).open(output.path()).await?);
        let mut reassembler = Reassembler::new(&manifest, writer);

        let tasks = (0..manifest.len() as ChunkIndex).map(|index| TransferTask::new(index, Direction::Download));
        let context = Arc::new(ChunkContext {
            store: Arc::clone(&self.store),
            area,
            manifest: manifest.clone(),
            bucket: bucket.to_owned(),
            dst: dst.to_owned(),
        });

        let mut batch = {
            let context = Arc::clone(&context);
            pool::execute(tasks, self.config.workers, self.config.retry, self.config.failure_policy, move |task| {
                let context = Arc::clone(&context);
                async move { context.download(task).await }
            })
        };

        // chunks are reassembled as soon as they arrive, while later ones are still downloading
        while let Some(result) = batch.next().await {
            if result.is_success() {
                if let Err(err) = reassembler.push(result.chunk_index, context.area.chunk_path(result.chunk_index)).await {
                    batch.cancel();
                    batch.collect().await;

                    return Err(err);
                }
            }

            job.record(result);
        }

        batch.close().await;

        job.timings_mut().transfer = started.elapsed();
        tracing::info!("Job {}: downloaded chunks in {:?}", job.id(), job.timings().transfer);

        job.advance(JobState::Reassembling);
        let started = Instant::now();

        let complete = match reassembler.finish().await {
            Ok((mut writer, written)) => {
                use io::AsyncWriteExt;

                writer.shutdown().await?;
                writer.into_inner().sync_all().await?;

                tracing::debug!("Job {}: reassembled {written} bytes: `{}`", job.id(), output.path().display());
                true
            }
            Err(err) if err.kind() == ErrorKind::Integrity => {
                tracing::warn!("Job {}: incomplete reassembly: {err}", job.id());
                false
            }
            Err(err) => return Err(err),
        };

        release(&job, context);

        job.timings_mut().completion = started.elapsed();

        job.advance(JobState::Verifying);
        let started = Instant::now();

        let state = if complete {
            let actual = checksum_file(output.path()).await?;

            if actual == manifest.source_checksum {
                output.persist(out).await?;
                JobState::Completed
            } else {
                tracing::warn!(
                    "Job {}: checksum mismatch, expected {} but reassembled {actual}",
                    job.id(),
                    manifest.source_checksum
                );
                JobState::VerificationFailed
            }
        } else {
            JobState::VerificationFailed
        };

        job.timings_mut().verification = started.elapsed();

        Ok(self.terminate(job, state))
    }

    /// Upload `src` under `dst`, then download it back to `out` and compare both checksums.
    ///
    /// The download is skipped when the upload did not complete.
    pub async fn round_trip(&self, src: impl AsRef<Path>, dst: &str, out: impl AsRef<Path>) -> Result<RoundTrip, Error> {
        let upload = self.upload(src, dst).await?;

        let download = match upload.state {
            JobState::Completed => Some(self.download(dst, out).await?),
            state => {
                tracing::warn!("Job {}: skipping download back of `{dst}` after upload ended {state}", upload.id);
                None
            }
        };

        let round_trip = RoundTrip { upload, download };

        tracing::info!(
            "Round trip of `{dst}` {} in {:?}",
            if round_trip.is_verified() { "verified" } else { "failed" },
            round_trip.upload.timings.total() + round_trip.download.as_ref().map(|d| d.timings.total()).unwrap_or_default()
        );

        Ok(round_trip)
    }

    fn terminate(&self, mut job: Job, state: JobState) -> JobReport {
        job.advance(state);

        let failed = job.failed_chunks();
        let timings = *job.timings();

        if failed.is_empty() {
            tracing::info!("Job {} ended {state} in {:?} ({timings:?})", job.id(), timings.total());
        } else {
            tracing::warn!("Job {} ended {state} in {:?} with failed chunks {failed:?}", job.id(), timings.total());
        }

        job.into_report()
    }

    async fn ensure_bucket(&self) -> Result<(), Error> {
        let bucket = self.config.bucket.as_str();

        let (result, _) = self
            .config
            .retry
            .run(format!("provisioning of bucket `{bucket}`"), |_| self.store.ensure_bucket(bucket))
            .await;

        result
    }

    async fn put_manifest(&self, dst: &str, manifest: &Manifest) -> Result<(), Error> {
        let bucket = self.config.bucket.as_str();
        let key = manifest_key(dst);
        let data = Bytes::from(manifest.serialize()?);

        let (result, _) = self
            .config
            .retry
            .run(format!("upload of `{key}`"), |_| self.store.put_object(bucket, &key, data.clone()))
            .await;

        result
    }

    async fn get_manifest(&self, dst: &str) -> Result<Manifest, Error> {
        let bucket = self.config.bucket.as_str();
        let key = manifest_key(dst);

        let (result, _) = self
            .config
            .retry
            .run(format!("download of `{key}`"), |_| self.store.get_object(bucket, &key))
            .await;

        Manifest::deserialize(&result?)
    }
}

/// Outcome of [`Coordinator::round_trip()`].
#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub upload: JobReport,
    /// Missing when the upload did not complete.
    pub download: Option<JobReport>,
}

impl RoundTrip {
    /// Whether both jobs completed with the same source checksum.
    pub fn is_verified(&self) -> bool {
        let checksum = |report: &JobReport| report.manifest.as_ref().map(|manifest| manifest.source_checksum);

        match &self.download {
            Some(download) => self.upload.is_completed() && download.is_completed() && checksum(&self.upload) == checksum(download),
            None => false,
        }
    }
}

/// Everything a single chunk transfer needs, shared by all tasks of a job.
struct ChunkContext<S> {
    store: Arc<S>,
    area: WorkArea,
    manifest: Manifest,
    bucket: String,
    dst: String,
}

impl<S: ObjectStore> ChunkContext<S> {
    fn chunk(&self, index: ChunkIndex) -> Result<&Chunk, Error> {
        self.manifest
            .chunk(index)
            .ok_or_else(|| Error::Manifest(format!("chunk #{index} is out of the manifest range")))
    }

    async fn upload(&self, task: TransferTask) -> Result<(), Error> {
        let chunk = self.chunk(task.chunk_index)?;
        let key = chunk_key(&self.dst, chunk.index);

        tracing::trace!("Uploading chunk #{} (attempt {}): `{}/{key}`", chunk.index, task.attempt_count, self.bucket);

        let data = fs::read(self.area.chunk_path(chunk.index)).await?;
        verify(chunk, &data)?;

        self.store.put_object(&self.bucket, &key, Bytes::from(data)).await
    }

    async fn download(&self, task: TransferTask) -> Result<(), Error> {
        let chunk = self.chunk(task.chunk_index)?;
        let key = chunk_key(&self.dst, chunk.index);

        tracing::trace!("Downloading chunk #{} (attempt {}): `{}/{key}`", chunk.index, task.attempt_count, self.bucket);

        let data = self.store.get_object(&self.bucket, &key).await?;
        verify(chunk, &data)?;

        fs::write(self.area.chunk_path(chunk.index), &data).await?;

        Ok(())
    }
}

/// Release the work area of `job` once every transfer task has dropped its `context`.
fn release<S>(job: &Job, context: Arc<ChunkContext<S>>) {
    match Arc::try_unwrap(context) {
        Ok(context) => {
            if let Err(err) = context.area.close() {
                tracing::warn!("Job {}: failed to release work area: {err}", job.id());
            }
        }
        // deleted when the last task drops it
        Err(_) => tracing::warn!("Job {}: work area still in use, releasing it later.", job.id()),
    }
}

/// Check a chunk payload against its manifest entry.
fn verify(chunk: &Chunk, data: &[u8]) -> Result<(), Error> {
    if data.len() as u64 != chunk.length {
        return Err(Error::LengthMismatch {
            what: format!("chunk #{}", chunk.index),
            expected: chunk.length,
            actual: data.len() as u64,
        });
    }

    let actual = checksum_bytes(data);
    if actual != chunk.checksum {
        return Err(Error::ChecksumMismatch {
            what: format!("chunk #{}", chunk.index),
            expected: chunk.checksum,
            actual,
        });
    }

    Ok(())
}

/// Download destination under construction, next to its final path.
///
/// It is deleted when dropped, unless moved onto its final path by [`TempOutput::persist()`].
#[derive(Debug)]
struct TempOutput {
    path: PathBuf,
    persisted: bool,
}

impl TempOutput {
    async fn create(out: &Path, job: &Job) -> Result<Self, Error> {
        let name = out
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid download destination `{}`", out.display())))?;

        let mut name = name.to_owned();
        name.push(format!(".{}.{TEMP_EXT}", job.id()));
        let path = out.with_file_name(name);

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        Ok(Self { path, persisted: false })
    }

    #[inline]
    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, out: &Path) -> io::Result<()> {
        fs::rename(&self.path, out).await?;
        self.persisted = true;

        Ok(())
    }
}

impl Drop for TempOutput {
    fn drop(&mut self) {
        if !self.persisted {
            tracing::debug!("Deleting unverified download: `{}`", self.path.display());

            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::{NonZeroU64, NonZeroUsize};
    use std::time::Duration;

    use super::*;
    use crate::pool::RetryPolicy;
    use crate::store::MemoryStore;

    fn config(work_dir: &Path) -> Config {
        Config::default()
            .with_bucket("test-bucket")
            .with_chunk_size(NonZeroU64::new(4).unwrap())
            .with_workers(NonZeroUsize::new(2).unwrap())
            .with_retry(RetryPolicy {
                base_delay: Duration::from_millis(1),
                ..Default::default()
            })
            .with_work_dir(work_dir)
    }

    #[test]
    fn test_verify() {
        let chunk = Chunk {
            index: 1,
            offset: 4,
            length: 4,
            checksum: checksum_bytes(b"CCDD"),
        };

        verify(&chunk, b"CCDD").unwrap();
        assert!(matches!(verify(&chunk, b"CCD"), Err(Error::LengthMismatch { .. })));
        assert!(matches!(verify(&chunk, b"CCDE"), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_new_validates_config() {
        let dir = tempfile::tempdir().unwrap();

        let err = Coordinator::new(MemoryStore::new(), config(dir.path()).with_bucket("No_Such")).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let out = dir.path().join("out/copy.bin");
        fs::write(&src, b"AABBCCDDEEFFGGHHIIJ").await.unwrap();

        let coordinator = Coordinator::new(MemoryStore::new(), config(&dir.path().join("work"))).unwrap();

        let upload = coordinator.upload(&src, "videos/src").await.unwrap();
        assert_eq!(upload.state, JobState::Completed);
        assert_eq!(upload.manifest.as_ref().unwrap().len(), 5);
        assert!(upload.failed.is_empty());

        let mut keys = coordinator.store().keys("test-bucket");
        keys.sort();
        assert_eq!(
            keys,
            [
                "videos/src.manifest",
                "videos/src/part0",
                "videos/src/part1",
                "videos/src/part2",
                "videos/src/part3",
                "videos/src/part4"
            ]
        );

        let download = coordinator.download("videos/src", &out).await.unwrap();
        assert_eq!(download.state, JobState::Completed);
        assert_eq!(fs::read(&out).await.unwrap(), b"AABBCCDDEEFFGGHHIIJ");

        // work areas and temporary outputs are all gone
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
        assert!(logs_contain("ended completed"));
    }

    #[tokio::test]
    async fn test_upload_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(MemoryStore::new(), config(&dir.path().join("work"))).unwrap();

        let err = coordinator.upload(dir.path().join("missing"), "missing").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!coordinator.store().bucket_exists("test-bucket").await.unwrap());
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(MemoryStore::new(), config(&dir.path().join("work"))).unwrap();
        coordinator.store().create_bucket("test-bucket").await.unwrap();

        let err = coordinator.download("nothing", dir.path().join("out")).await.unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }), "{err}");
        assert!(!dir.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_download_to_invalid_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"0123").await.unwrap();

        let coordinator = Coordinator::new(MemoryStore::new(), config(&dir.path().join("work"))).unwrap();
        coordinator.upload(&src, "dir").await.unwrap();

        let err = coordinator.download("dir", dir.path().join("..")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io, "{err}");
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"0123456789").await.unwrap();

        let coordinator = Coordinator::new(MemoryStore::new(), config(&dir.path().join("work"))).unwrap();

        let round_trip = coordinator.round_trip(&src, "rt", dir.path().join("rt.bin")).await.unwrap();

        assert!(round_trip.is_verified());
        assert_eq!(fs::read(dir.path().join("rt.bin")).await.unwrap(), b"0123456789");
    }
}
