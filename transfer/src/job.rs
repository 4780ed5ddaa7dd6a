//! Transfer job state and reporting.

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::chunk::{ChunkIndex, Manifest};
use crate::pool::{Direction, TransferResult};
use crate::ErrorKind;

/// Job lifecycle.
///
/// ```text
/// upload:   Created -> Chunking -> Uploading -> CleaningUp -> Verifying -> Completed | PartiallyFailed | VerificationFailed
/// download: Created -> FetchingManifest -> Downloading -> Reassembling -> Verifying -> Completed | VerificationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Chunking,
    Uploading,
    CleaningUp,
    FetchingManifest,
    Downloading,
    Reassembling,
    Verifying,
    Completed,
    /// Some chunks could not be uploaded.
    PartiallyFailed,
    /// The destination does not match the source checksum.
    VerificationFailed,
}

impl JobState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::VerificationFailed)
    }

    /// Whether a `direction` job may move from this state to `next`.
    pub fn can_advance(self, direction: Direction, next: Self) -> bool {
        use JobState::*;

        match direction {
            Direction::Upload => matches!(
                (self, next),
                (Created, Chunking)
                    | (Chunking, Uploading)
                    | (Uploading, CleaningUp)
                    | (CleaningUp, Verifying)
                    | (Verifying, Completed | PartiallyFailed | VerificationFailed)
            ),
            Direction::Download => matches!(
                (self, next),
                (Created, FetchingManifest)
                    | (FetchingManifest, Downloading)
                    | (Downloading, Reassembling)
                    | (Reassembling, Verifying)
                    | (Verifying, Completed | VerificationFailed)
            ),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Chunking => "chunking",
            Self::Uploading => "uploading",
            Self::CleaningUp => "cleaning_up",
            Self::FetchingManifest => "fetching_manifest",
            Self::Downloading => "downloading",
            Self::Reassembling => "reassembling",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::VerificationFailed => "verification_failed",
        })
    }
}

/// Time spent in each phase of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Chunking on upload, manifest fetch on download.
    pub preparation: Duration,
    pub transfer: Duration,
    /// Work area cleanup on upload, final reassembly on download.
    pub completion: Duration,
    pub verification: Duration,
}

impl Timings {
    pub fn total(&self) -> Duration {
        self.preparation + self.transfer + self.completion + self.verification
    }
}

/// A chunk which could not be transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedChunk {
    pub index: ChunkIndex,
    pub kind: ErrorKind,
}

/// A single file transfer, from creation to its terminal state.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    direction: Direction,
    state: JobState,
    manifest: Option<Manifest>,
    results: Vec<TransferResult>,
    timings: Timings,
}

impl Job {
    pub fn new(direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            state: JobState::Created,
            manifest: None,
            results: vec![],
            timings: Timings::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn state(&self) -> JobState {
        self.state
    }

    #[inline]
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    #[inline]
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub(crate) fn set_manifest(&mut self, manifest: Manifest) {
        debug_assert!(self.manifest.is_none());
        self.manifest = Some(manifest);
    }

    pub(crate) fn record(&mut self, result: TransferResult) {
        self.results.push(result);
    }

    pub(crate) fn timings_mut(&mut self) -> &mut Timings {
        &mut self.timings
    }

    /// Move to `next` state.
    ///
    /// # Panics
    /// This method panics on a transition the job lifecycle does not allow.
    pub(crate) fn advance(&mut self, next: JobState) {
        assert!(
            self.state.can_advance(self.direction, next),
            "invalid {} job transition: {} -> {next}",
            self.direction,
            self.state
        );

        tracing::debug!("Job {}: {} -> {next}", self.id, self.state);

        self.state = next;
    }

    /// Indices and error kinds of every failed chunk, in ascending index order.
    pub fn failed_chunks(&self) -> Vec<FailedChunk> {
        let mut failed: Vec<_> = self
            .results
            .iter()
            .filter_map(|result| {
                result.error_kind().map(|kind| FailedChunk {
                    index: result.chunk_index,
                    kind,
                })
            })
            .collect();
        failed.sort_by_key(|chunk| chunk.index);
        failed
    }

    /// Close a terminated job into its report.
    pub(crate) fn into_report(mut self) -> JobReport {
        debug_assert!(self.state.is_terminal());

        let failed = self.failed_chunks();
        self.results.sort_by_key(|result| result.chunk_index);

        JobReport {
            id: self.id,
            direction: self.direction,
            state: self.state,
            manifest: self.manifest,
            failed,
            results: self.results,
            timings: self.timings,
        }
    }
}

/// Outcome of a terminated job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: Uuid,
    pub direction: Direction,
    /// Terminal state.
    pub state: JobState,
    pub manifest: Option<Manifest>,
    /// Failed chunks in ascending index order.
    pub failed: Vec<FailedChunk>,
    /// Per-chunk results in ascending index order.
    pub results: Vec<TransferResult>,
    pub timings: Timings,
}

impl JobReport {
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn result(&self, index: ChunkIndex) -> Option<&TransferResult> {
        self.results.iter().find(|result| result.chunk_index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Outcome;

    const UPLOAD: [JobState; 6] = [
        JobState::Created,
        JobState::Chunking,
        JobState::Uploading,
        JobState::CleaningUp,
        JobState::Verifying,
        JobState::Completed,
    ];

    const DOWNLOAD: [JobState; 6] = [
        JobState::Created,
        JobState::FetchingManifest,
        JobState::Downloading,
        JobState::Reassembling,
        JobState::Verifying,
        JobState::Completed,
    ];

    #[test]
    fn test_transitions_are_one_directional() {
        for (direction, path) in [(Direction::Upload, UPLOAD), (Direction::Download, DOWNLOAD)] {
            for pair in path.windows(2) {
                assert!(pair[0].can_advance(direction, pair[1]), "{direction}: {} -> {}", pair[0], pair[1]);
                assert!(!pair[1].can_advance(direction, pair[0]), "{direction}: {} -> {}", pair[1], pair[0]);
            }
            for state in [JobState::Completed, JobState::PartiallyFailed, JobState::VerificationFailed] {
                assert!(state.is_terminal());
                assert!(!state.can_advance(direction, JobState::Created));
            }
        }

        assert!(JobState::Verifying.can_advance(Direction::Upload, JobState::PartiallyFailed));
        assert!(!JobState::Verifying.can_advance(Direction::Download, JobState::PartiallyFailed));
        assert!(!JobState::Created.can_advance(Direction::Upload, JobState::FetchingManifest));
        assert!(!JobState::Chunking.can_advance(Direction::Upload, JobState::Verifying));
    }

    #[test]
    #[should_panic(expected = "invalid upload job transition")]
    fn test_advance_rejects_skipping() {
        let mut job = Job::new(Direction::Upload);

        job.advance(JobState::Uploading);
    }

    #[test]
    fn test_report() {
        let mut job = Job::new(Direction::Download);
        for state in &DOWNLOAD[1..] {
            job.advance(*state);
        }

        let result = |chunk_index, outcome| TransferResult {
            chunk_index,
            direction: Direction::Download,
            outcome,
            attempt_count: 1,
            elapsed: Duration::ZERO,
        };
        let failure = |kind| Outcome::Failure {
            kind,
            message: String::new(),
        };

        job.record(result(3, failure(ErrorKind::Transport)));
        job.record(result(0, Outcome::Success));
        job.record(result(1, failure(ErrorKind::Integrity)));

        let report = job.into_report();

        assert!(report.is_completed());
        assert_eq!(
            report.failed,
            [
                FailedChunk {
                    index: 1,
                    kind: ErrorKind::Integrity
                },
                FailedChunk {
                    index: 3,
                    kind: ErrorKind::Transport
                },
            ]
        );
        assert_eq!(report.results.iter().map(|r| r.chunk_index).collect::<Vec<_>>(), [0, 1, 3]);
        assert!(report.result(0).unwrap().is_success());
        assert!(report.result(2).is_none());
    }

    #[test]
    fn test_timings_total() {
        let timings = Timings {
            preparation: Duration::from_secs(1),
            transfer: Duration::from_secs(2),
            completion: Duration::from_secs(3),
            verification: Duration::from_secs(4),
        };

        assert_eq!(timings.total(), Duration::from_secs(10));
    }
}
