//! This module provides chunk transfer dispatching over a [`task::Pool`](crate::task::Pool).
//!
//! Every chunk becomes one [`TransferTask`], owned by a single worker for all of its attempts. Outcomes are reported through a
//! result channel as soon as they are known, in completion order.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::chunk::ChunkIndex;
use crate::task::{AbortHandle, Pool};
use crate::{Error, ErrorKind};

/// Transfer direction of a task, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upload => "upload",
            Self::Download => "download",
        })
    }
}

/// A single chunk transfer, handed to the operation on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTask {
    pub chunk_index: ChunkIndex,
    pub direction: Direction,
    /// Current attempt, starting at 1 once handed to the operation.
    ///
    /// A task which has not been dispatched yet has made 0 attempts.
    pub attempt_count: u32,
}

impl TransferTask {
    pub fn new(chunk_index: ChunkIndex, direction: Direction) -> Self {
        Self {
            chunk_index,
            direction,
            attempt_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { kind: ErrorKind, message: String },
}

/// Final outcome of a [`TransferTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub chunk_index: ChunkIndex,
    pub direction: Direction,
    pub outcome: Outcome,
    /// Attempts made, 0 when the task was cancelled before its first attempt.
    pub attempt_count: u32,
    pub elapsed: Duration,
}

impl TransferResult {
    fn cancelled(chunk_index: ChunkIndex, direction: Direction) -> Self {
        Self {
            chunk_index,
            direction,
            outcome: Outcome::Failure {
                kind: ErrorKind::Cancelled,
                message: "cancelled after a sibling integrity failure".into(),
            },
            attempt_count: 0,
            elapsed: Duration::ZERO,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Failure { kind, .. } => Some(kind),
        }
    }
}

const DEFAULT_MAX_ATTEMPTS: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(3) };

/// Per-task retry policy with bounded exponential backoff.
///
/// Only transient failures (see [`Error::is_transient()`]) are attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    /// Delay before the second attempt, doubled for every following one.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (starting at 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);

        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails for good or exhausts the attempts.
    ///
    /// `op` receives the attempt number, starting at 1. Returns the last outcome with the number of attempts made.
    pub async fn run<T, F, Fut>(&self, what: impl fmt::Display, mut op: F) -> (Result<T, Error>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let max_attempts = self.max_attempts.get();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay(attempt);

                    tracing::warn!("Attempt {attempt}/{max_attempts} of {what} failed, retrying in {delay:?}: {err}");

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::warn!("Attempt {attempt}/{max_attempts} of {what} failed for good: {err}");

                    return (Err(err), attempt);
                }
            }
        }
    }
}

/// What happens to sibling tasks once a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Siblings always run to completion.
    #[default]
    Continue,
    /// The first integrity failure cancels every task still pending or running.
    FailFast,
}

/// Dispatch `tasks` to a pool of `concurrency` workers, each running `op` under `retry`.
///
/// Tasks are started in the given order. The returned [`Batch`] yields their results in completion order.
pub fn execute<F, Fut>(
    tasks: impl IntoIterator<Item = TransferTask>,
    concurrency: NonZeroUsize,
    retry: RetryPolicy,
    policy: FailurePolicy,
    op: F,
) -> Batch
where
    F: Fn(TransferTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let mut pool = Pool::default();
    pool.start(concurrency);

    let op = Arc::new(op);
    let (sender, results) = mpsc::unbounded_channel();
    let mut pending = BTreeMap::new();
    let mut aborts = vec![];

    for task in tasks {
        if pending.insert(task.chunk_index, task.direction).is_some() {
            tracing::warn!("Chunk #{} dispatched twice, ignoring duplicate task.", task.chunk_index);
            continue;
        }

        let op = Arc::clone(&op);
        let sender = sender.clone();

        let (remote_handle, abort_handle) = pool.execute(async move {
            let started = Instant::now();
            let what = format!("{} of chunk #{}", task.direction, task.chunk_index);

            let (result, attempt_count) = retry
                .run(&what, |attempt_count| (*op)(TransferTask { attempt_count, ..task }))
                .await;

            let outcome = match result {
                Ok(()) => Outcome::Success,
                Err(err) => Outcome::Failure {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            };

            tracing::debug!("Completed {what} after {attempt_count} attempt(s): {outcome:?}");

            // the receiving side is only gone when the batch was dropped
            let _ = sender.send(TransferResult {
                chunk_index: task.chunk_index,
                direction: task.direction,
                outcome,
                attempt_count,
                elapsed: started.elapsed(),
            });
        });

        remote_handle.forget();
        aborts.push(abort_handle);
    }

    Batch {
        pool,
        results,
        pending,
        aborts,
        policy,
        cancelled: false,
    }
}

/// Results of dispatched transfer tasks, in completion order.
#[derive(Debug)]
pub struct Batch {
    pool: Pool,
    results: mpsc::UnboundedReceiver<TransferResult>,
    /// Tasks without a result yet.
    pending: BTreeMap<ChunkIndex, Direction>,
    aborts: Vec<AbortHandle>,
    policy: FailurePolicy,
    cancelled: bool,
}

impl Batch {
    /// Number of tasks without a result yet.
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Abort every task still pending or running.
    ///
    /// Cancelled tasks are reported with [`ErrorKind::Cancelled`].
    pub fn cancel(&mut self) {
        if !self.cancelled {
            tracing::debug!("Cancelling {} pending transfer task(s).", self.pending.len());

            self.aborts.iter().for_each(AbortHandle::abort);
            self.cancelled = true;
        }
    }

    /// Wait for the next result, or return `None` once every task has reported.
    pub async fn next(&mut self) -> Option<TransferResult> {
        match self.results.recv().await {
            Some(result) => {
                self.pending.remove(&result.chunk_index);

                if self.policy == FailurePolicy::FailFast && result.error_kind() == Some(ErrorKind::Integrity) {
                    self.cancel();
                }

                Some(result)
            }
            // every task is done, remaining ones were aborted before reporting
            None => self
                .pending
                .pop_first()
                .map(|(chunk_index, direction)| TransferResult::cancelled(chunk_index, direction)),
        }
    }

    /// Wait for every remaining result, then stop the pool.
    pub async fn collect(mut self) -> Vec<TransferResult> {
        let mut results = Vec::with_capacity(self.pending.len());

        while let Some(result) = self.next().await {
            results.push(result);
        }

        self.close().await;

        results
    }

    /// Stop the pool once every task has completed.
    pub async fn close(self) {
        self.pool.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn transient() -> Error {
        Error::Status {
            status: 503,
            resource: "bucket/key".into(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn uploads(n: ChunkIndex) -> Vec<TransferTask> {
        (0..n).map(|i| TransferTask::new(i, Direction::Upload)).collect()
    }

    fn by_index(results: Vec<TransferResult>) -> HashMap<ChunkIndex, TransferResult> {
        results.into_iter().map(|r| (r.chunk_index, r)).collect()
    }

    #[test]
    fn test_new_task_is_not_attempted() {
        let task = TransferTask::new(7, Direction::Download);

        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.chunk_index, 7);
    }

    #[test]
    fn test_delay_is_bounded() {
        let retry = RetryPolicy::default();

        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(400));
        assert_eq!(retry.delay(10), Duration::from_secs(5));
        assert_eq!(retry.delay(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_last_attempt() {
        let (result, attempts) = quick_retry()
            .run("test", |attempt| async move { if attempt < 3 { Err(transient()) } else { Ok(attempt) } })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let (result, attempts) = quick_retry().run("test", |_| async { Err::<(), _>(transient()) }).await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_failures() {
        let (result, attempts) = quick_retry()
            .run("test", |_| async {
                Err::<(), _>(Error::NotFound {
                    bucket: "b".into(),
                    key: "k".into(),
                })
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_execute_retries_per_task() {
        let calls = Arc::new(Mutex::new(HashMap::<ChunkIndex, Vec<u32>>::new()));
        let seen = Arc::clone(&calls);

        let batch = execute(uploads(6), 4.try_into().unwrap(), quick_retry(), FailurePolicy::Continue, move |task| {
            seen.lock().unwrap().entry(task.chunk_index).or_default().push(task.attempt_count);
            async move {
                match task.chunk_index {
                    2 if task.attempt_count < 3 => Err(transient()),
                    4 => Err(transient()),
                    5 => Err(Error::LengthMismatch {
                        what: "chunk #5".into(),
                        expected: 1,
                        actual: 0,
                    }),
                    _ => Ok(()),
                }
            }
        });

        let results = by_index(batch.collect().await);
        assert_eq!(results.len(), 6);

        assert!(results[&2].is_success());
        assert_eq!(results[&2].attempt_count, 3);
        assert_eq!(results[&4].error_kind(), Some(ErrorKind::Transport));
        assert_eq!(results[&4].attempt_count, 3);
        assert_eq!(results[&5].error_kind(), Some(ErrorKind::Integrity));
        assert_eq!(results[&5].attempt_count, 1);
        for i in [0, 1, 3] {
            assert!(results[&i].is_success());
            assert_eq!(results[&i].attempt_count, 1);
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls[&0], [1]);
        assert_eq!(calls[&2], [1, 2, 3]);
        assert_eq!(calls[&4], [1, 2, 3]);
        assert_eq!(calls[&5], [1]);
        assert!(logs_contain("retrying"));
    }

    #[tokio::test]
    async fn test_execute_completion_order_is_unspecified() {
        let batch = execute(uploads(3), 3.try_into().unwrap(), quick_retry(), FailurePolicy::Continue, |task| async move {
            tokio::time::sleep(Duration::from_millis(30 - 10 * u64::from(task.chunk_index))).await;
            Ok(())
        });

        let order: Vec<_> = batch.collect().await.into_iter().map(|r| r.chunk_index).collect();

        assert_eq!(order, [2, 1, 0]);
    }

    #[tokio::test]
    async fn test_execute_continue_lets_siblings_finish() {
        let batch = execute(uploads(4), 1.try_into().unwrap(), quick_retry(), FailurePolicy::Continue, |task| async move {
            match task.chunk_index {
                0 => Err(Error::LengthMismatch {
                    what: "chunk #0".into(),
                    expected: 1,
                    actual: 0,
                }),
                _ => Ok(()),
            }
        });

        let results = by_index(batch.collect().await);

        assert_eq!(results[&0].error_kind(), Some(ErrorKind::Integrity));
        assert!((1..4).all(|i| results[&i].is_success()));
    }

    #[tokio::test]
    async fn test_execute_fail_fast_cancels_siblings() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let batch = execute(uploads(8), 1.try_into().unwrap(), quick_retry(), FailurePolicy::FailFast, move |task| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match task.chunk_index {
                    1 => Err(Error::LengthMismatch {
                        what: "chunk #1".into(),
                        expected: 1,
                        actual: 0,
                    }),
                    _ => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(())
                    }
                }
            }
        });

        let results = by_index(batch.collect().await);
        assert_eq!(results.len(), 8);

        assert!(results[&0].is_success());
        assert_eq!(results[&1].error_kind(), Some(ErrorKind::Integrity));

        let cancelled: Vec<_> = (2..8).filter(|i| results[i].error_kind() == Some(ErrorKind::Cancelled)).collect();
        assert!(!cancelled.is_empty());
        assert!(started.load(Ordering::SeqCst) < 8);
    }

    #[tokio::test]
    async fn test_execute_nothing() {
        let batch = execute(Vec::new(), 2.try_into().unwrap(), quick_retry(), FailurePolicy::Continue, |_| async { Ok(()) });

        assert!(batch.collect().await.is_empty());
    }
}
