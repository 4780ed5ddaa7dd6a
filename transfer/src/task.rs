//! This module provides the fixed-size worker pool running chunk transfers.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub use future::{AbortHandle, Aborted, RemoteHandle};

type Task = future::BoxFuture<'static, ()>;
type Queue = Arc<Mutex<mpsc::UnboundedReceiver<Task>>>;

/// A fixed-size pool of workers executing asynchronous tasks in the background.
///
/// Every worker pulls the next task from a single shared queue as soon as it is idle, so tasks start in the order they were
/// pushed but may complete in any order. At most `size` tasks run at the same time.
///
/// Each task comes with a remote handle on its output and an abort handle to cancel it:
/// ```
/// # tokio_test::block_on(async {
/// # use transfer::task::{Aborted, Pool};
/// let mut pool = Pool::default();
/// pool.start(2.try_into().unwrap());
///
/// let (remote_handle, _) = pool.execute(async { "part0" });
/// assert_eq!(remote_handle.await, Ok("part0"));
///
/// let (remote_handle, abort_handle) = pool.execute(async { "part1" });
/// abort_handle.abort();
/// assert_eq!(remote_handle.await, Err(Aborted));
///
/// pool.close().await;
/// # })
/// ```
#[derive(Debug, Default)]
pub struct Pool {
    workers: Vec<JoinHandle<()>>,
    /// Sending half of the task queue, `None` unless started.
    sender: Option<mpsc::UnboundedSender<Task>>,
}

impl Pool {
    /// Start `size` workers.
    ///
    /// _Note: a task pushed to a pool which is not started is dropped without being executed._
    ///
    /// # Panics
    /// This method panics if the pool is already running.
    pub fn start(&mut self, size: NonZeroUsize) {
        assert!(!self.is_running(), "pool is already running");

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: Queue = Arc::new(Mutex::new(receiver));

        self.workers = (0..size.get()).map(|id| tokio::spawn(work(id, Arc::clone(&queue)))).collect();
        self.sender = Some(sender);
    }

    /// Number of running workers.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool accepts tasks.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Push a task, returning remote and abort handles on it.
    ///
    /// Awaiting the remote handle yields the task output, or `Err(Aborted)` once cancelled through the abort handle.
    /// **Dropping the remote handle cancels the task**, call [`RemoteHandle::forget()`] to let it run to completion instead.
    pub fn execute<T: Send + 'static>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> (RemoteHandle<Result<T, Aborted>>, AbortHandle) {
        let (abortable, abort_handle) = future::abortable(future);
        let (remote, remote_handle) = abortable.remote_handle();

        self.push(remote.boxed());

        (remote_handle, abort_handle)
    }

    fn push(&self, task: Task) {
        match &self.sender {
            Some(sender) if sender.send(task).is_ok() => {}
            Some(_) => tracing::warn!("All workers are gone, dropping task."),
            None => tracing::warn!("Pool is not started, dropping task."),
        }
    }

    /// Wait for every pushed task to complete, then stop the workers.
    pub async fn close(mut self) {
        // workers exit once the queue is closed and drained
        drop(self.sender.take());

        for result in future::join_all(std::mem::take(&mut self.workers)).await {
            if let Err(err) = result {
                tracing::warn!("Worker stopped abnormally: {err}");
            }
        }
    }
}

/// Worker loop: run queued tasks one at a time until the queue is closed.
async fn work(id: usize, queue: Queue) {
    tracing::trace!("Worker {id} started.");

    loop {
        // the queue lock is only held while waiting for the next task
        let next = queue.lock().await.recv().await;

        match next {
            Some(task) => task.await,
            None => break,
        }
    }

    tracing::trace!("Task queue closed, worker {id} stopped.");
}
