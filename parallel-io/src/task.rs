//! This module provides the worker pool chunk jobs are scheduled on.

use std::io;
use std::num::NonZeroU8;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use tokio::runtime::{Runtime, RuntimeFlavor};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};

pub use future::RemoteHandle;

type Job = future::BoxFuture<'static, ()>;
type Receiver = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// A fixed-size pool of background workers executing asynchronous jobs on a runtime of their own.
///
/// Each worker runs one job at a time until completion, so the number of workers bounds how many jobs make progress
/// concurrently. Jobs are queued without limit and picked up in submission order by the next idle worker.
///
/// Workers do not run on the caller's runtime: a caller may block its thread, even on a current-thread runtime, while
/// waiting for jobs without stalling them.
///
/// # Keep a handle on jobs
/// Jobs are pushed with [`Pool::execute()`], which returns a remote handle resolving to the job output once it completes.
///
/// # Forget jobs
/// Jobs returning `()` can be pushed and forgotten with [`Pool::forget()`].
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use parallel_io::task::Pool;
/// let pool = Pool::with_workers(3.try_into().unwrap()).unwrap();
///
/// let handles: Vec<_> = (0..6).map(|i| pool.execute(async move { i * 2 })).collect();
///
/// assert_eq!(futures::future::join_all(handles).await, [0, 2, 4, 6, 8, 10]);
///
/// pool.close().await;
/// # })
/// ```
#[derive(Debug, Default)]
pub struct Pool {
    /// Runtime driving the workers, present while started.
    runtime: Option<Runtime>,
    /// Worker loops, identified by their id.
    workers: Vec<(usize, JoinHandle<()>)>,
    /// The sending part of a channel to push jobs to the workers.
    ///
    /// The next available worker will wait for a job to be received through the channel.
    sender: Option<mpsc::UnboundedSender<Job>>,
}

impl Pool {
    /// Create a pool already started with `size` workers.
    pub fn with_workers(size: NonZeroU8) -> io::Result<Self> {
        let mut pool = Self::default();
        pool.start(size)?;
        Ok(pool)
    }

    /// Start a pool with `size` workers, each on a dedicated thread.
    ///
    /// _Note: if a job is sent to the pool while not started, it is just lost without executing anything._
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroU8) -> io::Result<()> {
        assert!(self.runtime.is_none() && self.sender.is_none() && self.workers.is_empty());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(size.get().into())
            .thread_name("parallel-io-worker")
            .enable_all()
            .build()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let first = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.workers = (0..size)
            .map(|i| {
                let id = first.wrapping_add(i);
                tracing::debug!("Starting worker {id}...");
                (id, runtime.spawn(work(id, Arc::clone(&receiver))))
            })
            .collect();
        self.sender = Some(sender);
        self.runtime = Some(runtime);

        Ok(())
    }

    /// Number of workers currently running.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Send a job and keep a remote handle on its output.
    ///
    /// Awaiting the handle yields the job output. A panic inside the job is resumed on the awaiting side, and so is the
    /// cancellation of a job dropped without running, for instance by an unstarted pool.
    ///
    /// **Dropping the handle cancels the job**, use [`RemoteHandle::forget()`] to let it run in the background instead.
    pub fn execute<T: Send + 'static>(&self, job: impl Future<Output = T> + Send + 'static) -> RemoteHandle<T> {
        let (remote, remote_handle) = job.remote_handle();

        self.forget(remote);

        remote_handle
    }

    /// Send a job and forget it.
    #[inline]
    pub fn forget(&self, job: impl Future<Output = ()> + Send + 'static) {
        match self.sender {
            Some(ref sender) => {
                if sender.send(job.boxed()).is_err() {
                    tracing::warn!("All workers are gone, dropping job.");
                }
            }
            None => tracing::warn!("Pool is not started, dropping job."),
        }
    }

    /// Run `job` on the pool runtime, outside of the workers, and block the current thread until it completes.
    ///
    /// Callable from synchronous code as well as from within any tokio runtime, whose thread is blocked meanwhile. A stopped pool
    /// runs `job` on the current thread instead.
    pub fn block_on<T: Send + 'static>(&self, job: impl Future<Output = T> + Send + 'static) -> Result<T, JoinError> {
        let job = match self.runtime {
            Some(ref runtime) => runtime.spawn(job).boxed(),
            None => job.map(Ok).boxed(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| futures::executor::block_on(job))
            }
            _ => futures::executor::block_on(job),
        }
    }

    /// Stop current pool of workers, waiting for all pending jobs to complete.
    ///
    /// Once stopped, the pool can be started again with any number of workers.
    pub async fn stop(&mut self) {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        future::join_all(workers.into_iter().map(|(id, handle)| {
            tracing::debug!("Stopping worker {id}...");
            handle
        }))
        .await;

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }

    /// Close current pool of workers, waiting for all pending jobs to complete.
    pub async fn close(mut self) {
        self.stop().await
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // pending jobs are dropped along with the runtime, never blocking the dropping thread
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn work(id: usize, receiver: Receiver) {
    loop {
        let message = receiver.lock().await.recv().await;

        let Some(job) = message else {
            tracing::debug!("All jobs exhausted, shutting down worker {id}.");
            break;
        };

        tracing::trace!("Executing job on worker {id}...");
        job.await;
    }
}
