use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;
use uuid::Uuid;

use crate::limiter::{LockType, ResourceGuard, ResourceLimiter, DEFAULT_RAM_LIMIT};
use crate::storage::{Client, ConcatenateOptions, CreateOptions, StorageError, Transaction, WriterOptions};
use crate::task::{Pool, RemoteHandle};

mod chunk;
pub use chunk::*;


pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1_024 * 1_024;
const DEFAULT_THREAD_COUNT: NonZeroU8 = unsafe { NonZeroU8::new_unchecked(5) };
const TEMP_MARKER: &str = "__parallel_writer__";

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("cannot start worker pool: {0}")]
    Pool(#[source] Arc<std::io::Error>),
    #[error("worker pool has no running worker")]
    PoolNotStarted,
    #[error("max chunk size of {max_chunk_size} bytes must be positive and fit in the memory limit of {capacity} bytes")]
    Misconfiguration { max_chunk_size: usize, capacity: usize },
    #[error("failed to write chunk `{path}`: {source}")]
    ChunkWrite {
        path: String,
        #[source]
        source: Arc<StorageError>,
    },
    #[error("cannot read local file `{}`: {source}", path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("storage operation failed: {0}")]
    Storage(#[source] Arc<StorageError>),
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] Arc<StorageError>),
}

impl From<StorageError> for Error {
    #[inline]
    fn from(source: StorageError) -> Self {
        Self::Storage(Arc::new(source))
    }
}

/// Options of a [`ParallelWriter`].
#[derive(Debug, Clone)]
pub struct ParallelWriterOptions {
    /// Upper bound of a single chunk, it must fit in the memory limiter capacity.
    pub max_chunk_size: usize,
    /// Number of workers of the private pool spawned by [`ParallelWriter::new()`].
    pub thread_count: NonZeroU8,
    /// Directory to stage chunks in, next to the destination when unset.
    pub tmp_directory: Option<String>,
    /// Memory budget, possibly shared between writers, a private 2 GiB one when unset.
    pub ram_limiter: Option<Arc<ResourceLimiter>>,
    /// Also reserve the memory buffered by each chunk writer.
    pub acquire_ram_for_buffers: bool,
    /// Append to the destination instead of overwriting it.
    pub append: bool,
    /// Forwarded to the writer of every chunk.
    pub writer_options: WriterOptions,
}

impl Default for ParallelWriterOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            thread_count: DEFAULT_THREAD_COUNT,
            tmp_directory: None,
            ram_limiter: None,
            acquire_ram_for_buffers: false,
            append: false,
            writer_options: WriterOptions::default(),
        }
    }
}

impl ParallelWriterOptions {
    #[inline]
    pub fn with_max_chunk_size(self, max_chunk_size: usize) -> Self {
        Self { max_chunk_size, ..self }
    }

    #[inline]
    pub fn with_thread_count(self, thread_count: NonZeroU8) -> Self {
        Self { thread_count, ..self }
    }

    #[inline]
    pub fn with_tmp_directory(self, tmp_directory: impl Into<String>) -> Self {
        Self {
            tmp_directory: Some(tmp_directory.into()),
            ..self
        }
    }

    #[inline]
    pub fn with_ram_limiter(self, ram_limiter: Arc<ResourceLimiter>) -> Self {
        Self {
            ram_limiter: Some(ram_limiter),
            ..self
        }
    }

    #[inline]
    pub fn with_acquire_ram_for_buffers(self, acquire_ram_for_buffers: bool) -> Self {
        Self {
            acquire_ram_for_buffers,
            ..self
        }
    }

    #[inline]
    pub fn with_append(self, append: bool) -> Self {
        Self { append, ..self }
    }

    #[inline]
    pub fn with_writer_options(self, writer_options: WriterOptions) -> Self {
        Self { writer_options, ..self }
    }
}

#[derive(Debug, Default)]
struct Failure {
    /// First chunk failure, never overwritten.
    error: Option<Error>,
    aborted: bool,
}

/// State shared between a writer and its chunk jobs.
#[derive(Debug, Default)]
struct SharedState {
    failure: tokio::sync::Mutex<Failure>,
    /// Raised along with `failure.error`, checked without locking.
    failed: AtomicBool,
    /// No more data is accepted.
    finished: AtomicBool,
}

impl SharedState {
    async fn error(&self) -> Option<Error> {
        self.failure.lock().await.error.clone()
    }

    /// Latch `error` unless another failure already was, and abort `transaction`.
    async fn fail(&self, error: Error, transaction: &dyn Transaction) {
        let mut failure = self.failure.lock().await;

        if failure.error.is_some() {
            tracing::debug!("Suppressing subsequent failure: {error}");
            return;
        }

        tracing::debug!("Write failed, aborting transaction {}: {error}", transaction.id());

        failure.error = Some(error);
        self.failed.store(true, Ordering::Release);
        Self::abort_once(&mut failure, transaction).await;
        self.finished.store(true, Ordering::Release);
    }

    async fn abort(&self, transaction: &dyn Transaction) {
        Self::abort_once(&mut *self.failure.lock().await, transaction).await;
    }

    async fn abort_once(failure: &mut Failure, transaction: &dyn Transaction) {
        if !failure.aborted {
            failure.aborted = true;

            // nothing gets committed anyway
            if let Err(err) = transaction.abort().await {
                tracing::warn!("Failed to abort transaction {}: {err}", transaction.id());
            }
        }
    }
}

/// Everything a chunk job needs, cloned into each of them.
#[derive(Clone)]
struct ChunkContext {
    transaction: Arc<dyn Transaction>,
    limiter: Arc<ResourceLimiter>,
    state: Arc<SharedState>,
    acquire_ram_for_buffers: bool,
    writer_options: WriterOptions,
}

impl ChunkContext {
    async fn run(self, task: WriteTask, path: String, memory_guard: ResourceGuard) {
        let _memory_guard = memory_guard;

        if self.state.failed.load(Ordering::Acquire) {
            tracing::trace!("Skipping chunk `{path}` of a failed writer");
            return;
        }

        let result = AssertUnwindSafe(self.write(&task, &path))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(StorageError::Other("chunk job panicked".to_owned())));

        match result {
            Ok(()) => tracing::trace!("Wrote chunk `{path}` ({} bytes)", task.data_size()),
            Err(source) => {
                let error = Error::ChunkWrite {
                    path,
                    source: Arc::new(source),
                };
                self.state.fail(error, &*self.transaction).await;
            }
        }
    }

    async fn write(&self, task: &WriteTask, path: &str) -> Result<(), StorageError> {
        let mut writer = self.transaction.create_writer(path, self.writer_options).await?;

        // hard: this job already holds its chunk reservation and occupies a worker
        let _buffer_guard = if self.acquire_ram_for_buffers {
            Some(self.limiter.acquire(writer.buffer_memory_usage(), LockType::Hard).await)
        } else {
            None
        };

        task.write(&mut *writer, &self.state.failed).await?;
        writer.finish().await
    }
}

/// What is left to do once no more data is accepted.
struct Assembly {
    transaction: Arc<dyn Transaction>,
    state: Arc<SharedState>,
    destination: String,
    append: bool,
    tasks: Vec<TaskDescriptor>,
    handles: Vec<RemoteHandle<()>>,
}

impl Assembly {
    /// Wait for every chunk, then either concatenate them to the destination and commit, or abort.
    async fn run(mut self) -> Result<(), Error> {
        self.join().await;

        if let Some(error) = self.state.error().await {
            self.state.abort(&*self.transaction).await;
            return Err(error);
        }

        let result = self.publish().await;
        if result.is_err() {
            self.state.abort(&*self.transaction).await;
        }
        result
    }

    async fn publish(&mut self) -> Result<(), Error> {
        let transaction = &*self.transaction;

        let (create, concatenate) = if self.append {
            let create = CreateOptions {
                ignore_existing: true,
                ..Default::default()
            };
            (create, ConcatenateOptions { append: true })
        } else {
            let create = CreateOptions {
                force: true,
                ..Default::default()
            };
            (create, ConcatenateOptions { append: false })
        };

        transaction.create(&self.destination, create).await?;

        // call order, whatever the completion order was
        self.tasks.sort_unstable_by_key(|task| task.order);
        let paths: Vec<_> = self.tasks.drain(..).map(|task| task.path).collect();

        tracing::debug!(
            "Concatenating {} chunks to `{}` in transaction {}",
            paths.len(),
            self.destination,
            transaction.id()
        );

        transaction.concatenate(&paths, &self.destination, concatenate).await?;

        for path in &paths {
            transaction.remove(path).await?;
        }

        transaction.commit().await.map_err(|source| Error::Commit(Arc::new(source)))?;

        tracing::debug!("Committed transaction {} for `{}`", transaction.id(), self.destination);

        Ok(())
    }

    /// Stop chunks early and abort, without publishing anything.
    async fn abandon(mut self) -> Result<(), Error> {
        self.state.failed.store(true, Ordering::Release);
        self.state.abort(&*self.transaction).await;

        self.join().await;

        Ok(())
    }

    /// Wait for every chunk job, failing the write for each one that was dropped without running.
    async fn join(&mut self) {
        let handles = std::mem::take(&mut self.handles);
        let outcomes = future::join_all(handles.into_iter().map(|handle| AssertUnwindSafe(handle).catch_unwind())).await;

        // jobs catch their own panics, so an unwinding handle means a cancelled job
        for (task, outcome) in self.tasks.iter().zip(outcomes) {
            if outcome.is_err() {
                let error = Error::ChunkWrite {
                    path: task.path.clone(),
                    source: Arc::new(StorageError::Other("chunk job was cancelled".to_owned())),
                };
                self.state.fail(error, &*self.transaction).await;
            }
        }
    }
}

/// Uploads data to one object of a transactional storage, splitting it into chunks written concurrently.
///
/// Each call to [`write()`](ParallelWriter::write) or [`write_file()`](ParallelWriter::write_file) splits its input into chunks of at
/// most `max_chunk_size` bytes. Each chunk reserves its size from the memory limiter, then is written to a temporary object by a
/// pool worker. [`finish()`](ParallelWriter::finish) waits for every chunk, concatenates them into the destination in call order
/// and commits, all within a single transaction: either the whole data is published, or nothing is.
///
/// The first chunk failure aborts the transaction, remaining chunks are skipped and the failure is returned by the next call.
///
/// ```
/// # tokio_test::block_on(async {
/// # use parallel_io::{ParallelWriter, ParallelWriterOptions};
/// # use parallel_io::storage::MemoryClient;
/// let client = MemoryClient::default();
/// let options = ParallelWriterOptions::default().with_max_chunk_size(4);
///
/// let mut writer = ParallelWriter::new(&client, "//home/file", options).await.unwrap();
/// writer.write("ABCDEFGHIJ").await.unwrap();
/// writer.write("KL").await.unwrap();
/// writer.finish().await.unwrap();
///
/// assert_eq!(client.read("//home/file").unwrap(), b"ABCDEFGHIJKL");
/// assert_eq!(client.list(), ["//home/file"]);
/// # })
/// ```
///
/// # Dropping
/// A writer dropped before being finished is finished on the spot, blocking the dropping thread until the destination is
/// committed. If that implicit finish fails, there is no caller left to report to and the process is aborted. A writer dropped
/// while panicking aborts its transaction instead.
pub struct ParallelWriter {
    path: String,
    max_chunk_size: usize,
    append: bool,
    tmp_path_prefix: String,
    pool: Arc<Pool>,
    context: ChunkContext,
    next_call: usize,
    tasks: Vec<TaskDescriptor>,
    handles: Vec<RemoteHandle<()>>,
    finalized: bool,
}

impl ParallelWriter {
    /// Open a writer to `path` with its own pool of `options.thread_count` workers.
    pub async fn new(client: &dyn Client, path: impl Into<String>, options: ParallelWriterOptions) -> Result<Self, Error> {
        let pool = Pool::with_workers(options.thread_count).map_err(|source| Error::Pool(Arc::new(source)))?;
        Self::with_pool(client, path, Arc::new(pool), options).await
    }

    /// Open a writer to `path` scheduling its chunks on `pool`.
    pub async fn with_pool(
        client: &dyn Client,
        path: impl Into<String>,
        pool: Arc<Pool>,
        options: ParallelWriterOptions,
    ) -> Result<Self, Error> {
        let path = path.into();

        if pool.size() == 0 {
            return Err(Error::PoolNotStarted);
        }

        let limiter = match options.ram_limiter {
            Some(limiter) => limiter,
            None => Arc::new(ResourceLimiter::new(DEFAULT_RAM_LIMIT, format!("ParallelWriter[{path}]"))),
        };

        // a chunk larger than the whole budget could never be scheduled
        if options.max_chunk_size == 0 || options.max_chunk_size > limiter.capacity() {
            return Err(Error::Misconfiguration {
                max_chunk_size: options.max_chunk_size,
                capacity: limiter.capacity(),
            });
        }

        let transaction = client.start_transaction().await?;

        let tmp_path_prefix = match options.tmp_directory {
            Some(dir) => format!("{dir}/{}", Uuid::new_v4()),
            None => path.clone(),
        };

        tracing::debug!("Opened parallel writer to `{path}` in transaction {}", transaction.id());

        Ok(Self {
            path,
            max_chunk_size: options.max_chunk_size,
            append: options.append,
            tmp_path_prefix,
            pool,
            context: ChunkContext {
                transaction,
                limiter,
                state: Default::default(),
                acquire_ram_for_buffers: options.acquire_ram_for_buffers,
                writer_options: options.writer_options,
            },
            next_call: 0,
            tasks: Vec::new(),
            handles: Vec::new(),
            finalized: false,
        })
    }

    /// Destination path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Schedule `blob` to be written after the data of previous calls.
    ///
    /// Only waits for the memory limiter to grant room for each chunk, the chunks themselves are written in the background.
    pub async fn write(&mut self, blob: impl Into<Bytes>) -> Result<(), Error> {
        self.ensure_alive().await?;

        let blob = blob.into();
        let call = self.next_call();

        for (sub, start) in (0..blob.len()).step_by(self.max_chunk_size).enumerate() {
            let end = blob.len().min(start + self.max_chunk_size);
            self.schedule(WriteTask::Blob(blob.slice(start..end)), (call, sub)).await;
        }

        Ok(())
    }

    /// Schedule the content of the local `file` to be written after the data of previous calls.
    ///
    /// The file is read by the workers, it must not change until the writer is finished.
    pub async fn write_file(&mut self, file: impl AsRef<Path>) -> Result<(), Error> {
        self.ensure_alive().await?;

        let file = file.as_ref();
        let length = tokio::fs::metadata(file)
            .await
            .map_err(|source| Error::LocalFile {
                path: file.to_owned(),
                source: Arc::new(source),
            })?
            .len();
        let call = self.next_call();

        for (sub, start) in (0..length).step_by(self.max_chunk_size).enumerate() {
            let task = WriteTask::FileRange {
                file: file.to_owned(),
                start,
                length: (self.max_chunk_size as u64).min(length - start),
            };
            self.schedule(task, (call, sub)).await;
        }

        Ok(())
    }

    /// Wait for all chunks and publish the destination, or return the first failure.
    ///
    /// Only the first call does anything.
    pub async fn finish(&mut self) -> Result<(), Error> {
        match self.finalize() {
            Some(assembly) => assembly.run().await,
            None => Ok(()),
        }
    }

    /// Give up the write: abort the transaction and wait for running chunks to stop.
    ///
    /// Does nothing if the writer is already finished.
    pub async fn abort(&mut self) {
        if let Some(assembly) = self.finalize() {
            let _ = assembly.abandon().await;
        }
    }

    async fn ensure_alive(&self) -> Result<(), Error> {
        let state = &self.context.state;

        if state.failed.load(Ordering::Acquire) {
            if let Some(error) = state.error().await {
                return Err(error);
            }
        }

        if state.finished.load(Ordering::Acquire) {
            return Err(Error::InvalidState("writer is already finished"));
        }

        Ok(())
    }

    #[inline]
    fn next_call(&mut self) -> usize {
        let call = self.next_call;
        self.next_call += 1;
        call
    }

    fn tmp_path(&self, (call, sub): OrderKey) -> String {
        format!("{}{TEMP_MARKER}{call}_{sub}", self.tmp_path_prefix)
    }

    async fn schedule(&mut self, task: WriteTask, order: OrderKey) {
        let path = self.tmp_path(order);

        let memory_guard = self.context.limiter.acquire(task.data_size(), LockType::Soft).await;

        tracing::trace!("Scheduling chunk {order:?} of {} bytes to `{path}`", task.data_size());

        let handle = self.pool.execute(self.context.clone().run(task, path.clone(), memory_guard));

        self.tasks.push(TaskDescriptor { path, order });
        self.handles.push(handle);
    }

    /// Stop accepting data and hand over what is left to do, once.
    fn finalize(&mut self) -> Option<Assembly> {
        if std::mem::replace(&mut self.finalized, true) {
            return None;
        }

        self.context.state.finished.store(true, Ordering::Release);

        Some(Assembly {
            transaction: Arc::clone(&self.context.transaction),
            state: Arc::clone(&self.context.state),
            destination: self.path.clone(),
            append: self.append,
            tasks: std::mem::take(&mut self.tasks),
            handles: std::mem::take(&mut self.handles),
        })
    }
}

impl Drop for ParallelWriter {
    fn drop(&mut self) {
        let Some(assembly) = self.finalize() else {
            return;
        };

        let path = self.path.clone();

        let teardown: BoxFuture<'static, Result<(), Error>> = if std::thread::panicking() {
            tracing::warn!("Writer to `{path}` dropped while panicking, aborting its transaction");
            assembly.abandon().boxed()
        } else {
            tracing::debug!("Writer to `{path}` dropped before being finished, finishing it now");
            assembly.run().boxed()
        };

        // the chunk jobs run on the pool runtime, so blocking this thread never stalls them
        match self.pool.block_on(teardown) {
            Ok(result) => finish_or_die(&path, result),
            Err(err) => {
                tracing::error!("Implicit finish of writer to `{path}` did not complete: {err}");
                std::process::abort();
            }
        }
    }
}

fn finish_or_die(path: &str, result: Result<(), Error>) {
    if let Err(err) = result {
        tracing::error!("Implicit finish of writer to `{path}` failed, no caller is left to handle it: {err}");
        std::process::abort();
    }
}

/// Upload the local `file` to `path` in a single call.
pub async fn write_file_parallel(
    client: &dyn Client,
    file: impl AsRef<Path>,
    path: impl Into<String>,
    options: ParallelWriterOptions,
) -> Result<(), Error> {
    let mut writer = ParallelWriter::new(client, path, options).await?;

    if let Err(err) = writer.write_file(file).await {
        writer.abort().await;
        return Err(err);
    }

    writer.finish().await
}
