//! Transactional object storage the writer uploads into.
//!
//! The writer only relies on the traits below. [`MemoryClient`] is a complete in-memory implementation with real transaction
//! isolation, used by tests and as a reference for other backends.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use uuid::Uuid;

mod memory;
pub use memory::*;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no such object: `{0}`")]
    NotFound(String),
    #[error("object already exists: `{0}`")]
    AlreadyExists(String),
    #[error("transaction {0} is no longer active")]
    TransactionClosed(Uuid),
    #[error("{0}")]
    Other(String),
}

/// Options of [`Transaction::create()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Replace any existing object with an empty one.
    pub force: bool,
    /// Keep any existing object untouched instead of failing.
    pub ignore_existing: bool,
}

/// Options of [`Transaction::concatenate()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcatenateOptions {
    /// Append to the destination content instead of replacing it.
    pub append: bool,
}

/// Options of [`Transaction::create_writer()`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterOptions {
    /// Size of the writer internal buffers, the backend default when unset.
    pub buffer_size: Option<usize>,
}

impl WriterOptions {
    #[inline]
    pub fn with_buffer_size(self, buffer_size: usize) -> Self {
        Self {
            buffer_size: Some(buffer_size),
        }
    }
}

/// A storage client able to open transactions.
pub trait Client: Send + Sync {
    fn start_transaction(&self) -> BoxFuture<'_, Result<Arc<dyn Transaction>, StorageError>>;
}

/// A storage transaction.
///
/// Nothing done through a transaction is visible outside of it before [`Transaction::commit()`], and everything is discarded by
/// [`Transaction::abort()`]. Several [`ObjectWriter`]s may run concurrently against the same transaction, as long as they target
/// distinct objects.
pub trait Transaction: Send + Sync {
    fn id(&self) -> Uuid;

    /// Open a writer replacing the content of the object at `path` once finished.
    fn create_writer<'a>(
        &'a self,
        path: &'a str,
        options: WriterOptions,
    ) -> BoxFuture<'a, Result<Box<dyn ObjectWriter>, StorageError>>;

    fn create<'a>(&'a self, path: &'a str, options: CreateOptions) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Concatenate `sources` in order into the existing object at `destination`.
    fn concatenate<'a>(
        &'a self,
        sources: &'a [String],
        destination: &'a str,
        options: ConcatenateOptions,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    fn commit(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    fn abort(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// A writer streaming the content of one object.
pub trait ObjectWriter: Send {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Flush the written content to the object.
    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), StorageError>>;

    /// Memory held by the writer internal buffers.
    fn buffer_memory_usage(&self) -> usize;
}
