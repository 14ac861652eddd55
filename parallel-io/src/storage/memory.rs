use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::future::{self, BoxFuture, FutureExt};

use super::*;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1_024;

type Objects = HashMap<String, Vec<u8>>;

/// An in-memory transactional object store.
///
/// Clones share the same committed objects. Each transaction stages its changes privately: they are published atomically on
/// commit and dropped on abort.
///
/// ```
/// # tokio_test::block_on(async {
/// # use parallel_io::storage::{Client, MemoryClient, WriterOptions};
/// let client = MemoryClient::default();
///
/// let tx = client.start_transaction().await.unwrap();
/// let mut writer = tx.create_writer("//tmp/a", WriterOptions::default()).await.unwrap();
/// writer.write(b"hello").await.unwrap();
/// writer.finish().await.unwrap();
/// assert!(!client.exists("//tmp/a"));
///
/// tx.commit().await.unwrap();
/// assert_eq!(client.read("//tmp/a").as_deref(), Some(&b"hello"[..]));
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct MemoryClient {
    objects: Arc<RwLock<Objects>>,
    buffer_size: usize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self {
            objects: Default::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl MemoryClient {
    /// Build a client whose writers report `buffer_size` bytes of buffer memory.
    #[inline]
    pub fn with_buffer_size(self, buffer_size: usize) -> Self {
        Self { buffer_size, ..self }
    }

    /// Read the committed content of the object at `path`.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.objects().get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.objects().contains_key(path)
    }

    /// List committed object paths, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.objects().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    /// Store an object directly, outside of any transaction.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.into(), data.into());
    }

    fn objects(&self) -> std::sync::RwLockReadGuard<'_, Objects> {
        self.objects.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Client for MemoryClient {
    fn start_transaction(&self) -> BoxFuture<'_, Result<Arc<dyn Transaction>, StorageError>> {
        let state = TransactionState {
            id: Uuid::new_v4(),
            committed: Arc::clone(&self.objects),
            buffer_size: self.buffer_size,
            staged: Mutex::default(),
        };

        tracing::trace!("Started in-memory transaction {}", state.id);

        let transaction: Arc<dyn Transaction> = Arc::new(MemoryTransaction(Arc::new(state)));
        future::ready(Ok(transaction)).boxed()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Status {
    #[default]
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
struct Staged {
    status: Status,
    /// Pending changes by path, `None` standing for a removal.
    changes: HashMap<String, Option<Vec<u8>>>,
}

impl Staged {
    fn lookup<'a>(&'a self, committed: &'a Objects, path: &str) -> Option<&'a Vec<u8>> {
        match self.changes.get(path) {
            Some(change) => change.as_ref(),
            None => committed.get(path),
        }
    }
}

#[derive(Debug)]
struct TransactionState {
    id: Uuid,
    committed: Arc<RwLock<Objects>>,
    buffer_size: usize,
    staged: Mutex<Staged>,
}

impl TransactionState {
    fn active(&self) -> Result<MutexGuard<'_, Staged>, StorageError> {
        let staged = self.staged.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        match staged.status {
            Status::Active => Ok(staged),
            _ => Err(StorageError::TransactionClosed(self.id)),
        }
    }

    fn put(&self, path: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.active()?.changes.insert(path.to_owned(), Some(data));
        Ok(())
    }

    fn create(&self, path: &str, options: CreateOptions) -> Result<(), StorageError> {
        let mut staged = self.active()?;
        let committed = self.committed.read().unwrap_or_else(|poisoned| poisoned.into_inner());

        if staged.lookup(&committed, path).is_some() {
            if options.ignore_existing {
                return Ok(());
            }
            if !options.force {
                return Err(StorageError::AlreadyExists(path.to_owned()));
            }
        }
        drop(committed);

        staged.changes.insert(path.to_owned(), Some(Vec::new()));
        Ok(())
    }

    fn concatenate(&self, sources: &[String], destination: &str, options: ConcatenateOptions) -> Result<(), StorageError> {
        let mut staged = self.active()?;
        let committed = self.committed.read().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut content = match staged.lookup(&committed, destination) {
            Some(existing) if options.append => existing.clone(),
            Some(_) => Vec::new(),
            None => return Err(StorageError::NotFound(destination.to_owned())),
        };

        for source in sources {
            let data = staged
                .lookup(&committed, source)
                .ok_or_else(|| StorageError::NotFound(source.clone()))?;
            content.extend_from_slice(data);
        }
        drop(committed);

        staged.changes.insert(destination.to_owned(), Some(content));
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        let mut staged = self.active()?;
        let committed = self.committed.read().unwrap_or_else(|poisoned| poisoned.into_inner());

        if staged.lookup(&committed, path).is_none() {
            return Err(StorageError::NotFound(path.to_owned()));
        }
        drop(committed);

        staged.changes.insert(path.to_owned(), None);
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut staged = self.active()?;
        let mut committed = self.committed.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        for (path, change) in staged.changes.drain() {
            match change {
                Some(data) => committed.insert(path, data),
                None => committed.remove(&path),
            };
        }
        staged.status = Status::Committed;

        tracing::trace!("Committed in-memory transaction {}", self.id);

        Ok(())
    }

    fn abort(&self) -> Result<(), StorageError> {
        let mut staged = self.active()?;
        staged.changes.clear();
        staged.status = Status::Aborted;

        tracing::trace!("Aborted in-memory transaction {}", self.id);

        Ok(())
    }
}

/// A transaction opened by a [`MemoryClient`].
#[derive(Debug)]
pub struct MemoryTransaction(Arc<TransactionState>);

impl Transaction for MemoryTransaction {
    #[inline]
    fn id(&self) -> Uuid {
        self.0.id
    }

    fn create_writer<'a>(
        &'a self,
        path: &'a str,
        options: WriterOptions,
    ) -> BoxFuture<'a, Result<Box<dyn ObjectWriter>, StorageError>> {
        let writer = self.0.active().map(|_| {
            Box::new(MemoryObjectWriter {
                transaction: Arc::clone(&self.0),
                path: path.to_owned(),
                buffer_size: options.buffer_size.unwrap_or(self.0.buffer_size),
                data: Vec::new(),
            }) as Box<dyn ObjectWriter>
        });

        future::ready(writer).boxed()
    }

    fn create<'a>(&'a self, path: &'a str, options: CreateOptions) -> BoxFuture<'a, Result<(), StorageError>> {
        future::ready(self.0.create(path, options)).boxed()
    }

    fn concatenate<'a>(
        &'a self,
        sources: &'a [String],
        destination: &'a str,
        options: ConcatenateOptions,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        future::ready(self.0.concatenate(sources, destination, options)).boxed()
    }

    fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        future::ready(self.0.remove(path)).boxed()
    }

    fn commit(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        future::ready(self.0.commit()).boxed()
    }

    fn abort(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        future::ready(self.0.abort()).boxed()
    }
}

/// Buffers the whole object content and stages it on finish.
#[derive(Debug)]
struct MemoryObjectWriter {
    transaction: Arc<TransactionState>,
    path: String,
    buffer_size: usize,
    data: Vec<u8>,
}

impl ObjectWriter for MemoryObjectWriter {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, Result<(), StorageError>> {
        self.data.extend_from_slice(data);
        future::ready(Ok(())).boxed()
    }

    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<(), StorageError>> {
        let Self { transaction, path, data, .. } = *self;
        future::ready(transaction.put(&path, data)).boxed()
    }

    #[inline]
    fn buffer_memory_usage(&self) -> usize {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(tx: &dyn Transaction, path: &str, data: &[u8]) {
        let mut writer = tx.create_writer(path, WriterOptions::default()).await.unwrap();
        writer.write(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_discards_changes() {
        let client = MemoryClient::default();
        client.insert("//keep", "kept");

        let tx = client.start_transaction().await.unwrap();
        write(&*tx, "//new", b"data").await;
        tx.remove("//keep").await.unwrap();
        tx.abort().await.unwrap();

        assert_eq!(client.list(), ["//keep"]);
        assert!(matches!(tx.commit().await, Err(StorageError::TransactionClosed(id)) if id == tx.id()));
    }

    #[tokio::test]
    async fn test_create_options() {
        let client = MemoryClient::default();
        client.insert("//file", "old");
        let tx = client.start_transaction().await.unwrap();

        assert!(matches!(
            tx.create("//file", CreateOptions::default()).await,
            Err(StorageError::AlreadyExists(_))
        ));

        let ignore = CreateOptions {
            ignore_existing: true,
            ..Default::default()
        };
        tx.create("//file", ignore).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(client.read("//file").unwrap(), b"old");

        let tx = client.start_transaction().await.unwrap();
        let force = CreateOptions {
            force: true,
            ..Default::default()
        };
        tx.create("//file", force).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(client.read("//file").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_concatenate_sees_staged_objects() {
        let client = MemoryClient::default();
        client.insert("//dst", "0");
        let tx = client.start_transaction().await.unwrap();

        write(&*tx, "//a", b"12").await;
        write(&*tx, "//b", b"34").await;

        let sources = ["//a".to_owned(), "//b".to_owned()];
        tx.concatenate(&sources, "//dst", ConcatenateOptions { append: true }).await.unwrap();
        tx.concatenate(&sources[1..], "//dst", ConcatenateOptions { append: true }).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(client.read("//dst").unwrap(), b"0123434");

        let tx = client.start_transaction().await.unwrap();
        tx.concatenate(&sources[..1], "//dst", ConcatenateOptions::default()).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(client.read("//dst").unwrap(), b"12");
    }

    #[tokio::test]
    async fn test_missing_objects() {
        let client = MemoryClient::default();
        let tx = client.start_transaction().await.unwrap();

        assert!(matches!(tx.remove("//nope").await, Err(StorageError::NotFound(p)) if p == "//nope"));
        assert!(matches!(
            tx.concatenate(&[], "//nope", ConcatenateOptions::default()).await,
            Err(StorageError::NotFound(_))
        ));

        tx.create("//dst", CreateOptions::default()).await.unwrap();
        let sources = ["//missing".to_owned()];
        assert!(matches!(
            tx.concatenate(&sources, "//dst", ConcatenateOptions::default()).await,
            Err(StorageError::NotFound(p)) if p == "//missing"
        ));
    }

    #[tokio::test]
    async fn test_removed_then_committed() {
        let client = MemoryClient::default().with_buffer_size(7);
        let tx = client.start_transaction().await.unwrap();

        let writer = tx.create_writer("//tmp", WriterOptions::default()).await.unwrap();
        assert_eq!(writer.buffer_memory_usage(), 7);
        writer.finish().await.unwrap();
        tx.remove("//tmp").await.unwrap();
        tx.commit().await.unwrap();

        assert!(client.list().is_empty());
        assert!(matches!(tx.abort().await, Err(StorageError::TransactionClosed(_))));
    }

    #[tokio::test]
    async fn test_writer_options_override_buffer_size() {
        let client = MemoryClient::default().with_buffer_size(7);
        let tx = client.start_transaction().await.unwrap();

        let writer = tx.create_writer("//tmp", WriterOptions::default().with_buffer_size(3)).await.unwrap();
        assert_eq!(writer.buffer_memory_usage(), 3);
    }
}
