use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use crate::storage::{ObjectWriter, StorageError};

const READ_BUFFER_SIZE: usize = 64 * 1_024;

/// Position of a chunk in the final object: the call that produced it, then its index within that call.
pub type OrderKey = (usize, usize);

/// A scheduled chunk: where it is staged and where it goes in the final object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub path: String,
    pub order: OrderKey,
}

/// The data of a single chunk.
#[derive(Debug)]
pub enum WriteTask {
    /// A slice of an in-memory blob.
    Blob(Bytes),
    /// A byte range of a local file, streamed at write time.
    FileRange { file: PathBuf, start: u64, length: u64 },
}

impl WriteTask {
    /// Amount of data this chunk accounts for in the memory budget.
    pub fn data_size(&self) -> usize {
        match self {
            Self::Blob(blob) => blob.len(),
            Self::FileRange { length, .. } => *length as usize,
        }
    }

    /// Write the chunk content to `writer`.
    ///
    /// A file range stops between two buffered reads once `failed` is raised, leaving the object incomplete.
    pub async fn write(&self, writer: &mut dyn ObjectWriter, failed: &AtomicBool) -> Result<(), StorageError> {
        match self {
            Self::Blob(blob) => writer.write(blob).await,
            Self::FileRange { file, start, length } => {
                let mut file = tokio::fs::File::open(file).await?;
                file.seek(SeekFrom::Start(*start)).await?;

                let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
                let mut remaining = *length;

                while remaining > 0 && !failed.load(Ordering::Acquire) {
                    let buffer = reader.fill_buf().await?;
                    if buffer.is_empty() {
                        return Err(StorageError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("file ended {remaining} bytes before the end of its range"),
                        )));
                    }

                    let size = buffer.len().min(remaining.try_into().unwrap_or(usize::MAX));
                    writer.write(&buffer[..size]).await?;

                    reader.consume(size);
                    remaining -= size as u64;
                }

                Ok(())
            }
        }
    }
}
