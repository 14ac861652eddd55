//! A crate uploading large data to a transactional object storage in parallel.
//!
//! A [`ParallelWriter`] takes any mix of in-memory blobs and local files, splits them into bounded chunks, writes the chunks
//! concurrently to temporary objects and eventually assembles them into a single destination object, in the order the data was
//! handed over. The whole upload happens within one transaction: either the destination is published with the complete data, or
//! the transaction is aborted and nothing is left behind.
//!
//! It is built upon:
//! - a [`task::Pool`] of background workers executing chunk jobs,
//! - a [`ResourceLimiter`] bounding the memory held by chunks in flight, possibly shared between writers,
//! - the [`storage`] traits abstracting the transactional backend, with an in-memory implementation.
//!
//! Here is the life of the data written by a single writer:
//!
//! ```text
//!     write(blob) / write_file(path)          call #n
//!       L split into chunks                   (n, 0), (n, 1), ...
//!       L reserve chunk size (soft)           the caller waits for room, no worker is held
//!       L schedule chunk job                  {destination}__parallel_writer__{n}_{i}
//!           L create chunk writer
//!           L reserve writer buffers (hard)   only when accounting for writer buffers
//!           L write chunk, finish writer
//!     finish()
//!       L wait for all chunk jobs
//!       L create destination
//!       L concatenate chunks sorted by (n, i)
//!       L remove chunks
//!       L commit
//! ```
//!
//! The first chunk failure latches an error, aborts the transaction and makes every pending chunk job return early. That error is
//! then returned by the following calls to the writer.

mod limiter;
pub use limiter::*;

mod writer;
pub use writer::*;

pub mod storage;
pub mod task;
