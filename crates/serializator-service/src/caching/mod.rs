//! # Serializator caching infrastructure
//!
//! This module contains the keyed object cache, our central [`CacheError`] type, and the building
//! blocks the cache is made of.
//!
//! ## Cache Layers
//!
//! The [`Serializator`] has two layers:
//!
//! - An in-memory layer ([`SingleFlight`]) which holds the latest loaded object per key, and does
//!   request coalescing (deduplicating concurrent loads of the same key).
//! - A file-system layer which persists each object as a properties file named after its key,
//!   see [`AtomicFileStore`]. Files are always replaced atomically.
//!
//! A `get` request goes through the following steps:
//! - If a load of the key is in flight, it waits for that load.
//! - Otherwise, the object is served by the in-memory layer if it was loaded before.
//! - On miss, the file is read and decoded, and the object is put into the in-memory layer.
//!
//! An explicit `deserialize` always reads the file, and `get` requests arriving in the meantime
//! wait for it.
//!
//! ## Reads and Writes
//!
//! Reads of a file register with the [`WriteBarrier`]. A `serialize` writes the new content to a
//! temporary file first. Before it commits the temporary file, it waits for all reads of that file
//! which were in flight at that point. Reads starting later are not waited for, and neither are
//! other writes of the same key. The last write to commit wins.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All `get` accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.channel.hit`: Accesses that joined a load in flight.
//! - `caches.channel.miss`: Accesses that started a new load.
//! - `caches.file.read`: Files being read, tagged with a `status`.
//! - `caches.file.write`: Files being written, tagged with a `status`.
//! - `caches.file.size`: The size (in bytes) of the written files.
//! - `barrier.waiting_reads`: The number of reads a write has to wait for.
//! - `barrier.wait`: The time a write spent waiting for reads.
//! - `pool.tasks`: The number of tasks in flight on the worker pool.
//!
//! ### Configuration
//!
//! [`Config::cache_dir`](crate::config::Config::cache_dir) is the directory holding the files, with
//! temporary files in its `tmp` subdirectory. The in-memory layer is unbounded unless
//! [`Config::in_memory`](crate::config::Config::in_memory) sets a capacity.

mod barrier;
mod cache_error;
mod fs;
mod memory;
mod serializator;

pub use barrier::{ReadToken, WriteBarrier};
pub use cache_error::{CacheEntry, CacheError};
pub use fs::{AtomicFileStore, FsStore};
pub use memory::SingleFlight;
pub use serializator::Serializator;
