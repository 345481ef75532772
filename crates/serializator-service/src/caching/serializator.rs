use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use super::barrier::WriteBarrier;
use super::fs::{AtomicFileStore, FsStore};
use super::memory::SingleFlight;
use super::{CacheEntry, CacheError};
use crate::config::Config;
use crate::marshal::{ObjectMarshaller, PropertiesMarshaller, Schema, properties};
use crate::pool::WorkerPool;

/// The parts of a [`Serializator`] used from within its pool tasks.
struct Inner<M, S> {
    cache_dir: PathBuf,
    file_extension: String,
    marshaller: M,
    store: S,
    barrier: WriteBarrier,
}

impl<M, S: AtomicFileStore> Inner<M, S> {
    /// Encodes `object` and atomically replaces the file at `path` once all reads in flight
    /// have finished.
    async fn write<T>(&self, object: &T, path: &Path) -> CacheEntry<bool>
    where
        M: ObjectMarshaller<T>,
    {
        let text = properties::to_string(&self.marshaller.encode(object));
        metric!(time_raw("caches.file.size") = text.len() as u64);

        let temp = self.store.write_temp(text.as_bytes());
        let result = match temp {
            Ok(temp) => {
                self.barrier
                    .await_readers_then_run(path, || self.store.commit(temp, path))
                    .await
            }
            Err(err) => Err(err),
        };

        let result = result.map_err(|err| {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || CacheError::from(err),
            )
        });

        let status = match result {
            Ok(_) => "ok",
            Err(ref err) => err.metrics_tag(),
        };
        metric!(counter("caches.file.write") += 1, "status" => status);

        result?;
        tracing::trace!("Serialized `{}`", path.display());
        Ok(true)
    }

    /// Reads and decodes the file at `path`, registered as a read with the barrier.
    ///
    /// The file is read on the blocking thread pool, so that a slow disk does not stall other
    /// tasks of the worker pool.
    async fn read<T>(self: Arc<Self>, path: PathBuf) -> CacheEntry<T>
    where
        M: ObjectMarshaller<T>,
    {
        let read_token = self.barrier.begin_read(&path);
        let inner = Arc::clone(&self);
        let bytes = tokio::task::spawn_blocking(move || {
            let bytes = inner.store.read(read_token.path());
            read_token.finish();
            bytes
        })
        .await
        .map_err(|_| CacheError::InternalError)?;

        let result = match bytes {
            Ok(bytes) => properties::parse(&bytes)
                .and_then(|properties| self.marshaller.decode(&properties)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(err.into()),
        };

        let status = match result {
            Ok(_) => "ok",
            Err(ref err) => err.metrics_tag(),
        };
        metric!(counter("caches.file.read") += 1, "status" => status);

        match result {
            Err(CacheError::NotFound | CacheError::Persistence(_)) | Ok(_) => {}
            Err(ref err) => {
                tracing::warn!(path = %path.display(), %err, "Failed to decode persisted object");
            }
        }
        result
    }

    fn path(&self, key: &str) -> CacheEntry<PathBuf> {
        validate_key(key)?;
        Ok(self
            .cache_dir
            .join(format!("{key}.{}", self.file_extension)))
    }
}

/// Rejects keys that do not map to a single file inside the cache directory.
fn validate_key(key: &str) -> CacheEntry {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('\0')
        || key.chars().any(std::path::is_separator);
    if invalid {
        return Err(CacheError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// A keyed cache of objects, persisted as one properties file per key.
///
/// All operations run on the worker pool owned by the cache:
///
/// - [`serialize`](Self::serialize) writes an object to its file, waiting for reads of the
///   previous content that are in flight.
/// - [`deserialize`](Self::deserialize) reads the file and updates the in-memory value.
/// - [`get`](Self::get) returns the in-memory value, or loads it once for all concurrent callers.
///
/// Concurrent writes of the same key are not ordered. The last commit wins, and readers see the
/// content of exactly one of the writes.
pub struct Serializator<T, M = PropertiesMarshaller<T>, S = FsStore> {
    inner: Arc<Inner<M, S>>,
    memory: SingleFlight<String, T>,
    pool: WorkerPool,
}

impl<T: Schema + Clone> Serializator<T> {
    /// Creates a cache of `T` objects in the configured directory.
    pub fn new(config: &Config) -> io::Result<Self> {
        let store = FsStore::new(config.tmp_dir())?;
        Self::with_parts(config, PropertiesMarshaller::new(), store)
    }
}

impl<T, M> Serializator<T, M, FsStore> {
    /// Removes temporary files left behind by writers that crashed.
    ///
    /// This should be called before any write is started.
    pub fn clear_tmp(&self) -> io::Result<()> {
        self.inner.store.clear_tmp()
    }
}

impl<T, M, S> Serializator<T, M, S>
where
    T: Clone + Send + Sync + 'static,
    M: ObjectMarshaller<T>,
    S: AtomicFileStore,
{
    /// Creates a cache with a custom marshaller and file store.
    pub fn with_parts(config: &Config, marshaller: M, store: S) -> io::Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let pool = WorkerPool::new(&config.workers)?;

        Ok(Serializator {
            inner: Arc::new(Inner {
                cache_dir: config.cache_dir.clone(),
                file_extension: config.file_extension.clone(),
                marshaller,
                store,
                barrier: WriteBarrier::new(),
            }),
            memory: SingleFlight::new(config.in_memory.capacity),
            pool,
        })
    }

    /// Persists `object` under `key`.
    ///
    /// Resolves to `true` once the file was replaced, or to `false` if the write was dropped
    /// before it could commit because the pool was torn down. The write runs even if the
    /// returned future is not awaited.
    pub fn serialize(&self, object: T, key: &str) -> BoxFuture<'static, CacheEntry<bool>> {
        let path = match self.inner.path(key) {
            Ok(path) => path,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let inner = Arc::clone(&self.inner);
        let handle = self
            .pool
            .spawn_handle(async move { inner.write(&object, &path).await });

        match handle {
            Ok(handle) => handle
                .map(|result| result.unwrap_or(Ok(false)))
                .boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Loads the object persisted under `key`, replacing the in-memory value.
    ///
    /// Concurrent [`get`](Self::get) calls for the same key wait for this load. The load runs
    /// even if the returned future is not awaited.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotFound`] if nothing was persisted under `key`.
    /// - [`CacheError::MissingTypeIdentity`] or [`CacheError::TypeMismatch`] if the file was not
    ///   written for `T`.
    pub fn deserialize(&self, key: &str) -> BoxFuture<'static, CacheEntry<T>> {
        match self.loader(key) {
            Ok(load) => self.memory.refresh(&self.pool, key.to_owned(), load),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Returns the object for `key`, blocking the current thread.
    ///
    /// Must not be called from within an async runtime, use [`get_async`](Self::get_async) there.
    pub fn get(&self, key: &str) -> CacheEntry<T> {
        futures::executor::block_on(self.get_async(key))
    }

    /// Returns the object for `key`.
    ///
    /// The in-memory value is returned if there is one and no load is in flight. Otherwise the
    /// object is loaded once for all concurrent callers.
    pub fn get_async(&self, key: &str) -> BoxFuture<'static, CacheEntry<T>> {
        match self.loader(key) {
            Ok(load) => self.memory.get_with(&self.pool, key.to_owned(), load),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    /// Returns the in-memory object for `key`, if any.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.memory.peek(&key.to_owned())
    }

    /// The file the object for `key` is persisted in.
    pub fn path(&self, key: &str) -> CacheEntry<PathBuf> {
        self.inner.path(key)
    }

    /// The pool running all reads and writes.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The barrier coordinating reads and writes of the persisted files.
    pub fn barrier(&self) -> &WriteBarrier {
        &self.inner.barrier
    }

    fn loader(
        &self,
        key: &str,
    ) -> CacheEntry<impl FnOnce(String) -> BoxFuture<'static, CacheEntry<T>> + use<T, M, S>> {
        let path = self.inner.path(key)?;
        let inner = Arc::clone(&self.inner);
        Ok(move |_key: String| inner.read::<T>(path).boxed())
    }
}

impl<T, M, S> fmt::Debug for Serializator<T, M, S>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializator")
            .field("cache_dir", &self.inner.cache_dir)
            .field("memory", &self.memory)
            .field("barrier", &self.inner.barrier)
            .field("pool", &self.pool)
            .finish()
    }
}
