use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared, join_all};

/// Resolves once the corresponding [`ReadToken`] is dropped.
type ReadDone = Shared<oneshot::Receiver<()>>;

#[derive(Default)]
struct BarrierInner {
    /// The reads in flight, per path. Paths without reads have no entry.
    reads: DashMap<PathBuf, HashMap<u64, ReadDone>>,
    next_id: AtomicU64,
}

/// Coordinates writers of a file with the readers that are currently consuming it.
///
/// Readers register with [`begin_read`](Self::begin_read) for the duration of their read. A
/// writer calls [`await_readers_then_run`](Self::await_readers_then_run), which waits for all
/// reads of that path registered at that point in time before committing.
///
/// The barrier is advisory. It does not order concurrent writers of the same path, and reads
/// starting after a writer took its snapshot are not waited for.
#[derive(Clone, Default)]
pub struct WriteBarrier {
    inner: Arc<BarrierInner>,
}

impl WriteBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a read of `path`, which lasts until the returned token is dropped.
    pub fn begin_read(&self, path: &Path) -> ReadToken {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        self.inner
            .reads
            .entry(path.to_owned())
            .or_default()
            .insert(id, receiver.shared());

        ReadToken {
            inner: Arc::clone(&self.inner),
            path: path.to_owned(),
            id,
            _done: sender,
        }
    }

    /// The number of reads of `path` currently in flight.
    pub fn active_reads(&self, path: &Path) -> usize {
        self.inner.reads.get(path).map_or(0, |reads| reads.len())
    }

    /// Waits for all reads of `path` in flight right now, and then runs `commit`.
    ///
    /// The set of reads is captured when this function is called, not when the returned future
    /// is first polled.
    pub fn await_readers_then_run<F, R>(
        &self,
        path: &Path,
        commit: F,
    ) -> impl Future<Output = R> + use<F, R>
    where
        F: FnOnce() -> R,
    {
        let snapshot: Vec<ReadDone> = self
            .inner
            .reads
            .get(path)
            .map(|reads| reads.values().cloned().collect())
            .unwrap_or_default();

        async move {
            if !snapshot.is_empty() {
                metric!(gauge("barrier.waiting_reads") = snapshot.len() as u64);
                let start = Instant::now();
                // A finished read drops its sender, so every outcome means done.
                join_all(snapshot).await;
                metric!(timer("barrier.wait") = start.elapsed());
            }
            commit()
        }
    }
}

impl std::fmt::Debug for WriteBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBarrier")
            .field("paths", &self.inner.reads.len())
            .finish()
    }
}

/// One read of a path in flight, registered with [`WriteBarrier::begin_read`].
///
/// The read ends when the token is [finished](Self::finish) or dropped.
pub struct ReadToken {
    inner: Arc<BarrierInner>,
    path: PathBuf,
    id: u64,
    _done: oneshot::Sender<()>,
}

impl ReadToken {
    /// Ends this read.
    pub fn finish(self) {}

    /// The path being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReadToken {
    fn drop(&mut self) {
        self.inner.reads.remove_if_mut(&self.path, |_, reads| {
            reads.remove(&self.id);
            reads.is_empty()
        });
        // `_done` is dropped after this, waking up the waiting writers.
    }
}

impl std::fmt::Debug for ReadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadToken")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}
