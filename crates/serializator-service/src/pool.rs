//! A fixed-size pool of worker threads executing futures.
//!
//! The pool keeps track of the number of tasks in flight. Callers can block until the pool is idle,
//! and a monitor thread can close the pool after it has been idle for a configured time.

use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::caching::{CacheEntry, CacheError};
use crate::config::WorkersConfig;
use crate::utils::CallOnDrop;

/// Error returned from a [`SpawnHandle`] when the task was dropped before completing.
pub use oneshot::Canceled as RemoteCanceled;

/// Handle returned from [`WorkerPool::spawn_handle`].
///
/// This handle is a future representing the completion of a different future spawned on to the
/// pool. It resolves with `Ok` once the spawned future completes, or with [`RemoteCanceled`] if the
/// spawned future got dropped, for example because the pool was torn down.
pub use oneshot::Receiver as SpawnHandle;

#[derive(Debug, Default)]
struct Counters {
    /// Tasks spawned and not yet completed or dropped.
    in_flight: usize,
    /// Total number of accepted tasks.
    submitted: u64,
    /// The pool does not accept new tasks anymore.
    closed: bool,
    /// The pool is being dropped, the idle monitor should exit.
    dropped: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    counters: Mutex<Counters>,
    /// Notified whenever `in_flight` drops to zero, and on close and drop.
    changed: Condvar,
}

impl PoolState {
    fn task_done(&self) {
        let mut counters = self.counters.lock();
        counters.in_flight -= 1;
        metric!(gauge("pool.tasks") = counters.in_flight as u64);
        if counters.in_flight == 0 {
            self.changed.notify_all();
        }
    }

    /// Runs the idle monitor until the pool is closed or dropped.
    fn monitor_idle(&self, idle_timeout: Duration) {
        let mut counters = self.counters.lock();
        loop {
            if counters.closed || counters.dropped {
                return;
            }
            if counters.submitted == 0 || counters.in_flight > 0 {
                self.changed.wait(&mut counters);
                continue;
            }

            let seen = counters.submitted;
            let deadline = Instant::now() + idle_timeout;
            while counters.submitted == seen && !counters.closed && !counters.dropped {
                if self.changed.wait_until(&mut counters, deadline).timed_out() {
                    break;
                }
            }

            if counters.submitted == seen && !counters.closed && !counters.dropped {
                tracing::info!(?idle_timeout, "Worker pool is idle, shutting down");
                counters.closed = true;
                self.changed.notify_all();
                return;
            }
        }
    }
}

/// Multi-threaded pool for executing futures.
///
/// Every task submitted through [`spawn_handle`](Self::spawn_handle) counts as in flight until it
/// completes. Closing the pool, either explicitly through [`shutdown`](Self::shutdown) or through
/// the idle monitor, never cancels tasks. Only dropping the pool does.
pub struct WorkerPool {
    state: Arc<PoolState>,
    runtime: Option<Runtime>,
    monitor: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a new pool with the configured number of threads.
    ///
    /// When an `idle_timeout` is configured, a monitor thread is started that closes the pool once
    /// it has been idle for that long after its first task.
    pub fn new(config: &WorkersConfig) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("serializator-worker")
            .worker_threads(config.threads.max(1))
            .enable_time()
            .build()?;

        let state = Arc::new(PoolState::default());

        let monitor = match config.idle_timeout {
            Some(idle_timeout) => {
                let state = Arc::clone(&state);
                let handle = std::thread::Builder::new()
                    .name("serializator-idle-monitor".into())
                    .spawn(move || state.monitor_idle(idle_timeout))?;
                Some(handle)
            }
            None => None,
        };

        Ok(WorkerPool {
            state,
            runtime: Some(runtime),
            monitor,
        })
    }

    /// Spawn a future on to the pool, return a future representing the produced value.
    ///
    /// The [`SpawnHandle`] returned is a future that is a proxy for future itself. The task runs
    /// to completion even if the handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Shutdown`] if the pool was closed.
    pub fn spawn_handle<F>(&self, future: F) -> CacheEntry<SpawnHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let runtime = self.runtime.as_ref().ok_or(CacheError::Shutdown)?;
        {
            let mut counters = self.state.counters.lock();
            if counters.closed {
                return Err(CacheError::Shutdown);
            }
            counters.in_flight += 1;
            counters.submitted += 1;
            metric!(gauge("pool.tasks") = counters.in_flight as u64);
        }

        let (sender, receiver) = oneshot::channel();

        let state = Arc::clone(&self.state);
        let in_flight_token = CallOnDrop::new(move || state.task_done());
        let spawned = async move {
            let _in_flight_token = in_flight_token;
            sender.send(future.await).ok();
        };
        runtime.spawn(spawned);

        Ok(receiver)
    }

    /// The number of tasks currently in flight.
    pub fn in_flight(&self) -> usize {
        self.state.counters.lock().in_flight
    }

    /// Whether the pool stopped accepting new tasks.
    pub fn is_closed(&self) -> bool {
        self.state.counters.lock().closed
    }

    /// Blocks the current thread until no task is in flight.
    ///
    /// Must not be called from within a task of this pool.
    pub fn wait_idle(&self) {
        let mut counters = self.state.counters.lock();
        while counters.in_flight > 0 {
            self.state.changed.wait(&mut counters);
        }
    }

    /// Waits until the pool is idle and then closes it.
    ///
    /// New tasks are rejected with [`CacheError::Shutdown`] afterwards.
    pub fn shutdown(&self) {
        let mut counters = self.state.counters.lock();
        while counters.in_flight > 0 {
            self.state.changed.wait(&mut counters);
        }
        counters.closed = true;
        self.state.changed.notify_all();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counters = self.state.counters.lock();
        f.debug_struct("WorkerPool")
            .field("in_flight", &counters.in_flight)
            .field("submitted", &counters.submitted)
            .field("closed", &counters.closed)
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut counters = self.state.counters.lock();
            counters.closed = true;
            counters.dropped = true;
            self.state.changed.notify_all();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.join().ok();
        }
        // Outstanding tasks are dropped, which cancels their handles. This does not block, so
        // the pool may also be dropped from within an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn pool(threads: usize, idle_timeout: Option<Duration>) -> WorkerPool {
        WorkerPool::new(&WorkersConfig {
            threads,
            idle_timeout,
        })
        .unwrap()
    }

    #[test]
    fn test_spawn_handle() {
        let pool = pool(2, None);

        let handle = pool.spawn_handle(async { 21 * 2 }).unwrap();
        assert_eq!(futures::executor::block_on(handle), Ok(42));
    }

    #[test]
    fn test_wait_idle() {
        let pool = pool(4, None);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let done = Arc::clone(&done);
            // The handle is dropped, the task still runs to completion.
            pool.spawn_handle(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 16);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_shutdown_waits_for_tasks() {
        let pool = pool(1, None);
        let handle = pool
            .spawn_handle(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "done"
            })
            .unwrap();

        pool.shutdown();
        assert!(pool.is_closed());
        assert_eq!(futures::executor::block_on(handle), Ok("done"));
        assert_eq!(
            pool.spawn_handle(async {}).unwrap_err(),
            CacheError::Shutdown
        );
    }

    #[test]
    fn test_drop_cancels_handles() {
        let pool = pool(1, None);
        let handle = pool.spawn_handle(futures::future::pending::<()>()).unwrap();

        drop(pool);
        assert_eq!(futures::executor::block_on(handle), Err(RemoteCanceled));
    }

    #[test]
    fn test_idle_monitor() {
        let pool = pool(1, Some(Duration::from_millis(100)));

        // The monitor only starts counting after the first task.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!pool.is_closed());

        let handle = pool.spawn_handle(async { 1 }).unwrap();
        assert_eq!(futures::executor::block_on(handle), Ok(1));
        pool.wait_idle();

        // Still accepting tasks within the timeout, which also restarts it.
        std::thread::sleep(Duration::from_millis(20));
        let handle = pool.spawn_handle(async { 2 }).unwrap();
        assert_eq!(futures::executor::block_on(handle), Ok(2));

        let start = Instant::now();
        while !pool.is_closed() {
            assert!(start.elapsed() < Duration::from_secs(5), "pool did not close");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            pool.spawn_handle(async {}).unwrap_err(),
            CacheError::Shutdown
        );
    }
}
