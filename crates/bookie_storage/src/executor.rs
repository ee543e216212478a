//! Single-threaded job executor and completion handles.

use crate::error::{StorageError, StorageResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs one at a time, in submission order, on a dedicated
/// thread.
///
/// Every disk write of a [`crate::DirectWriter`] goes through one of these,
/// which gives writes to a log file a total order. Tests can submit a job
/// that blocks to hold back everything queued after it.
pub struct SerialExecutor {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

struct Queue {
    jobs: VecDeque<Job>,
    shut_down: bool,
}

impl SerialExecutor {
    /// Starts an executor whose thread is named `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: impl Into<String>) -> StorageResult<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                shut_down: false,
            }),
            available: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_worker(&thread_name, &shared))?
        };

        Ok(Self {
            name,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Name of the executor thread.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job with no result.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExecutorShutDown`] after [`Self::shutdown`].
    pub fn execute<F>(&self, job: F) -> StorageResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.shut_down {
            return Err(StorageError::ExecutorShutDown(self.name.clone()));
        }
        queue.jobs.push_back(Box::new(job));
        self.shared.available.notify_one();
        Ok(())
    }

    /// Queues a job and returns a handle that completes with its result.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExecutorShutDown`] after [`Self::shutdown`].
    pub fn submit<T, F>(&self, job: F) -> StorageResult<Completion<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (completer, completion) = Completion::pair();
        self.execute(move || completer.complete(job()))?;
        Ok(completion)
    }

    /// Number of jobs waiting to run.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Returns true once [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().shut_down
    }

    /// Stops accepting jobs, runs the ones already queued and joins the
    /// thread.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shut_down = true;
            self.shared.available.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(executor = %self.name, "executor thread panicked");
            }
        }
    }
}

fn run_worker(name: &str, shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shut_down {
                    debug!(executor = %name, "executor stopped");
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(executor = %name, "job panicked");
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

enum Slot<T> {
    Pending,
    Ready(T),
    Abandoned,
}

struct CompletionInner<T> {
    slot: Mutex<Slot<T>>,
    done: Condvar,
}

/// A handle to a result that is produced later, possibly on another thread.
///
/// Handles are cheap to clone; every clone observes the same result. A
/// handle can be polled with [`Completion::is_done`] without blocking.
pub struct Completion<T> {
    inner: Arc<CompletionInner<T>>,
}

/// The producing side of a [`Completion`].
///
/// Dropping a completer without calling [`Completer::complete`] marks the
/// completion as abandoned, so waiters do not hang.
pub struct Completer<T> {
    inner: Option<Arc<CompletionInner<T>>>,
}

impl<T> Completion<T> {
    /// Creates a linked completer and completion.
    #[must_use]
    pub fn pair() -> (Completer<T>, Self) {
        let inner = Arc::new(CompletionInner {
            slot: Mutex::new(Slot::Pending),
            done: Condvar::new(),
        });
        (
            Completer {
                inner: Some(Arc::clone(&inner)),
            },
            Self { inner },
        )
    }

    /// Creates a completion that is already done.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                slot: Mutex::new(Slot::Ready(value)),
                done: Condvar::new(),
            }),
        }
    }

    /// Returns true once a value was produced or the producer went away.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Pending)
    }
}

impl<T: Clone> Completion<T> {
    /// Returns the result if it is available, without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExecutorShutDown`] if the producer was dropped
    /// without completing.
    pub fn try_get(&self) -> StorageResult<Option<T>> {
        match &*self.inner.slot.lock() {
            Slot::Pending => Ok(None),
            Slot::Ready(value) => Ok(Some(value.clone())),
            Slot::Abandoned => Err(abandoned()),
        }
    }

    /// Blocks until the result is available.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExecutorShutDown`] if the producer was dropped
    /// without completing.
    pub fn wait(&self) -> StorageResult<T> {
        let mut slot = self.inner.slot.lock();
        loop {
            match &*slot {
                Slot::Pending => self.inner.done.wait(&mut slot),
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Abandoned => return Err(abandoned()),
            }
        }
    }

    /// Blocks for at most `timeout`; returns `Ok(None)` if still pending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ExecutorShutDown`] if the producer was dropped
    /// without completing.
    pub fn wait_timeout(&self, timeout: Duration) -> StorageResult<Option<T>> {
        let mut slot = self.inner.slot.lock();
        if matches!(*slot, Slot::Pending) {
            let _ = self.inner.done.wait_for(&mut slot, timeout);
        }
        match &*slot {
            Slot::Pending => Ok(None),
            Slot::Ready(value) => Ok(Some(value.clone())),
            Slot::Abandoned => Err(abandoned()),
        }
    }
}

fn abandoned() -> StorageError {
    StorageError::ExecutorShutDown("completion abandoned".into())
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Completer<T> {
    /// Publishes the result and wakes every waiter.
    pub fn complete(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            *inner.slot.lock() = Slot::Ready(value);
            inner.done.notify_all();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            *inner.slot.lock() = Slot::Abandoned;
            inner.done.notify_all();
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_order() {
        let executor = SerialExecutor::new("test-writer").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut last = None;
        for i in 0..10 {
            let seen = Arc::clone(&seen);
            last = Some(executor.submit(move || seen.lock().push(i)).unwrap());
        }
        last.unwrap().wait().unwrap();

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn blocker_holds_back_later_jobs() {
        let executor = SerialExecutor::new("test-writer").unwrap();
        let (release, gate) = Completion::<()>::pair();
        executor.execute(move || gate.wait().unwrap()).unwrap();

        let result = executor.submit(|| 42).unwrap();
        assert_eq!(result.wait_timeout(Duration::from_millis(50)).unwrap(), None);
        assert!(!result.is_done());

        release.complete(());
        assert_eq!(result.wait().unwrap(), 42);
    }

    #[test]
    fn shutdown_drains_queue_then_rejects() {
        let executor = SerialExecutor::new("test-writer").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            executor
                .execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(executor.is_shut_down());
        assert!(matches!(
            executor.execute(|| {}),
            Err(StorageError::ExecutorShutDown(_))
        ));
    }

    #[test]
    fn panicking_job_does_not_stop_executor() {
        let executor = SerialExecutor::new("test-writer").unwrap();
        let failed = executor.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert!(failed.wait().is_err());

        let ok = executor.submit(|| 7u32).unwrap();
        assert_eq!(ok.wait().unwrap(), 7);
    }

    #[test]
    fn ready_completion_is_done() {
        let done = Completion::ready("value");
        assert!(done.is_done());
        assert_eq!(done.try_get().unwrap(), Some("value"));
        assert_eq!(done.clone().wait().unwrap(), "value");
    }

    #[test]
    fn dropped_completer_abandons() {
        let (completer, completion) = Completion::<u8>::pair();
        assert_eq!(completion.try_get().unwrap(), None);
        drop(completer);
        assert!(completion.is_done());
        assert!(completion.wait().is_err());
    }
}
