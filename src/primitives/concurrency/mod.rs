#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{Scope, ScopedJoinHandle};

use tracing::warn;

use crate::types::{Result, StrataError};

/// Bounded set of worker slots.
///
/// A pool never queues: when every slot is busy the caller runs the task
/// inline. Recursive fan-out therefore cannot deadlock on an exhausted pool.
#[derive(Debug)]
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    active: AtomicUsize,
    spawned: AtomicU64,
    inlined: AtomicU64,
}

/// Held by a task occupying a pool slot; releases the slot on drop.
pub struct WorkerPermit<'a> {
    pool: &'a WorkerPool,
}

impl Drop for WorkerPermit<'_> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    /// Creates a pool with `capacity` slots. A capacity of 0 runs everything inline.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            active: AtomicUsize::new(0),
            spawned: AtomicU64::new(0),
            inlined: AtomicU64::new(0),
        }
    }

    /// Pool name used in log events.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Takes a free slot if one exists.
    pub fn try_acquire(&self) -> Option<WorkerPermit<'_>> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(WorkerPermit { pool: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Tasks that ran on a worker thread.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Tasks that ran on the caller's thread because the pool was full.
    pub fn inlined(&self) -> u64 {
        self.inlined.load(Ordering::Relaxed)
    }
}

enum Task<'scope, T> {
    Spawned(ScopedJoinHandle<'scope, Result<T>>),
    Done(Result<T>),
}

/// Structured fan-out/fan-in over a thread scope.
///
/// Tasks spawned through a group share one abort flag with every other group
/// of the same commit. After the first failure no new task body runs; tasks
/// already running finish normally. [`TaskGroup::join`] waits for every task
/// and reports the first real error, preferring it over [`StrataError::Aborted`].
pub struct TaskGroup<'scope, 'env: 'scope, T> {
    scope: &'scope Scope<'scope, 'env>,
    abort: &'env AtomicBool,
    tasks: Vec<Task<'scope, T>>,
}

impl<'scope, 'env: 'scope, T: Send + 'scope> TaskGroup<'scope, 'env, T> {
    /// Creates an empty group spawning into `scope`.
    pub fn new(scope: &'scope Scope<'scope, 'env>, abort: &'env AtomicBool) -> Self {
        Self {
            scope,
            abort,
            tasks: Vec::new(),
        }
    }

    /// Number of tasks started so far.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no task has been started.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs `f` on a worker from `pool`, or inline when the pool is full.
    pub fn spawn<F>(&mut self, pool: &'env WorkerPool, f: F)
    where
        F: FnOnce() -> Result<T> + Send + 'scope,
    {
        if self.abort.load(Ordering::Acquire) {
            self.tasks.push(Task::Done(Err(StrataError::Aborted)));
            return;
        }
        let abort = self.abort;
        match pool.try_acquire() {
            Some(permit) => {
                pool.spawned.fetch_add(1, Ordering::Relaxed);
                let handle = self.scope.spawn(move || {
                    let _permit = permit;
                    run_guarded(abort, f)
                });
                self.tasks.push(Task::Spawned(handle));
            }
            None => {
                pool.inlined.fetch_add(1, Ordering::Relaxed);
                self.tasks.push(Task::Done(run_guarded(abort, f)));
            }
        }
    }

    /// Waits for every task and returns results in spawn order.
    pub fn join(self) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(self.tasks.len());
        let mut first_err: Option<StrataError> = None;
        for task in self.tasks {
            let result = match task {
                Task::Spawned(handle) => handle.join().unwrap_or_else(|_| {
                    self.abort.store(true, Ordering::Release);
                    warn!("concurrency.task.panicked");
                    Err(StrataError::InvariantViolation("worker task panicked"))
                }),
                Task::Done(result) => result,
            };
            match result {
                Ok(value) => out.push(value),
                Err(err) => {
                    first_err = match first_err.take() {
                        None => Some(err),
                        Some(StrataError::Aborted) if !matches!(err, StrataError::Aborted) => {
                            Some(err)
                        }
                        kept => kept,
                    };
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

fn run_guarded<T>(abort: &AtomicBool, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if abort.load(Ordering::Acquire) {
        return Err(StrataError::Aborted);
    }
    let result = f();
    if result.is_err() {
        abort.store(true, Ordering::Release);
    }
    result
}
