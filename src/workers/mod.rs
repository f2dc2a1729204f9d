//! Fixed-size worker pool draining a bounded FIFO.
//!
//! The reactor is the producer; `N` worker threads are the consumers. The
//! queue is the only lock shared between them. A task runs with the lock
//! released so other workers keep draining.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error};

/// A unit of work a worker can run to completion.
pub trait Job: Send + 'static {
    fn run(self);
}

impl<F> Job for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self) {
        self()
    }
}

/// A task the pool refused. The task is handed back so the caller can clean
/// up whatever it owns.
#[derive(Error)]
pub enum PoolError<J> {
    #[error("worker queue is full")]
    Full(J),

    #[error("worker pool is shut down")]
    Closed(J),
}

impl<J> std::fmt::Debug for PoolError<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<J> PoolError<J> {
    pub fn into_inner(self) -> J {
        match self {
            Self::Full(job) | Self::Closed(job) => job,
        }
    }
}

struct Queue<J> {
    tasks: VecDeque<J>,
    closed: bool,
}

struct Shared<J> {
    queue: Mutex<Queue<J>>,
    ready: Condvar,
    capacity: usize,
}

impl<J> Shared<J> {
    fn lock(&self) -> MutexGuard<'_, Queue<J>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed set of threads running queued [`Job`]s in FIFO order.
///
/// Shutdown lets queued tasks finish, then joins every worker. The pool
/// cannot be restarted.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use rttpd::workers::WorkerPool;
///
/// let done = Arc::new(AtomicUsize::new(0));
/// let mut pool = WorkerPool::new(2, 16).unwrap();
/// for _ in 0..10 {
///     let done = Arc::clone(&done);
///     pool.add_task(move || {
///         done.fetch_add(1, Ordering::SeqCst);
///     })
///     .unwrap();
/// }
/// pool.shutdown();
/// assert_eq!(done.load(Ordering::SeqCst), 10);
/// ```
pub struct WorkerPool<J: Job = Box<dyn FnOnce() + Send>> {
    shared: Arc<Shared<J>>,
    workers: Vec<JoinHandle<()>>,
}

impl<J: Job> WorkerPool<J> {
    /// Spawns `threads` workers sharing a queue of at most `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `threads` or `capacity` is zero.
    pub fn new(threads: usize, capacity: usize) -> std::io::Result<Self> {
        assert!(threads > 0, "worker pool needs at least one thread");
        assert!(capacity > 0, "worker queue capacity must be positive");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };
        for id in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("rttpd-worker-{id}"))
                .spawn(move || worker_loop(&shared))?;
            pool.workers.push(handle);
        }
        debug!(threads, capacity, "worker pool started");
        Ok(pool)
    }

    /// Queues `job` and wakes one idle worker.
    pub fn add_task(&self, job: J) -> Result<(), PoolError<J>> {
        {
            let mut queue = self.shared.lock();
            if queue.closed {
                return Err(PoolError::Closed(job));
            }
            if queue.tasks.len() >= self.shared.capacity {
                return Err(PoolError::Full(job));
            }
            queue.tasks.push_back(job);
        }
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Worker threads still attached; zero after shutdown.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Closes the queue, wakes every worker and joins them. Already queued
    /// tasks still run.
    pub fn shutdown(&mut self) {
        self.shared.lock().closed = true;
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl<J: Job> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<J: Job>(shared: &Shared<J>) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.tasks.pop_front() {
                    break Some(job);
                }
                if queue.closed {
                    break None;
                }
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        match job {
            Some(job) => job.run(),
            None => return,
        }
    }
}
