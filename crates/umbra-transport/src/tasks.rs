//! Bounded worker pool for CPU-bound handshake work.
//!
//! The session engine delegates claim verification during handshakes; those
//! jobs land here so the reactor thread never runs crypto. The queue is
//! deliberately small: handshakes are rare and short, and when the queue is
//! full the job runs on the submitting thread instead of being dropped, so a
//! slow handshake can never silently lose work.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// A pool job: opaque CPU-bound work, safe to run on any thread.
type Job = Box<dyn FnOnce() + Send>;

enum PoolMessage {
    Run(Job),
    Shutdown,
}

/// Task pool configuration.
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Queue depth before submissions overflow to the calling thread.
    pub queue_depth: usize,
    /// Worker thread count (0 = auto: `min(num_cpus, 2)`).
    pub workers: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            queue_depth: 24,
            workers: 0,
        }
    }
}

/// Small fixed pool of worker threads behind a bounded channel.
pub struct TaskPool {
    tx: Sender<PoolMessage>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    overflows: AtomicU64,
}

impl TaskPool {
    /// Spawn the worker threads.
    #[must_use]
    pub fn new(config: TaskPoolConfig) -> Self {
        let workers = if config.workers == 0 {
            num_cpus::get().min(2)
        } else {
            config.workers
        };
        debug!(workers, queue_depth = config.queue_depth, "task pool starting");

        let (tx, rx) = bounded(config.queue_depth);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = (0..workers)
            .map(|id| spawn_worker(id, rx.clone(), Arc::clone(&shutdown)))
            .collect();

        Self {
            tx,
            workers: handles,
            shutdown,
            overflows: AtomicU64::new(0),
        }
    }

    /// Submit a job.
    ///
    /// When the queue is full (or the pool is shutting down) the job runs on
    /// the calling thread; work is never dropped.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        if self.shutdown.load(Ordering::Acquire) {
            job();
            return;
        }
        match self.tx.try_send(PoolMessage::Run(Box::new(job))) {
            Ok(()) => {}
            Err(TrySendError::Full(msg) | TrySendError::Disconnected(msg)) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                warn!("task queue full, running job on the submitting thread");
                if let PoolMessage::Run(job) = msg {
                    job();
                }
            }
        }
    }

    /// Number of submissions that ran on the submitting thread.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Worker thread count.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Signal all workers and wait for them to finish queued work.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            let _ = self.tx.send(PoolMessage::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("task pool worker panicked");
            }
        }
        debug!("task pool shut down");
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.workers.len())
            .field("overflows", &self.overflow_count())
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    id: usize,
    rx: Receiver<PoolMessage>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("umbra-task-{id}"))
        .spawn(move || {
            debug!(id, "task worker starting");
            loop {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(PoolMessage::Run(job)) => job(),
                    Ok(PoolMessage::Shutdown) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(id, "task worker exiting");
        })
        .expect("failed to spawn task worker")
}
