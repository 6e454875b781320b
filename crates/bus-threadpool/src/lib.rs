//! Executes user completion callbacks off the I/O threads.
//!
//! Mirrors the original `threadpool_init`/`threadpool_schedule`/
//! `threadpool_free` contract (`bus.h`/`bus.c`). Workers are plain
//! `std::thread`s that own their loop for the lifetime of the pool, the
//! same shape as the rest of this workspace's background threads.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use bus_types::ThreadpoolError;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

/// A unit of work dispatched to a worker thread.
///
/// `Run`'s closure must release `udata` itself (by capturing and dropping
/// it); `Cancel`'s closure is invoked instead of `Run` when the pool drains
/// a task without ever starting it. Exactly one of the two runs per
/// scheduled `Task` -- never both, never neither.
pub enum Task {
    Run(Box<dyn FnOnce() + Send>),
    Cancel(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Runs this task's closure on the calling thread. Used by worker
    /// threads to execute queued work, and by callers of [`ThreadPool::schedule`]
    /// to run a rejected task inline rather than dropping it.
    pub fn invoke(self) {
        match self {
            Task::Run(f) | Task::Cancel(f) => f(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadpoolConfig {
    pub max_threads: usize,
    pub max_queue_depth: usize,
}

impl Default for ThreadpoolConfig {
    fn default() -> Self {
        Self { max_threads: 4, max_queue_depth: 4096 }
    }
}

/// Backpressure scaling factor: milliseconds of recommended submitter sleep
/// per queued task, capped at one second.
const BACKPRESSURE_MS_PER_TASK: u64 = 2;
const BACKPRESSURE_CAP_MS: u64 = 1000;

const ENQUEUE_RETRY_ATTEMPTS: u32 = 5;

pub struct ThreadPool {
    tx: Sender<Task>,
    depth: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn init(cfg: ThreadpoolConfig) -> Result<Self, ThreadpoolError> {
        if cfg.max_threads == 0 {
            return Err(ThreadpoolError::ZeroThreads);
        }

        let (tx, rx) = bounded::<Task>(cfg.max_queue_depth.max(1));
        let depth = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(cfg.max_threads);
        for id in 0..cfg.max_threads {
            let rx: Receiver<Task> = rx.clone();
            let depth = Arc::clone(&depth);
            let handle = std::thread::Builder::new()
                .name(format!("bus-worker-{id}"))
                .spawn(move || worker_loop(id, rx, &depth))
                .map_err(ThreadpoolError::SpawnFail)?;
            workers.push(handle);
        }

        Ok(Self { tx, depth, workers })
    }

    /// Enqueues `task`, writing a recommended submitter backpressure delay
    /// (in milliseconds) to `backpressure` on success. Retries a bounded
    /// number of times with linear spacing if the queue is momentarily full,
    /// then gives up and hands `task` back to the caller unexecuted so it
    /// can be run inline (e.g. `Task::invoke`) instead of silently dropped --
    /// a `Task::Run` closure captures the only copy of the work it guards,
    /// and dropping it without invoking it would skip whatever release it
    /// performs.
    pub fn schedule(&self, mut task: Task, backpressure: &mut u64) -> Result<(), Task> {
        for attempt in 0..ENQUEUE_RETRY_ATTEMPTS {
            match self.tx.try_send(task) {
                Ok(()) => {
                    let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
                    *backpressure = (depth as u64 * BACKPRESSURE_MS_PER_TASK).min(BACKPRESSURE_CAP_MS);
                    return Ok(());
                }
                Err(crossbeam_channel::TrySendError::Full(back)) => {
                    task = back;
                    if attempt + 1 < ENQUEUE_RETRY_ATTEMPTS {
                        std::thread::sleep(Duration::from_micros(100 * u64::from(attempt + 1)));
                    }
                }
                Err(crossbeam_channel::TrySendError::Disconnected(back)) => {
                    warn!("threadpool: schedule called after shutdown");
                    return Err(back);
                }
            }
        }
        debug!("threadpool: queue full after retries, rejecting task");
        Err(task)
    }

    /// Stops accepting new work and joins every worker after it has drained
    /// whatever was already queued. Already-queued `Task::Run` jobs still
    /// execute to completion -- the bus relies on this to guarantee every
    /// accepted `send_request` produces exactly one result callback even
    /// during shutdown.
    pub fn free(self) {
        // Dropping the last `Sender` lets `Receiver::recv` observe
        // disconnection once the queue empties; workers loop until then.
        let Self { tx, workers, .. } = self;
        drop(tx);
        for handle in workers {
            if let Err(e) = handle.join() {
                warn!(?e, "threadpool: worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(id: usize, rx: Receiver<Task>, depth: &AtomicUsize) {
    loop {
        match rx.recv() {
            Ok(task) => {
                depth.fetch_sub(1, Ordering::AcqRel);
                task.invoke();
            }
            Err(_disconnected) => {
                debug!(worker = id, "threadpool: worker exiting, queue drained");
                break;
            }
        }
    }
}
