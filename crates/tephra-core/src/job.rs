//! Job System
//!
//! Thread pool used as the request owner for build execution. Supports
//! priority scheduling, blocking waits, priority adjustment of pending
//! jobs, and cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Job priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum JobPriority {
    /// Low priority background tasks
    Low = 0,
    /// Normal priority tasks
    #[default]
    Normal = 1,
    /// High priority tasks
    High = 2,
    /// Tasks a caller is blocked on
    Critical = 3,
}

impl JobPriority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Cooperative cancellation flag, checked at tile, mip, and node
/// boundaries inside builds. Cancelling never tears down running work
/// mid-write; holders observe the flag and unwind cleanly.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct JobState {
    done: Mutex<bool>,
    completed: Condvar,
}

/// Handle to a submitted job
#[derive(Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
    priority: Arc<AtomicU8>,
    id: u64,
}

impl JobHandle {
    /// Check whether the job has finished executing
    pub fn is_complete(&self) -> bool {
        *self.state.done.lock()
    }

    /// Block the calling thread until the job finishes
    pub fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.completed.wait(&mut done);
        }
    }

    /// Raise or lower the priority of a job still waiting in the queue.
    /// Has no effect once a worker has picked the job up.
    pub fn set_priority(&self, priority: JobPriority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct QueuedJob {
    seq: u64,
    priority: Arc<AtomicU8>,
    func: Box<dyn FnOnce() + Send>,
    state: Arc<JobState>,
}

struct JobQueue {
    pending: Mutex<Vec<QueuedJob>>,
    available: Condvar,
    shutdown: AtomicBool,
    counter: AtomicU64,
}

impl JobQueue {
    /// Pop the best pending job: highest priority, oldest submission wins ties
    fn take_best(pending: &mut Vec<QueuedJob>) -> Option<QueuedJob> {
        let best = pending
            .iter()
            .enumerate()
            .max_by_key(|(_, job)| {
                (
                    JobPriority::from_u8(job.priority.load(Ordering::Acquire)),
                    std::cmp::Reverse(job.seq),
                )
            })
            .map(|(index, _)| index)?;
        Some(pending.swap_remove(best))
    }
}

/// Priority thread pool
pub struct JobSystem {
    queue: Arc<JobQueue>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl JobSystem {
    /// Create a job system with the given number of worker threads
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let queue = Arc::new(JobQueue {
            pending: Mutex::new(Vec::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counter: AtomicU64::new(0),
        });

        let workers = (0..num_workers)
            .map(|index| {
                let queue = queue.clone();
                std::thread::Builder::new()
                    .name(format!("tephra-job-{index}"))
                    .spawn(move || Self::worker_loop(&queue))
                    .expect("failed to spawn job worker")
            })
            .collect();

        Self { queue, workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn worker_loop(queue: &JobQueue) {
        loop {
            let job = {
                let mut pending = queue.pending.lock();
                loop {
                    if let Some(job) = JobQueue::take_best(&mut pending) {
                        break job;
                    }
                    if queue.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    queue.available.wait(&mut pending);
                }
            };

            (job.func)();

            let mut done = job.state.done.lock();
            *done = true;
            job.state.completed.notify_all();
        }
    }

    /// Submit a closure for execution
    pub fn submit<F>(&self, priority: JobPriority, func: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(JobState::default());
        let priority = Arc::new(AtomicU8::new(priority as u8));
        let id = self.queue.counter.fetch_add(1, Ordering::Relaxed);

        let job = QueuedJob {
            seq: id,
            priority: priority.clone(),
            func: Box::new(func),
            state: state.clone(),
        };

        self.queue.pending.lock().push(job);
        self.queue.available.notify_one();

        JobHandle {
            state,
            priority,
            id,
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.queue.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
