//! Bounded worker pool.
//!
//! `size` long-lived tasks share one bounded `mpsc` queue of `capacity`
//! slots. Submitters take a slot with [`WorkerPool::reserve`] before they
//! persist anything, so a full queue is reported synchronously as
//! `CAPACITY_EXCEEDED` and never leaves an orphan PENDING job behind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use docjobs_core::CoreError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::task::JoinHandle;

use crate::runner::{JobRunner, QueuedJob};

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    running: AtomicUsize,
}

/// A reserved queue slot. Dropping it unused releases the slot.
pub struct Slot {
    permit: OwnedPermit<QueuedJob>,
    counters: Arc<Counters>,
}

impl Slot {
    pub fn send(self, job: QueuedJob) {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        self.permit.send(job);
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    size: usize,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `size` workers on the current runtime.
    pub fn start(size: usize, capacity: usize, runner: Arc<JobRunner>) -> Self {
        let size = size.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<QueuedJob>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..size)
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let runner = Arc::clone(&runner);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    tracing::debug!(worker, "Worker started");
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job) = next else { break };
                        counters.queued.fetch_sub(1, Ordering::SeqCst);
                        counters.running.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(worker, job_id = %job.request.job_id, "Worker picked up job");
                        runner.run(job).await;
                        counters.running.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::debug!(worker, "Worker stopped");
                })
            })
            .collect();

        tracing::info!(size, capacity, "Worker pool started");
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
            size,
            capacity,
        }
    }

    /// Take a queue slot without waiting.
    pub fn reserve(&self) -> Result<Slot, CoreError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| CoreError::Conflict("Worker pool is shutting down".into()))?;

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(Slot {
                permit,
                counters: Arc::clone(&self.counters),
            }),
            Err(TrySendError::Full(_)) => Err(CoreError::CapacityExceeded(format!(
                "Job queue is full ({} pending)",
                self.capacity
            ))),
            Err(TrySendError::Closed(_)) => {
                Err(CoreError::Conflict("Worker pool is shutting down".into()))
            }
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue, let workers drain it, and join them within `grace`.
    ///
    /// Workers still busy when the grace period ends are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.sender.lock().unwrap_or_else(|e| e.into_inner()).take());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Workers did not finish within the shutdown grace period");
        } else {
            tracing::info!("Worker pool drained");
        }
    }
}
