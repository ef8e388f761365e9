//! Rate limiting of `JOB_PROGRESS` webhook traffic.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use docjobs_core::{EventKind, JobId};
use tokio::time::Instant;

use crate::bus::JobEvent;

/// Decides which events reach webhook subscribers.
///
/// A progress event passes when it is the first for its job, when progress
/// moved by at least `step` points since the last one that passed, or when
/// `interval` has elapsed since then. Every other kind always passes, and
/// terminal kinds drop the job's state.
pub struct ProgressThrottle {
    interval: Duration,
    step: u8,
    last: Mutex<HashMap<JobId, (u8, Instant)>>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, step: u8) -> Self {
        Self {
            interval,
            step,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, event: &JobEvent) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if event.kind.is_terminal() {
            last.remove(&event.job_id);
            return true;
        }
        if event.kind != EventKind::JobProgress {
            return true;
        }

        let now = Instant::now();
        let pass = match last.get(&event.job_id) {
            None => true,
            Some(&(percent, at)) => {
                event.progress.saturating_sub(percent) >= self.step
                    || now.duration_since(at) >= self.interval
            }
        };
        if pass {
            last.insert(event.job_id.clone(), (event.progress, now));
        }
        pass
    }

    /// Jobs currently tracked.
    pub fn tracked(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
