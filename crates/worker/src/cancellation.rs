//! Per-job cancellation tokens.

use std::collections::HashMap;
use std::sync::Mutex;

use docjobs_core::{CancelToken, JobId};

/// Maps running (or about-to-run) jobs to their [`CancelToken`].
///
/// Both [`token`](Self::token) and [`cancel`](Self::cancel) get-or-create,
/// so a cancel that lands before the worker asks for the token is still
/// observed once it does.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<JobId, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, job_id: &str) -> CancelToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.entry(job_id.to_string()).or_default().clone()
    }

    pub fn token(&self, job_id: &str) -> CancelToken {
        self.get_or_create(job_id)
    }

    /// Trigger cancellation, running the kill hooks executors registered on
    /// the job's token.
    pub fn cancel(&self, job_id: &str) {
        let token = self.get_or_create(job_id);
        tracing::debug!(job_id = %job_id, "Cancellation triggered");
        token.cancel();
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .is_some_and(CancelToken::is_cancelled)
    }

    /// Forget the job's token once it is terminal.
    pub fn release(&self, job_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
