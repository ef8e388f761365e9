//! Cooperative cancellation handle passed to tool executors.
//!
//! A [`CancelToken`] is advisory: executors poll [`CancelToken::is_cancelled`]
//! (or call [`CancelToken::check`]) at safe checkpoints and clean up their own
//! resources. Work that cannot poll, such as a blocking subprocess, registers
//! a kill hook via [`CancelToken::on_cancel`].

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::tool::ToolError;

type KillHook = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    token: CancellationToken,
    hooks: Mutex<Vec<KillHook>>,
}

/// Cloneable cancellation handle for a single job.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Checkpoint helper: `Err(ToolError::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), ToolError> {
        if self.is_cancelled() {
            Err(ToolError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Register a hook to run when the token is cancelled.
    ///
    /// If the token is already cancelled the hook runs immediately on the
    /// calling thread. Every hook runs at most once.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Request cancellation and fire all registered hooks.
    pub fn cancel(&self) {
        self.inner.token.cancel();
        let hooks = {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *hooks)
        };
        for hook in hooks {
            hook();
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
