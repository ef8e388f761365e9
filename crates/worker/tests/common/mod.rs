//! Fake tools and a ready-made orchestrator for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docjobs_core::{
    CancelToken, EventKind, JobRecord, JobResult, JobStatus, ProgressSink, ToolError,
    ToolExecutor, ToolName, ToolRegistry, ToolRequest, RESULT_URL_KEY,
};
use docjobs_db::MemoryJobStore;
use docjobs_events::{EventBus, JobEvent};
use docjobs_worker::{JobOrchestrator, LocalOutputStorage, OutputStorage, PoolOptions, RetryPolicy};
use tokio::sync::{broadcast, Notify, Semaphore};

// ---------------------------------------------------------------------------
// Fake tools
// ---------------------------------------------------------------------------

/// Reports 50% and completes with a `resultUrl`.
pub struct InstantTool;

#[async_trait]
impl ToolExecutor for InstantTool {
    async fn execute(
        &self,
        request: ToolRequest,
        progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        progress.report(50, "Halfway").await;
        let mut result = JobResult::new();
        result.insert(
            RESULT_URL_KEY.into(),
            format!("/files/{}.pdf", request.job_id).into(),
        );
        Ok(result)
    }
}

/// Counts invocations and completes without a result URL.
#[derive(Default)]
pub struct CountingTool {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ToolExecutor for CountingTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        _progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JobResult::new())
    }
}

/// Blocks until a permit is added to `gate`.
///
/// With `honor_cancel` it stops at the cancel token; without it, it keeps
/// waiting and completes normally.
pub struct GatedTool {
    pub gate: Arc<Semaphore>,
    pub honor_cancel: bool,
    pub progress_steps: Vec<u8>,
}

impl GatedTool {
    pub fn new(honor_cancel: bool) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            honor_cancel,
            progress_steps: Vec::new(),
        }
    }

    pub fn with_progress(mut self, steps: &[u8]) -> Self {
        self.progress_steps = steps.to_vec();
        self
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ToolExecutor for GatedTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        for step in &self.progress_steps {
            progress.report(*step, "Working").await;
        }
        if self.honor_cancel {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ToolError::Cancelled),
                permit = self.gate.acquire() => permit.unwrap().forget(),
            }
        } else {
            self.gate.acquire().await.unwrap().forget();
        }
        Ok(JobResult::new())
    }
}

pub struct PanicTool;

#[async_trait]
impl ToolExecutor for PanicTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        _progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        panic!("corrupt xref table");
    }
}

pub struct TimeoutTool;

#[async_trait]
impl ToolExecutor for TimeoutTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        _progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        Err(ToolError::Timeout { elapsed_ms: 1500 })
    }
}

pub struct FailingTool;

#[async_trait]
impl ToolExecutor for FailingTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        _progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        Err(ToolError::failed("ENCRYPTED_INPUT", "Input is password protected"))
    }
}

/// Fails its first `failures` calls with `error()`, then completes.
///
/// Call `n` (1-based) reports `progress[n - 1]` first, when present.
pub struct FlakyTool {
    pub failures: usize,
    pub error: fn() -> ToolError,
    pub progress: Vec<u8>,
    pub calls: AtomicUsize,
}

impl FlakyTool {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            error: || ToolError::failed("IO", "Temporary read failure"),
            progress: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_error(mut self, error: fn() -> ToolError) -> Self {
        self.error = error;
        self
    }

    pub fn with_progress(mut self, steps: &[u8]) -> Self {
        self.progress = steps.to_vec();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolExecutor for FlakyTool {
    async fn execute(
        &self,
        _request: ToolRequest,
        progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.progress.get(call) {
            progress.report(*step, "Working").await;
        }
        if call < self.failures {
            return Err((self.error)());
        }
        Ok(JobResult::new())
    }
}

/// Writes one output file into the job's storage directory.
pub struct FileTool {
    pub storage: Arc<dyn OutputStorage>,
}

#[async_trait]
impl ToolExecutor for FileTool {
    async fn execute(
        &self,
        request: ToolRequest,
        _progress: Arc<dyn ProgressSink>,
        _cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        let dir = self.storage.prepare(&request.job_id).await?;
        let file = dir.join("out.pdf");
        tokio::fs::write(&file, b"%PDF-1.7").await?;
        let mut result = JobResult::new();
        result.insert(RESULT_URL_KEY.into(), file.to_string_lossy().into_owned().into());
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Storage that can be held mid-removal
// ---------------------------------------------------------------------------

pub struct HeldStorage {
    pub inner: LocalOutputStorage,
    pub entered: Notify,
    pub resume: Notify,
    pub held: AtomicBool,
}

impl HeldStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalOutputStorage::new(root),
            entered: Notify::new(),
            resume: Notify::new(),
            held: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl OutputStorage for HeldStorage {
    fn output_dir(&self, job_id: &str) -> std::io::Result<PathBuf> {
        self.inner.output_dir(job_id)
    }

    async fn remove_outputs(&self, job: &JobRecord) -> std::io::Result<u64> {
        if self.held.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.resume.notified().await;
        }
        self.inner.remove_outputs(job).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Arc<JobOrchestrator>,
    pub store: Arc<MemoryJobStore>,
    pub events: broadcast::Receiver<JobEvent>,
    pub output: tempfile::TempDir,
}

pub struct HarnessBuilder {
    tools: Vec<(ToolName, Arc<dyn ToolExecutor>)>,
    fallback: Arc<dyn ToolExecutor>,
    storage: Option<Arc<dyn OutputStorage>>,
    output: tempfile::TempDir,
    options: PoolOptions,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            fallback: Arc::new(InstantTool),
            storage: None,
            output: tempfile::tempdir().unwrap(),
            options: PoolOptions {
                size: 2,
                queue_capacity: 16,
                retry: RetryPolicy::NONE,
            },
        }
    }

    pub fn output_root(&self) -> PathBuf {
        self.output.path().to_path_buf()
    }

    pub fn tool(mut self, tool: ToolName, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools.push((tool, executor));
        self
    }

    pub fn fallback(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.fallback = executor;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn OutputStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn pool(mut self, size: usize, queue_capacity: usize) -> Self {
        self.options.size = size;
        self.options.queue_capacity = queue_capacity;
        self
    }

    pub fn retry(mut self, max_retries: u32, delay: Duration) -> Self {
        self.options.retry = RetryPolicy { max_retries, delay };
        self
    }

    pub fn start(self) -> Harness {
        let mut registry = ToolRegistry::builder();
        for (tool, executor) in self.tools {
            registry = registry.register(tool, executor);
        }
        let registry = registry.register_remaining(self.fallback).build().unwrap();

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalOutputStorage::new(self.output.path())));
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(EventBus::default());
        let events = bus.subscribe();
        let orchestrator =
            JobOrchestrator::start(store.clone(), registry, bus, storage, self.options);

        Harness {
            orchestrator,
            store,
            events,
            output: self.output,
        }
    }
}

impl Harness {
    /// Poll until the job reaches `status`.
    pub async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> JobRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.orchestrator.get_status(job_id).await.unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {} waiting for {status}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn finish(&self, job_id: &str) -> JobRecord {
        let job = self
            .orchestrator
            .wait_for_completion(job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(job.is_terminal(), "job {job_id} still {}", job.status);
        job
    }

    /// Event kinds for `job_id`, read until `last` arrives.
    pub async fn events_until(&mut self, job_id: &str, last: EventKind) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("no {last} event for {job_id}, saw {kinds:?}"))
                .unwrap();
            if event.job_id != job_id {
                continue;
            }
            kinds.push(event.kind);
            if event.kind == last {
                return kinds;
            }
        }
    }

    /// Every event already buffered for `job_id`.
    pub fn drain_events(&mut self, job_id: &str) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if event.job_id == job_id {
                kinds.push(event.kind);
            }
        }
        kinds
    }
}
