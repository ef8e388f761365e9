use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use docjobs_core::CoreError;
use docjobs_events::DispatcherConfig;

use crate::runner::RetryPolicy;

/// Upper bound for `JOB_RETENTION_DAYS` (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Worker service configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent job executions (default: available CPUs).
    pub pool_size: usize,
    /// Jobs that may wait for a worker before submissions are rejected.
    pub queue_capacity: usize,
    pub retention_days: u32,
    pub cleanup_interval: Duration,
    pub output_dir: PathBuf,
    /// Executable invoked by command-backed tools.
    pub tool_runner: String,
    pub tool_timeout: Duration,
    /// Extra attempts for a tool run that fails with a generic error.
    pub tool_max_retries: u32,
    pub tool_retry_delay: Duration,
    pub shutdown_timeout: Duration,
    /// Postgres connection string; the in-memory store is used when unset.
    pub database_url: Option<String>,
    pub webhook_max_concurrency: usize,
    pub webhook_progress_interval: Duration,
    pub webhook_progress_step: u8,
    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                        | Default          |
    /// |--------------------------------|------------------|
    /// | `WORKER_POOL_SIZE`             | CPU count        |
    /// | `WORKER_QUEUE_CAPACITY`        | `100`            |
    /// | `JOB_RETENTION_DAYS`           | `30`             |
    /// | `CLEANUP_INTERVAL_SECS`        | `3600`           |
    /// | `OUTPUT_DIR`                   | `./data/output`  |
    /// | `TOOL_RUNNER`                  | `docjobs-tool`   |
    /// | `TOOL_TIMEOUT_SECS`            | `300`            |
    /// | `TOOL_MAX_RETRIES`             | `2`              |
    /// | `TOOL_RETRY_DELAY_MS`          | `5000`           |
    /// | `SHUTDOWN_TIMEOUT_SECS`        | `30`             |
    /// | `DATABASE_URL`                 | unset            |
    /// | `WEBHOOK_MAX_CONCURRENCY`      | `16`             |
    /// | `WEBHOOK_PROGRESS_INTERVAL_MS` | `2000`           |
    /// | `WEBHOOK_PROGRESS_STEP`        | `10`             |
    /// | `LOG_FORMAT`                   | text (`json`)    |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let default_pool = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let pool_size: usize = parse_or(&var, "WORKER_POOL_SIZE", default_pool)?;
        let queue_capacity: usize = parse_or(&var, "WORKER_QUEUE_CAPACITY", 100)?;
        let webhook_max_concurrency: usize = parse_or(&var, "WEBHOOK_MAX_CONCURRENCY", 16)?;
        for (key, value) in [
            ("WORKER_POOL_SIZE", pool_size),
            ("WORKER_QUEUE_CAPACITY", queue_capacity),
            ("WEBHOOK_MAX_CONCURRENCY", webhook_max_concurrency),
        ] {
            if value == 0 {
                return Err(CoreError::Validation(format!("{key} must be at least 1")));
            }
        }

        let retention_days: u32 = parse_or(&var, "JOB_RETENTION_DAYS", 30)?;
        if retention_days > MAX_RETENTION_DAYS {
            return Err(CoreError::Validation(format!(
                "JOB_RETENTION_DAYS must be at most {MAX_RETENTION_DAYS}"
            )));
        }
        let cleanup_interval_secs: u64 = parse_or(&var, "CLEANUP_INTERVAL_SECS", 3600)?;
        if cleanup_interval_secs == 0 {
            return Err(CoreError::Validation(
                "CLEANUP_INTERVAL_SECS must be at least 1".into(),
            ));
        }

        let webhook_progress_step: u8 = parse_or(&var, "WEBHOOK_PROGRESS_STEP", 10)?;
        if webhook_progress_step > 100 {
            return Err(CoreError::Validation(
                "WEBHOOK_PROGRESS_STEP must be between 0 and 100".into(),
            ));
        }

        let log_json = match var("LOG_FORMAT").as_deref() {
            None | Some("text") => false,
            Some("json") => true,
            Some(other) => {
                return Err(CoreError::Validation(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )))
            }
        };

        Ok(Self {
            pool_size,
            queue_capacity,
            retention_days,
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/output")),
            tool_runner: var("TOOL_RUNNER").unwrap_or_else(|| "docjobs-tool".into()),
            tool_timeout: Duration::from_secs(parse_or(&var, "TOOL_TIMEOUT_SECS", 300)?),
            tool_max_retries: parse_or(&var, "TOOL_MAX_RETRIES", 2)?,
            tool_retry_delay: Duration::from_millis(parse_or(&var, "TOOL_RETRY_DELAY_MS", 5000)?),
            shutdown_timeout: Duration::from_secs(parse_or(&var, "SHUTDOWN_TIMEOUT_SECS", 30)?),
            database_url: var("DATABASE_URL"),
            webhook_max_concurrency,
            webhook_progress_interval: Duration::from_millis(parse_or(
                &var,
                "WEBHOOK_PROGRESS_INTERVAL_MS",
                2000,
            )?),
            webhook_progress_step,
            log_json,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.tool_max_retries,
            delay: self.tool_retry_delay,
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrency: self.webhook_max_concurrency,
            progress_interval: self.webhook_progress_interval,
            progress_step: self.webhook_progress_step,
        }
    }
}

fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has invalid value '{raw}'"))),
    }
}
