//! Tool executors backed by an external runner program.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docjobs_core::{
    CancelToken, JobResult, ProgressSink, ToolError, ToolExecutor, ToolRequest, RESULT_URL_KEY,
};
use tokio::process::Command;

use crate::storage::OutputStorage;
use crate::subprocess::run_tool_command;

/// Runs `<runner> <tool-name> <input> <output-dir>` for every tool.
///
/// The job parameters are written to the runner's stdin as JSON. When the
/// runner reports no result, the output directory is returned as
/// `resultUrl`.
pub struct CommandTool {
    runner: String,
    storage: Arc<dyn OutputStorage>,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(runner: impl Into<String>, storage: Arc<dyn OutputStorage>, timeout: Duration) -> Self {
        Self {
            runner: runner.into(),
            storage,
            timeout,
        }
    }
}

#[async_trait]
impl ToolExecutor for CommandTool {
    async fn execute(
        &self,
        request: ToolRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<JobResult, ToolError> {
        let output_dir = self.storage.prepare(&request.job_id).await?;

        let mut cmd = Command::new(&self.runner);
        cmd.arg(request.tool.as_str())
            .arg(&request.input_ref)
            .arg(&output_dir);

        tracing::debug!(
            job_id = %request.job_id,
            tool = %request.tool,
            runner = %self.runner,
            "Spawning tool runner"
        );
        let output = run_tool_command(
            &mut cmd,
            &request.parameters,
            self.timeout,
            progress.as_ref(),
            &cancel,
        )
        .await?;
        tracing::debug!(
            job_id = %request.job_id,
            duration_ms = output.duration_ms,
            "Tool runner finished"
        );

        Ok(output.result.unwrap_or_else(|| {
            let mut result = JobResult::new();
            result.insert(
                RESULT_URL_KEY.into(),
                output_dir.to_string_lossy().into_owned().into(),
            );
            result
        }))
    }
}
