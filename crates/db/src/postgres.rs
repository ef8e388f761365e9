//! PostgreSQL-backed [`JobStore`] for the `jobs` table.

use async_trait::async_trait;
use docjobs_core::{JobErrorCode, JobRecord, JobStatus, Timestamp};
use sqlx::{FromRow, PgPool};

use crate::store::{JobQuery, JobStats, JobStore, StoreError};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, tool_name, input_ref, parameters, status, \
    progress_percent, progress_message, \
    created_at, started_at, completed_at, \
    result, error_code, error_message, cancel_requested, version";

const TERMINAL_STATUSES: [JobStatus; 3] = JobStatus::TERMINAL;

/// A row from the `jobs` table.
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    tool_name: String,
    input_ref: String,
    parameters: serde_json::Value,
    status: String,
    progress_percent: i16,
    progress_message: String,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    result: Option<serde_json::Value>,
    error_code: Option<String>,
    error_message: Option<String>,
    cancel_requested: bool,
    version: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let decode = |message: String| StoreError::Decode {
            id: row.id.clone(),
            message,
        };
        let status: JobStatus = row.status.parse().map_err(|e| decode(format!("{e}")))?;
        let error_code = row
            .error_code
            .as_deref()
            .map(str::parse::<JobErrorCode>)
            .transpose()
            .map_err(|e| decode(format!("{e}")))?;
        let result = match row.result {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) => Some(map),
            Some(other) => return Err(decode(format!("result is not an object: {other}"))),
        };
        let progress_percent = u8::try_from(row.progress_percent.clamp(0, 100)).unwrap_or(0);

        Ok(JobRecord {
            id: row.id,
            tool_name: row.tool_name,
            input_ref: row.input_ref,
            parameters: row.parameters,
            status,
            progress_percent,
            progress_message: row.progress_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            result,
            error_code,
            error_message: row.error_message,
            cancel_requested: row.cancel_requested,
            version: row.version,
        })
    }
}

fn result_value(job: &JobRecord) -> Option<serde_json::Value> {
    job.result.clone().map(serde_json::Value::Object)
}

/// Job persistence over a shared `PgPool`.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs \
                 (id, tool_name, input_ref, parameters, status, \
                  progress_percent, progress_message, created_at, started_at, completed_at, \
                  result, error_code, error_message, cancel_requested, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&job.id)
        .bind(&job.tool_name)
        .bind(&job.input_ref)
        .bind(&job.parameters)
        .bind(job.status.as_str())
        .bind(i16::from(job.progress_percent))
        .bind(&job.progress_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(result_value(job))
        .bind(job.error_code.map(JobErrorCode::as_str))
        .bind(&job.error_message)
        .bind(job.cancel_requested)
        .bind(job.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn update(&self, job: &JobRecord) -> Result<Option<JobRecord>, StoreError> {
        let query = format!(
            "UPDATE jobs \
             SET status = $3, progress_percent = $4, progress_message = $5, \
                 started_at = $6, completed_at = $7, result = $8, \
                 error_code = $9, error_message = $10, cancel_requested = $11, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(&job.id)
            .bind(job.version)
            .bind(job.status.as_str())
            .bind(i16::from(job.progress_percent))
            .bind(&job.progress_message)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(result_value(job))
            .bind(job.error_code.map(JobErrorCode::as_str))
            .bind(&job.error_message)
            .bind(job.cancel_requested)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn list(&self, params: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if params.status.is_some() {
            conditions.push(format!("status = ${bind_idx}"));
            bind_idx += 1;
        }
        if params.tool_name.is_some() {
            conditions.push(format!("LOWER(tool_name) = LOWER(${bind_idx})"));
            bind_idx += 1;
        }
        if params.created_after.is_some() {
            conditions.push(format!("created_at >= ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             {where_clause} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, JobRow>(&query);
        if let Some(status) = params.status {
            q = q.bind(status.as_str());
        }
        if let Some(tool) = &params.tool_name {
            q = q.bind(tool);
        }
        if let Some(after) = params.created_after {
            q = q.bind(after);
        }
        q = q.bind(params.effective_limit()).bind(params.effective_offset());

        q.fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }

    async fn stats(&self, since: Timestamp) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in counts {
            let status: JobStatus = status.parse().map_err(|e| StoreError::Decode {
                id: "<aggregate>".to_string(),
                message: format!("{e}"),
            })?;
            stats.count_by_status.insert(status, count.max(0) as u64);
        }

        let per_tool: Vec<(String, f64, i64)> = sqlx::query_as(
            "SELECT tool_name, \
                    AVG(EXTRACT(EPOCH FROM completed_at - started_at) * 1000)::FLOAT8, \
                    COUNT(*) \
             FROM jobs \
             WHERE status = $1 AND started_at IS NOT NULL AND completed_at IS NOT NULL \
             GROUP BY tool_name",
        )
        .bind(JobStatus::Completed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let (mut weighted, mut total) = (0.0, 0i64);
        for (tool, avg_ms, count) in per_tool {
            weighted += avg_ms * count as f64;
            total += count;
            stats.average_duration_ms_by_tool.insert(tool, avg_ms);
        }
        if total > 0 {
            stats.average_duration_ms = Some(weighted / total as f64);
        }

        let completed: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1 AND completed_at >= $2")
                .bind(JobStatus::Completed.as_str())
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        stats.completed_since = completed.max(0) as u64;

        Ok(stats)
    }

    async fn find_completed(
        &self,
        tool_name: &str,
        input_ref: &str,
        parameters: &serde_json::Value,
    ) -> Result<Option<JobRecord>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status = $1 AND LOWER(tool_name) = LOWER($2) \
               AND input_ref = $3 AND parameters = $4 \
             ORDER BY completed_at DESC NULLS LAST \
             LIMIT 1"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(JobStatus::Completed.as_str())
            .bind(tool_name)
            .bind(input_ref)
            .bind(parameters)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn find_expired(&self, cutoff: Timestamp) -> Result<Vec<JobRecord>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE status IN ($1, $2, $3) AND completed_at < $4 \
             ORDER BY completed_at ASC"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(TERMINAL_STATUSES[0].as_str())
            .bind(TERMINAL_STATUSES[1].as_str())
            .bind(TERMINAL_STATUSES[2].as_str())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRecord::try_from)
            .collect()
    }

    async fn delete_terminal(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status IN ($2, $3, $4)")
            .bind(id)
            .bind(TERMINAL_STATUSES[0].as_str())
            .bind(TERMINAL_STATUSES[1].as_str())
            .bind(TERMINAL_STATUSES[2].as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
