//! In-process [`JobStore`] used when no database is configured, and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use docjobs_core::{JobId, JobRecord, JobStatus, Timestamp};
use tokio::sync::RwLock;

use crate::store::{JobQuery, JobStats, JobStore, StoreError};

/// Job records kept in a `HashMap` behind an async `RwLock`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn update(&self, job: &JobRecord) -> Result<Option<JobRecord>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(stored) = jobs.get_mut(&job.id) else {
            return Ok(None);
        };
        if stored.version != job.version {
            return Ok(None);
        }
        let mut next = job.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(Some(next))
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<&JobRecord> = jobs.values().filter(|j| query.matches(j)).collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(matching
            .into_iter()
            .skip(query.effective_offset() as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn stats(&self, since: Timestamp) -> Result<JobStats, StoreError> {
        let jobs = self.jobs.read().await;
        let mut stats = JobStats::default();
        let mut total_ms = 0.0;
        let mut timed = 0u64;
        let mut by_tool: HashMap<&str, (f64, u64)> = HashMap::new();

        for job in jobs.values() {
            *stats.count_by_status.entry(job.status).or_default() += 1;
            if job.status != JobStatus::Completed {
                continue;
            }
            if job.completed_at.is_some_and(|at| at >= since) {
                stats.completed_since += 1;
            }
            if let Some(duration) = job.duration() {
                let ms = duration.num_milliseconds() as f64;
                total_ms += ms;
                timed += 1;
                let entry = by_tool.entry(job.tool_name.as_str()).or_default();
                entry.0 += ms;
                entry.1 += 1;
            }
        }

        if timed > 0 {
            stats.average_duration_ms = Some(total_ms / timed as f64);
        }
        stats.average_duration_ms_by_tool = by_tool
            .into_iter()
            .map(|(tool, (sum, n))| (tool.to_string(), sum / n as f64))
            .collect();
        Ok(stats)
    }

    async fn find_completed(
        &self,
        tool_name: &str,
        input_ref: &str,
        parameters: &serde_json::Value,
    ) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Completed
                    && j.tool_name.eq_ignore_ascii_case(tool_name)
                    && j.input_ref == input_ref
                    && &j.parameters == parameters
            })
            .max_by_key(|j| j.completed_at)
            .cloned())
    }

    async fn find_expired(&self, cutoff: Timestamp) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn delete_terminal(&self, id: &str) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(id) {
            Some(job) if job.is_terminal() => {
                jobs.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::{Duration, Utc};
    use docjobs_core::{JobResult, Outcome};

    use super::*;
    use crate::store::{update_with, WriteOutcome};

    fn job(tool: &str) -> JobRecord {
        JobRecord::new(tool, "/tmp/in.pdf", serde_json::Value::Null)
    }

    // -- compare-and-swap -----------------------------------------------------

    #[tokio::test]
    async fn update_bumps_version_and_rejects_stale_writes() {
        let store = MemoryJobStore::new();
        let original = job("merge");
        store.insert(&original).await.unwrap();

        let mut first = original.clone();
        first.cancel_requested = true;
        let saved = store.update(&first).await.unwrap().expect("first write wins");
        assert_eq!(saved.version, 1);

        let mut stale = original.clone();
        stale.progress_message = "stale".into();
        assert!(store.update(&stale).await.unwrap().is_none());

        let stored = store.get(&original.id).await.unwrap().unwrap();
        assert!(stored.cancel_requested);
        assert_eq!(stored.progress_message, "");
    }

    #[tokio::test]
    async fn update_with_reports_missing_and_unchanged() {
        let store = MemoryJobStore::new();
        assert_matches!(
            update_with(&store, "nope", |_| true).await.unwrap(),
            WriteOutcome::Missing
        );

        let record = job("merge");
        store.insert(&record).await.unwrap();
        let outcome = update_with(&store, &record.id, |_| false).await.unwrap();
        assert_matches!(outcome, WriteOutcome::Unchanged(j) if j.version == 0);
    }

    #[tokio::test]
    async fn concurrent_terminal_writes_commit_exactly_once() {
        let store = Arc::new(MemoryJobStore::new());
        let mut record = job("merge");
        record.start(Utc::now());
        store.insert(&record).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                update_with(store.as_ref(), &id, |job| {
                    job.finish(Outcome::processing_error(format!("writer {i}")), Utc::now())
                })
                .await
                .unwrap()
            }));
        }

        let mut modified = 0;
        for handle in handles {
            if let WriteOutcome::Modified(_) = handle.await.unwrap() {
                modified += 1;
            }
        }
        assert_eq!(modified, 1);
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    // -- listing --------------------------------------------------------------

    #[tokio::test]
    async fn list_is_newest_first_with_filters_and_paging() {
        let store = MemoryJobStore::new();
        let base = Utc::now();
        for i in 0..5 {
            let mut record = job(if i % 2 == 0 { "merge" } else { "split" });
            record.created_at = base + Duration::seconds(i);
            store.insert(&record).await.unwrap();
        }

        let all = store.list(&JobQuery::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let merges = store
            .list(&JobQuery {
                tool_name: Some("merge".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(merges.len(), 3);

        let page = store
            .list(&JobQuery {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, all[1].id);
    }

    // -- stats and expiry -----------------------------------------------------

    #[tokio::test]
    async fn stats_average_completed_durations() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        for (tool, ms) in [("merge", 100), ("merge", 300), ("split", 1000)] {
            let mut record = job(tool);
            record.start(now - Duration::milliseconds(ms));
            record.finish(Outcome::Completed(JobResult::new()), now);
            store.insert(&record).await.unwrap();
        }
        store.insert(&job("merge")).await.unwrap();

        let stats = store.stats(now - Duration::minutes(60)).await.unwrap();
        assert_eq!(stats.count_by_status[&JobStatus::Completed], 3);
        assert_eq!(stats.count_by_status[&JobStatus::Pending], 1);
        assert_eq!(stats.completed_since, 3);
        assert_eq!(stats.average_duration_ms_by_tool["merge"], 200.0);
        let overall = stats.average_duration_ms.unwrap();
        assert!((overall - 466.666).abs() < 1.0);
    }

    #[tokio::test]
    async fn expiry_only_sees_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let mut old = job("merge");
        old.start(now - Duration::days(40));
        old.finish(Outcome::Completed(JobResult::new()), now - Duration::days(40));
        store.insert(&old).await.unwrap();

        let mut stuck = job("merge");
        stuck.created_at = now - Duration::days(40);
        stuck.start(now - Duration::days(40));
        store.insert(&stuck).await.unwrap();

        let expired = store.find_expired(now - Duration::days(30)).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);

        assert!(!store.delete_terminal(&stuck.id).await.unwrap());
        assert!(store.delete_terminal(&old.id).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    // -- lookups --------------------------------------------------------------

    #[tokio::test]
    async fn created_after_filters_recent_jobs() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let mut old = job("merge");
        old.created_at = now - Duration::days(10);
        store.insert(&old).await.unwrap();
        let fresh = job("merge");
        store.insert(&fresh).await.unwrap();

        let recent = store
            .list(&JobQuery {
                created_after: Some(now - Duration::days(7)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, fresh.id);
    }

    #[tokio::test]
    async fn find_completed_matches_tool_input_and_parameters() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let params = serde_json::json!({"quality": 80});

        let completed_at = |record: &mut JobRecord, at| {
            record.start(at);
            record.finish(Outcome::Completed(JobResult::new()), at);
        };

        let mut older = JobRecord::new("compress", "/in/a.pdf", params.clone());
        completed_at(&mut older, now - Duration::hours(2));
        store.insert(&older).await.unwrap();

        let mut newer = JobRecord::new("compress", "/in/a.pdf", params.clone());
        completed_at(&mut newer, now - Duration::hours(1));
        store.insert(&newer).await.unwrap();

        let mut other_params =
            JobRecord::new("compress", "/in/a.pdf", serde_json::json!({"quality": 10}));
        completed_at(&mut other_params, now);
        store.insert(&other_params).await.unwrap();

        let mut failed = JobRecord::new("compress", "/in/b.pdf", params.clone());
        failed.start(now);
        failed.finish(Outcome::processing_error("boom"), now);
        store.insert(&failed).await.unwrap();

        let found = store
            .find_completed("COMPRESS", "/in/a.pdf", &params)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);

        assert!(store
            .find_completed("compress", "/in/b.pdf", &params)
            .await
            .unwrap()
            .is_none());
        assert_matches!(
            store.find_completed("merge", "/in/a.pdf", &params).await,
            Ok(None)
        );
    }
}
