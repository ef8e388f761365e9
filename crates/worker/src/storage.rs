//! Per-job output directories.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use docjobs_core::JobRecord;

/// Where tools write their outputs, and how expired outputs are removed.
#[async_trait]
pub trait OutputStorage: Send + Sync {
    /// Directory owned by `job_id`. Not created.
    fn output_dir(&self, job_id: &str) -> io::Result<PathBuf>;

    /// Create the job's directory if needed and return it.
    async fn prepare(&self, job_id: &str) -> io::Result<PathBuf> {
        let dir = self.output_dir(job_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Delete every artifact of `job`. Returns the number of files removed.
    async fn remove_outputs(&self, job: &JobRecord) -> io::Result<u64>;
}

/// One directory per job under a local root.
pub struct LocalOutputStorage {
    root: PathBuf,
}

impl LocalOutputStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl OutputStorage for LocalOutputStorage {
    fn output_dir(&self, job_id: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(job_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(job_id)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("job id '{job_id}' is not a plain path segment"),
            )),
        }
    }

    async fn remove_outputs(&self, job: &JobRecord) -> io::Result<u64> {
        let dir = self.output_dir(&job.id)?;
        let files = match count_files(&dir).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(files)
    }
}

async fn count_files(dir: &Path) -> io::Result<u64> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}
