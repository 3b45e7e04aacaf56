//! Batch definitions: YAML files naming an ordered list of job slugs.

pub mod runner;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch file not found: {0}")]
    NotFound(String),
    #[error("batch `{0}` names no jobs")]
    Empty(String),
    #[error("failed to read batch file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid batch YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn default_job_parallelism() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered job slugs. Order is user intent.
    pub jobs: Vec<String>,
    /// Cancel remaining jobs once one completes `failed` (not `partial`).
    #[serde(default)]
    pub stop_on_failure: bool,
    /// Pause between jobs in sequential mode.
    #[serde(default)]
    pub pause_between_jobs_secs: u64,
    /// Job-level parallelism. 1 (the default) preserves strict order.
    #[serde(default = "default_job_parallelism")]
    pub max_concurrent_jobs: usize,
}

impl BatchDefinition {
    /// Splits the job list into (known, unknown) against the defined slugs.
    pub fn partition_jobs<'a>(
        &'a self,
        existing: &[String],
    ) -> (Vec<&'a str>, Vec<&'a str>) {
        self.jobs
            .iter()
            .map(String::as_str)
            .partition(|slug| existing.iter().any(|e| e == slug))
    }
}

pub struct BatchLoader {
    dir: PathBuf,
}

impl BatchLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        let mut path = self.dir.join(name);
        if path.extension().is_none() {
            path.set_extension("yaml");
        }
        path
    }

    pub fn load(&self, name: &str) -> Result<BatchDefinition, BatchError> {
        let path = if Path::new(name).is_absolute() {
            PathBuf::from(name)
        } else {
            self.path_for(name)
        };
        Self::load_path(&path)
    }

    fn load_path(path: &Path) -> Result<BatchDefinition, BatchError> {
        if !path.exists() {
            return Err(BatchError::NotFound(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        let batch: BatchDefinition = serde_yaml::from_str(&contents)?;
        if batch.jobs.is_empty() {
            return Err(BatchError::Empty(batch.name));
        }
        Ok(batch)
    }

    /// Every parseable batch in the directory, sorted by file name.
    /// Unparseable files are logged and skipped.
    pub fn list(&self) -> Result<Vec<BatchDefinition>, BatchError> {
        let mut batches = Vec::new();
        if !self.dir.exists() {
            return Ok(batches);
        }
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map_or(false, |ext| ext == "yaml" || ext == "yml")
            })
            .collect();
        entries.sort();
        for path in entries {
            match Self::load_path(&path) {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable batch"),
            }
        }
        Ok(batches)
    }
}
