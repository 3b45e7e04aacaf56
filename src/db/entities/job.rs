use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Declarative unit of collection. Jobs live in the `jobs` table; the same
/// shape can also be loaded from a versioned JSON document, with unknown
/// fields preserved in `extra` but never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    pub capture_kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Primary command. May be a comma-separated sequence; segments run in
    /// order on each device.
    pub command: String,
    #[serde(default)]
    pub paging_disable_command: Option<String>,
    #[serde(default)]
    pub filter: DeviceFilterSpec,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default)]
    pub execution: ExecutionPolicy,
    #[serde(default)]
    pub storage: StoragePolicy,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFilterSpec {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub site_id: Option<i64>,
    #[serde(default)]
    pub platform_id: Option<i64>,
    #[serde(default)]
    pub role_id: Option<i64>,
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub template_filter: Option<String>,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub save_on_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_inter_command_delay_ms")]
    pub inter_command_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePolicy {
    #[serde(default)]
    pub output_subdir: Option<String>,
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_status() -> String {
    "active".to_string()
}

fn default_max_workers() -> usize {
    12
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_inter_command_delay_ms() -> u64 {
    1000
}

fn default_filename_pattern() -> String {
    "{device_name}.txt".to_string()
}

impl Default for DeviceFilterSpec {
    fn default() -> Self {
        Self {
            vendor: None,
            site_id: None,
            platform_id: None,
            role_id: None,
            name_pattern: None,
            status: default_status(),
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            template_filter: None,
            min_score: 0.0,
            save_on_fail: false,
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout_secs: default_timeout_secs(),
            inter_command_delay_ms: default_inter_command_delay_ms(),
        }
    }
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            output_subdir: None,
            filename_pattern: default_filename_pattern(),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobDefinitionError {
    #[error("slug `{0}` is not ASCII kebab-case")]
    BadSlug(String),
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("max_workers must be at least 1")]
    ZeroWorkers,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("validation is enabled but template_filter is empty")]
    MissingTemplateFilter,
    #[error("invalid job JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Job {
    /// Parses a JSON job document and checks its invariants.
    pub fn from_json(raw: &str) -> Result<Self, JobDefinitionError> {
        let job: Job = serde_json::from_str(raw)?;
        job.validate()?;
        Ok(job)
    }

    /// Invariants enforced before any device is contacted.
    pub fn validate(&self) -> Result<(), JobDefinitionError> {
        if !is_kebab(&self.slug) {
            return Err(JobDefinitionError::BadSlug(self.slug.clone()));
        }
        if self.command.trim().is_empty() {
            return Err(JobDefinitionError::EmptyCommand);
        }
        if self.execution.max_workers == 0 {
            return Err(JobDefinitionError::ZeroWorkers);
        }
        if self.execution.timeout_secs == 0 {
            return Err(JobDefinitionError::ZeroTimeout);
        }
        if self.validation.enabled
            && self
                .validation
                .template_filter
                .as_deref()
                .map_or(true, |f| f.trim().is_empty())
        {
            return Err(JobDefinitionError::MissingTemplateFilter);
        }
        Ok(())
    }

    /// Ordered per-device command list: the comma-separated primary command
    /// split into its segments. The paging prelude is not part of this list;
    /// it is sent separately and its failure is non-fatal.
    pub fn command_sequence(&self) -> Vec<String> {
        self.command
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// First segment that looks like a data command, used to locate the
    /// command echo when cleaning transcripts.
    pub fn primary_data_command(&self) -> Option<String> {
        let sequence = self.command_sequence();
        sequence
            .iter()
            .find(|c| {
                let lower = c.to_lowercase();
                lower.starts_with("show ")
                    || lower.starts_with("display ")
                    || lower.starts_with("get ")
            })
            .or_else(|| sequence.first())
            .cloned()
    }
}

fn is_kebab(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
