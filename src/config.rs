//! Layered configuration: defaults, then an optional TOML file, then env vars.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "NETCOLLECTOR_CONFIG";
const DEFAULT_VAULT_PASSWORD_ENV: &str = "NETCOLLECTOR_VAULT_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Execution settings used when a job definition omits its own policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionDefaults {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_inter_command_delay_ms")]
    pub inter_command_delay_ms: u64,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout_secs: default_timeout_secs(),
            inter_command_delay_ms: default_inter_command_delay_ms(),
        }
    }
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

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub inventory_db: PathBuf,
    pub collector_db: PathBuf,
    pub template_db: PathBuf,
    /// Root directory for capture files; jobs add their own subdirectory.
    pub capture_root: PathBuf,
    pub batch_dir: PathBuf,
    /// Environment variable consulted as the vault password fallback.
    pub vault_password_env: String,
    pub execution: ExecutionDefaults,
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    data_dir: Option<PathBuf>,
    inventory_db: Option<PathBuf>,
    collector_db: Option<PathBuf>,
    template_db: Option<PathBuf>,
    capture_root: Option<PathBuf>,
    batch_dir: Option<PathBuf>,
    vault_password_env: Option<String>,
    #[serde(default)]
    execution: ExecutionDefaults,
}

impl AppConfig {
    /// Loads configuration. `path` (or `NETCOLLECTOR_CONFIG`) names an
    /// optional TOML file; a missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let explicit = path.map(Path::to_path_buf).or(env_path);

        let mut partial = match &explicit {
            Some(file) => {
                let contents = fs::read_to_string(file).map_err(|source| ConfigError::Io {
                    path: file.display().to_string(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: file.display().to_string(),
                    source,
                })?
            }
            None => {
                let default_file = default_data_dir().join("config.toml");
                if default_file.exists() {
                    let contents =
                        fs::read_to_string(&default_file).map_err(|source| ConfigError::Io {
                            path: default_file.display().to_string(),
                            source,
                        })?;
                    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                        path: default_file.display().to_string(),
                        source,
                    })?
                } else {
                    PartialConfig::default()
                }
            }
        };

        for (var, slot) in [
            ("NETCOLLECTOR_DATA_DIR", &mut partial.data_dir),
            ("NETCOLLECTOR_INVENTORY_DB", &mut partial.inventory_db),
            ("NETCOLLECTOR_COLLECTOR_DB", &mut partial.collector_db),
            ("NETCOLLECTOR_TEMPLATE_DB", &mut partial.template_db),
            ("NETCOLLECTOR_CAPTURE_ROOT", &mut partial.capture_root),
            ("NETCOLLECTOR_BATCH_DIR", &mut partial.batch_dir),
        ] {
            if let Ok(value) = env::var(var) {
                *slot = Some(PathBuf::from(value));
            }
        }
        if let Ok(value) = env::var("NETCOLLECTOR_VAULT_PASSWORD_ENV") {
            partial.vault_password_env = Some(value);
        }

        let data_dir = partial.data_dir.unwrap_or_else(default_data_dir);
        Ok(Self {
            inventory_db: partial
                .inventory_db
                .unwrap_or_else(|| data_dir.join("inventory.db")),
            collector_db: partial
                .collector_db
                .unwrap_or_else(|| data_dir.join("collector.db")),
            template_db: partial
                .template_db
                .unwrap_or_else(|| data_dir.join("templates.db")),
            capture_root: partial
                .capture_root
                .unwrap_or_else(|| data_dir.join("captures")),
            batch_dir: partial.batch_dir.unwrap_or_else(|| data_dir.join("batches")),
            vault_password_env: partial
                .vault_password_env
                .unwrap_or_else(|| DEFAULT_VAULT_PASSWORD_ENV.to_string()),
            execution: partial.execution,
            data_dir,
        })
    }

    pub fn ensure_directories(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(&self.capture_root)?;
        fs::create_dir_all(&self.batch_dir)?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("netcollector")
}
