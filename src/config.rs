//! Configuration for the file converter
//!
//! This module provides functionality for:
//! 1. Loading the JSON configuration document once at startup
//! 2. Supplying the base conversion context template
//! 3. Validating watcher, pool and logging settings
//! 4. Writing a default configuration file for first runs

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::ConversionContext;

/// Default configuration file name, looked up next to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// What the dispatcher does when its job queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubmitPolicy {
    /// Drop the job and publish a rejected report
    #[default]
    Reject,
    /// Wait for a free slot in the queue
    Block,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Logging {
    pub level: String,
    pub format: String,
    pub directory: String,
    pub to_file: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "line".to_string(),
            directory: "./logs".to_string(),
            to_file: false,
        }
    }
}

/// The whole configuration document.
///
/// Context template keys live at the top level of the JSON object next to the
/// watcher settings, so `{"destinationFormat": "pdf", "monitoredDir": "in"}`
/// is a complete file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub context: ConversionContext,
    pub monitored_dir: Option<PathBuf>,
    pub monitor_at_start: bool,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// Worker threads; 0 means "pick from the CPU count"
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_policy: SubmitPolicy,
    pub logging: Logging,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            context: ConversionContext {
                destination_format: Some("pdf".to_string()),
                ..ConversionContext::default()
            },
            monitored_dir: None,
            monitor_at_start: false,
            output_dir: PathBuf::from("./converted"),
            temp_dir: std::env::temp_dir().join("file_converter"),
            workers: 0,
            queue_capacity: 64,
            submit_policy: SubmitPolicy::Reject,
            logging: Logging::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = fs::read_to_string(path)?;
        let config = Self::from_json(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: AppConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to `path` unless a file is already there.
    pub fn write_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config = Self::default();
        if path.exists() {
            warn!(path = %path.display(), "Config file already exists, leaving it untouched");
            return Self::load(path);
        }
        config.save(path)?;
        info!(path = %path.display(), "Created default configuration");
        Ok(config)
    }

    /// Save the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Check the settings that cannot be expressed by the types alone.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queueCapacity",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "outputDir",
                reason: "must not be empty".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "json" | "line") {
            return Err(ConfigError::Invalid {
                key: "logging.format",
                reason: format!("expected \"json\" or \"line\", got {:?}", self.logging.format),
            });
        }

        if let Some(monitored) = &self.monitored_dir {
            // Output written under the watched tree would be picked up and converted again
            if is_within(&self.output_dir, monitored) {
                return Err(ConfigError::Invalid {
                    key: "outputDir",
                    reason: format!(
                        "{} lies inside the monitored directory {}",
                        self.output_dir.display(),
                        monitored.display()
                    ),
                });
            }
            if is_within(&self.temp_dir, monitored) {
                return Err(ConfigError::Invalid {
                    key: "tempDir",
                    reason: format!(
                        "{} lies inside the monitored directory {}",
                        self.temp_dir.display(),
                        monitored.display()
                    ),
                });
            }
        }

        if self.monitor_at_start && self.monitored_dir.is_none() {
            return Err(ConfigError::Invalid {
                key: "monitoredDir",
                reason: "required when monitorAtStart is set".to_string(),
            });
        }

        Ok(())
    }

    /// Number of dispatch workers to start.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        // 80% of logical cores, minimum 1
        ((num_cpus::get() as f64 * 0.8).floor() as usize).max(1)
    }
}

fn is_within(candidate: &Path, root: &Path) -> bool {
    let candidate = absolutize(candidate);
    let root = absolutize(root);
    candidate.starts_with(&root)
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
