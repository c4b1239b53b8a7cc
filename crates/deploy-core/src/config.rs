//! Configuration parsing for the deployment daemon.
//!
//! Uses a flat key=value format (`deployd.conf`). Unknown keys warn but do not
//! fail. Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Control plane configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Feature flags
    /// Track per-stage status records for workflow runs (default: true).
    pub enable_workflow_execution_stage: bool,
    /// Emit deployment metrics for terminal runs (default: false).
    pub expose_cd_metrics: bool,
    /// Record an explicit sync-initiated timeline entry after git commit.
    pub argocd_manual_sync: bool,

    // GitOps
    pub gitops_repo_root: PathBuf,
    pub gitops_remote_url: Option<String>,
    pub git_bin: PathBuf,

    // External CLIs
    pub argocd_bin: PathBuf,
    pub helm_bin: PathBuf,
    pub kubectl_bin: PathBuf,

    // Scheduling
    pub reconcile_interval_sec: u64,
    pub max_concurrent_deploys: usize,
    pub max_trigger_deliveries: u32,

    /// Upper bound on timeline status detail length, in characters.
    pub timeline_detail_max_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_workflow_execution_stage: true,
            expose_cd_metrics: false,
            argocd_manual_sync: false,
            gitops_repo_root: dirs::data_local_dir().map_or_else(
                || PathBuf::from("~/.local/share/deployd/gitops"),
                |d| d.join("deployd/gitops"),
            ),
            gitops_remote_url: None,
            git_bin: PathBuf::from("git"),
            argocd_bin: PathBuf::from("argocd"),
            helm_bin: PathBuf::from("helm"),
            kubectl_bin: PathBuf::from("kubectl"),
            reconcile_interval_sec: 60,
            max_concurrent_deploys: 3,
            max_trigger_deliveries: 3,
            timeline_detail_max_len: 255,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "enable_workflow_execution_stage" => {
                self.enable_workflow_execution_stage = Self::parse_bool(key, value)?;
            }
            "expose_cd_metrics" => self.expose_cd_metrics = Self::parse_bool(key, value)?,
            "argocd_manual_sync" => self.argocd_manual_sync = Self::parse_bool(key, value)?,
            "gitops_repo_root" => self.gitops_repo_root = PathBuf::from(value),
            "gitops_remote_url" => {
                self.gitops_remote_url = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "git_bin" => self.git_bin = PathBuf::from(value),
            "argocd_bin" => self.argocd_bin = PathBuf::from(value),
            "helm_bin" => self.helm_bin = PathBuf::from(value),
            "kubectl_bin" => self.kubectl_bin = PathBuf::from(value),
            "reconcile_interval_sec" => self.reconcile_interval_sec = Self::parse_int(key, value)?,
            "max_concurrent_deploys" => self.max_concurrent_deploys = Self::parse_int(key, value)?,
            "max_trigger_deliveries" => self.max_trigger_deliveries = Self::parse_int(key, value)?,
            "timeline_detail_max_len" => {
                self.timeline_detail_max_len = Self::parse_int(key, value)?;
            }
            _ => {
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve a relative GitOps root against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.gitops_repo_root.is_relative() {
            self.gitops_repo_root = base.join(&self.gitops_repo_root);
        }
    }
}
