//! GitOps repository operations.
//!
//! The deploy orchestrator commits the rendered chart of an installed app
//! version into a GitOps repository; an external sync agent applies it.
//! Layout: `<root>/<app>-<env>/{Chart.yaml,values.yaml}` plus a
//! `repositories.yaml` registry of chart repositories at the root.

use async_trait::async_trait;
use deploy_core::{ChartGitAttribute, InstalledAppVersion};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitOpsError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("failed to render manifest: {0}")]
    Render(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, GitOpsError>;

/// Result of a manifest commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommitResult {
    pub commit_hash: String,
    pub attribute: ChartGitAttribute,
}

#[async_trait]
pub trait GitOpsClient: Send + Sync {
    /// Make sure the chart repository of `version` is registered.
    async fn ensure_repo_secret(&self, version: &InstalledAppVersion) -> Result<()>;

    /// Render the chart of `version` and commit it.
    async fn generate_manifest_and_commit(
        &self,
        version: &InstalledAppVersion,
    ) -> Result<GitCommitResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RepositoryEntry {
    name: String,
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChartManifest<'a> {
    api_version: &'static str,
    name: String,
    version: &'a str,
    dependencies: Vec<ChartDependency<'a>>,
}

#[derive(Debug, Serialize)]
struct ChartDependency<'a> {
    name: &'a str,
    version: &'a str,
    repository: &'a str,
}

/// Render the umbrella `Chart.yaml` for an installed app version.
pub fn render_chart_yaml(version: &InstalledAppVersion) -> Result<String> {
    let manifest = ChartManifest {
        api_version: "v2",
        name: version.deployment_app_name(),
        version: &version.chart_version,
        dependencies: vec![ChartDependency {
            name: &version.chart_name,
            version: &version.chart_version,
            repository: &version.chart_repo_url,
        }],
    };
    Ok(serde_yaml::to_string(&manifest)?)
}

/// Render `values.yaml`: the override values nested under the dependency chart name.
pub fn render_values_yaml(version: &InstalledAppVersion) -> Result<String> {
    let overrides: serde_yaml::Value = if version.values_override_yaml.trim().is_empty() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        serde_yaml::from_str(&version.values_override_yaml)?
    };
    let mut root = serde_yaml::Mapping::new();
    root.insert(
        serde_yaml::Value::String(version.chart_name.clone()),
        overrides,
    );
    Ok(serde_yaml::to_string(&serde_yaml::Value::Mapping(root))?)
}

fn digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// GitOps client backed by a local git repository, optionally pushed to a remote.
#[derive(Debug, Clone)]
pub struct LocalGitOpsClient {
    root: PathBuf,
    remote_url: Option<String>,
    git_bin: PathBuf,
}

impl LocalGitOpsClient {
    pub fn new(root: PathBuf, remote_url: Option<String>, git_bin: PathBuf) -> Self {
        Self {
            root,
            remote_url,
            git_bin,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.git_bin)
            .args(["-c", "user.name=deployd", "-c", "user.email=deployd@localhost"])
            .args(args)
            .current_dir(&self.root)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitOpsError::CommandFailed(format!(
                "git {}: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map(|s| s.trim().to_string())
            .map_err(|_| GitOpsError::InvalidUtf8)
    }

    /// Initialize the repository on first use.
    async fn ensure_repo(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        if !self.root.join(".git").exists() {
            self.git(&["init", "--quiet"]).await?;
            tracing::info!(root = %self.root.display(), "initialized gitops repository");
        }
        Ok(())
    }

    /// Whether the index differs from HEAD (or HEAD does not exist yet).
    async fn has_staged_changes(&self) -> Result<bool> {
        if self.git(&["rev-parse", "--verify", "HEAD"]).await.is_err() {
            return Ok(true);
        }
        let status = Command::new(&self.git_bin)
            .args(["diff", "--cached", "--quiet"])
            .current_dir(&self.root)
            .status()
            .await?;
        Ok(!status.success())
    }

    fn repo_url(&self) -> String {
        self.remote_url
            .clone()
            .unwrap_or_else(|| format!("file://{}", self.root.display()))
    }
}

#[async_trait]
impl GitOpsClient for LocalGitOpsClient {
    async fn ensure_repo_secret(&self, version: &InstalledAppVersion) -> Result<()> {
        self.ensure_repo().await?;
        let path = self.root.join("repositories.yaml");
        let mut entries: Vec<RepositoryEntry> = match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => serde_yaml::from_str(&content)?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if entries.iter().any(|e| e.url == version.chart_repo_url) {
            return Ok(());
        }
        entries.push(RepositoryEntry {
            name: version.chart_name.clone(),
            url: version.chart_repo_url.clone(),
        });
        tokio::fs::write(&path, serde_yaml::to_string(&entries)?).await?;
        tracing::debug!(url = %version.chart_repo_url, "registered chart repository");
        Ok(())
    }

    async fn generate_manifest_and_commit(
        &self,
        version: &InstalledAppVersion,
    ) -> Result<GitCommitResult> {
        self.ensure_repo().await?;
        let chart_location = version.deployment_app_name();
        let chart_dir = self.root.join(&chart_location);
        tokio::fs::create_dir_all(&chart_dir).await?;

        let values = render_values_yaml(version)?;
        tokio::fs::write(chart_dir.join("Chart.yaml"), render_chart_yaml(version)?).await?;
        tokio::fs::write(chart_dir.join("values.yaml"), &values).await?;

        self.git(&["add", "-A"]).await?;
        if self.has_staged_changes().await? {
            let values_digest = digest(&values);
            let message = format!(
                "deploy {chart_location} chart {} (values sha256:{})",
                version.chart_version,
                &values_digest[..12]
            );
            self.git(&["commit", "--quiet", "-m", &message]).await?;
        } else {
            tracing::debug!(chart = %chart_location, "manifest unchanged; reusing HEAD");
        }
        let commit_hash = self.git(&["rev-parse", "HEAD"]).await?;

        if let Some(remote) = &self.remote_url {
            self.git(&["push", "--quiet", remote, "HEAD"]).await?;
        }

        Ok(GitCommitResult {
            commit_hash,
            attribute: ChartGitAttribute {
                repo_url: self.repo_url(),
                target_revision: "HEAD".to_string(),
                chart_location,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::test_version;
    use deploy_core::{DeployProgress, DeploymentAppType};
    use tempfile::TempDir;

    fn version() -> InstalledAppVersion {
        test_version(DeploymentAppType::GitOps, DeployProgress::default())
    }

    #[test]
    fn chart_yaml_declares_dependency() {
        let rendered = render_chart_yaml(&version()).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["apiVersion"], "v2");
        assert_eq!(parsed["name"], "billing-prod");
        assert_eq!(parsed["dependencies"][0]["name"], "billing");
        assert_eq!(
            parsed["dependencies"][0]["repository"],
            "https://charts.example.com"
        );
    }

    #[test]
    fn values_are_nested_under_chart_name() {
        let rendered = render_values_yaml(&version()).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["billing"]["replicaCount"], 2);
    }

    #[test]
    fn empty_values_render_empty_mapping() {
        let mut version = version();
        version.values_override_yaml = String::new();
        let rendered = render_values_yaml(&version).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert!(parsed["billing"].as_mapping().unwrap().is_empty());
    }

    #[test]
    fn invalid_values_fail_to_render() {
        let mut version = version();
        version.values_override_yaml = "a: [unclosed".to_string();
        assert!(matches!(
            render_values_yaml(&version),
            Err(GitOpsError::Render(_))
        ));
    }

    #[tokio::test]
    async fn repo_secret_is_recorded_once() {
        let dir = TempDir::new().unwrap();
        let client = LocalGitOpsClient::new(dir.path().join("gitops"), None, "git".into());
        client.ensure_repo_secret(&version()).await.unwrap();
        client.ensure_repo_secret(&version()).await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("gitops/repositories.yaml")).unwrap();
        let entries: Vec<RepositoryEntry> = serde_yaml::from_str(&content).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://charts.example.com");
    }

    #[tokio::test]
    async fn commit_writes_chart_and_returns_hash() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("gitops");
        let client = LocalGitOpsClient::new(root.clone(), None, "git".into());

        let first = client.generate_manifest_and_commit(&version()).await.unwrap();
        assert_eq!(first.commit_hash.len(), 40);
        assert_eq!(first.attribute.chart_location, "billing-prod");
        assert!(first.attribute.repo_url.starts_with("file://"));
        assert!(root.join("billing-prod/Chart.yaml").exists());

        // Unchanged manifest reuses the existing commit.
        let second = client.generate_manifest_and_commit(&version()).await.unwrap();
        assert_eq!(first.commit_hash, second.commit_hash);
    }
}
