//! Cluster-facing collaborators: GitOps sync, direct Helm install and live
//! state queries, with implementations that shell out to `argocd`, `helm`
//! and `kubectl`.

use async_trait::async_trait;
use deploy_core::{ChartGitAttribute, InstalledAppVersion};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{tool} failed: {message}")]
    CommandFailed { tool: String, message: String },
    #[error("failed to execute {tool}: {source}")]
    Execution {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected output: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Live resource tree of a GitOps-managed application.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceTree {
    /// Aggregated health, e.g. `Healthy`, `Degraded`, `Progressing`.
    pub health: String,
    pub nodes: Vec<serde_json::Value>,
}

/// Live detail of a Helm release.
#[derive(Debug, Clone, Serialize)]
pub struct HelmAppDetail {
    pub release_status: String,
    /// Application health derived from the release status.
    pub health: String,
    pub resource_tree: serde_json::Value,
}

#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Create or update the GitOps application and trigger a sync.
    async fn install_or_sync(
        &self,
        version: &InstalledAppVersion,
        attribute: &ChartGitAttribute,
    ) -> Result<()>;
}

#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Install or upgrade the release directly.
    async fn install(&self, version: &InstalledAppVersion) -> Result<()>;
}

#[async_trait]
pub trait ClusterStateClient: Send + Sync {
    async fn argo_resource_tree(&self, app_name: &str) -> Result<ResourceTree>;

    /// `None` when the release does not exist.
    async fn helm_app_detail(&self, release: &str, namespace: &str)
        -> Result<Option<HelmAppDetail>>;

    async fn server_version(&self, cluster_id: i64) -> Result<Option<String>>;
}

/// Implements all cluster collaborators on top of the CLIs.
#[derive(Debug, Clone)]
pub struct CliClusterClient {
    argocd_bin: PathBuf,
    helm_bin: PathBuf,
    kubectl_bin: PathBuf,
}

impl CliClusterClient {
    pub fn new(argocd_bin: PathBuf, helm_bin: PathBuf, kubectl_bin: PathBuf) -> Self {
        Self {
            argocd_bin,
            helm_bin,
            kubectl_bin,
        }
    }

    pub fn from_config(config: &deploy_core::Config) -> Self {
        Self::new(
            config.argocd_bin.clone(),
            config.helm_bin.clone(),
            config.kubectl_bin.clone(),
        )
    }
}

async fn run(bin: &PathBuf, args: &[&str], stdin: Option<&str>) -> Result<String> {
    let tool = bin.display().to_string();
    let mut child = Command::new(bin)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ClusterError::Execution {
            tool: tool.clone(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|source| ClusterError::Execution {
                tool: tool.clone(),
                source,
            })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ClusterError::Execution {
            tool: tool.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(ClusterError::CommandFailed {
            tool,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Map a Helm release status onto an application health value.
pub fn helm_release_health(release_status: &str) -> &'static str {
    match release_status {
        "deployed" => "Healthy",
        "failed" => "Degraded",
        "pending-install" | "pending-upgrade" | "pending-rollback" => "Progressing",
        "uninstalling" | "uninstalled" | "superseded" => "Missing",
        _ => "Unknown",
    }
}

/// Parse `argocd app get -o json` output.
pub fn parse_argo_app(json: &str) -> Result<ResourceTree> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let health = value["status"]["health"]["status"]
        .as_str()
        .unwrap_or("Unknown")
        .to_string();
    let nodes = value["status"]["resources"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    Ok(ResourceTree { health, nodes })
}

#[async_trait]
impl SyncClient for CliClusterClient {
    async fn install_or_sync(
        &self,
        version: &InstalledAppVersion,
        attribute: &ChartGitAttribute,
    ) -> Result<()> {
        let app_name = version.deployment_app_name();
        run(
            &self.argocd_bin,
            &[
                "app",
                "create",
                &app_name,
                "--repo",
                &attribute.repo_url,
                "--path",
                &attribute.chart_location,
                "--revision",
                &attribute.target_revision,
                "--dest-namespace",
                &version.namespace,
                "--dest-server",
                "https://kubernetes.default.svc",
                "--upsert",
            ],
            None,
        )
        .await?;
        run(&self.argocd_bin, &["app", "sync", &app_name, "--async"], None).await?;
        tracing::info!(app = %app_name, revision = %attribute.target_revision, "argocd sync requested");
        Ok(())
    }
}

#[async_trait]
impl HelmClient for CliClusterClient {
    async fn install(&self, version: &InstalledAppVersion) -> Result<()> {
        let release = version.deployment_app_name();
        run(
            &self.helm_bin,
            &[
                "upgrade",
                "--install",
                &release,
                &version.chart_name,
                "--repo",
                &version.chart_repo_url,
                "--version",
                &version.chart_version,
                "--namespace",
                &version.namespace,
                "--create-namespace",
                "--values",
                "-",
            ],
            Some(&version.values_override_yaml),
        )
        .await?;
        tracing::info!(release = %release, chart = %version.chart_name, "helm release installed");
        Ok(())
    }
}

#[async_trait]
impl ClusterStateClient for CliClusterClient {
    async fn argo_resource_tree(&self, app_name: &str) -> Result<ResourceTree> {
        let output = run(&self.argocd_bin, &["app", "get", app_name, "-o", "json"], None).await?;
        parse_argo_app(&output)
    }

    async fn helm_app_detail(
        &self,
        release: &str,
        namespace: &str,
    ) -> Result<Option<HelmAppDetail>> {
        let output = match run(
            &self.helm_bin,
            &["status", release, "--namespace", namespace, "-o", "json"],
            None,
        )
        .await
        {
            Ok(output) => output,
            Err(ClusterError::CommandFailed { message, .. }) if message.contains("not found") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let value: serde_json::Value = serde_json::from_str(&output)?;
        let release_status = value["info"]["status"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        Ok(Some(HelmAppDetail {
            health: helm_release_health(&release_status).to_string(),
            release_status,
            resource_tree: value["info"]["resources"].clone(),
        }))
    }

    async fn server_version(&self, _cluster_id: i64) -> Result<Option<String>> {
        let output = run(&self.kubectl_bin, &["version", "-o", "json"], None).await?;
        let value: serde_json::Value = serde_json::from_str(&output)?;
        Ok(value["serverVersion"]["gitVersion"]
            .as_str()
            .map(ToString::to_string))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_argo_app_reads_health_and_resources() {
        let json = r#"{
            "status": {
                "health": {"status": "Degraded"},
                "resources": [{"kind": "Service", "name": "web"}]
            }
        }"#;
        let tree = parse_argo_app(json).unwrap();
        assert_eq!(tree.health, "Degraded");
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.nodes[0]["kind"], "Service");
    }

    #[test]
    fn parse_argo_app_defaults_missing_fields() {
        let tree = parse_argo_app("{}").unwrap();
        assert_eq!(tree.health, "Unknown");
        assert!(tree.nodes.is_empty());
        assert!(parse_argo_app("not json").is_err());
    }

    #[test]
    fn helm_release_health_mapping() {
        assert_eq!(helm_release_health("deployed"), "Healthy");
        assert_eq!(helm_release_health("failed"), "Degraded");
        assert_eq!(helm_release_health("pending-upgrade"), "Progressing");
        assert_eq!(helm_release_health("mystery"), "Unknown");
    }

    #[tokio::test]
    async fn missing_binary_is_execution_error() {
        let client = CliClusterClient::new(
            "/nonexistent/argocd".into(),
            "/nonexistent/helm".into(),
            "/nonexistent/kubectl".into(),
        );
        let err = client.argo_resource_tree("app").await.unwrap_err();
        assert!(matches!(err, ClusterError::Execution { .. }));
    }
}
