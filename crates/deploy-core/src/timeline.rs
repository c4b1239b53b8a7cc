//! Timeline status catalogue and failure detail extraction.

use crate::types::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client message carried by errors raised when an image scan blocks a deploy.
pub const FOUND_VULNERABILITY: &str = "Found vulnerability on image";

/// Default maximum length of a timeline status detail.
pub const DEFAULT_DETAIL_MAX_LEN: usize = 255;

/// Milestones recorded on a deployment timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineStatus {
    DeploymentInitiated,
    GitCommit,
    GitCommitFailed,
    ArgocdSyncInitiated,
    ArgocdSyncCompleted,
    Healthy,
    DeploymentFailed,
    DeploymentSuperseded,
    HelmInstallFailed,
}

impl TimelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentInitiated => "DEPLOYMENT_INITIATED",
            Self::GitCommit => "GIT_COMMIT",
            Self::GitCommitFailed => "GIT_COMMIT_FAILED",
            Self::ArgocdSyncInitiated => "ARGOCD_SYNC_INITIATED",
            Self::ArgocdSyncCompleted => "ARGOCD_SYNC_COMPLETED",
            Self::Healthy => "HEALTHY",
            Self::DeploymentFailed => "DEPLOYMENT_FAILED",
            Self::DeploymentSuperseded => "DEPLOYMENT_SUPERSEDED",
            Self::HelmInstallFailed => "HELM_INSTALL_FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DEPLOYMENT_INITIATED" => Some(Self::DeploymentInitiated),
            "GIT_COMMIT" => Some(Self::GitCommit),
            "GIT_COMMIT_FAILED" => Some(Self::GitCommitFailed),
            "ARGOCD_SYNC_INITIATED" => Some(Self::ArgocdSyncInitiated),
            "ARGOCD_SYNC_COMPLETED" => Some(Self::ArgocdSyncCompleted),
            "HEALTHY" => Some(Self::Healthy),
            "DEPLOYMENT_FAILED" => Some(Self::DeploymentFailed),
            "DEPLOYMENT_SUPERSEDED" => Some(Self::DeploymentSuperseded),
            "HELM_INSTALL_FAILED" => Some(Self::HelmInstallFailed),
            _ => None,
        }
    }

    /// Canonical human description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::DeploymentInitiated => "Deployment initiated successfully.",
            Self::GitCommit => "Git commit done successfully.",
            Self::GitCommitFailed => "Git commit failed.",
            Self::ArgocdSyncInitiated => "Argo CD sync initiated.",
            Self::ArgocdSyncCompleted => "Argo CD sync completed.",
            Self::Healthy => "Application is healthy.",
            Self::DeploymentFailed => "Deployment failed.",
            Self::DeploymentSuperseded => "This deployment is superseded.",
            Self::HelmInstallFailed => "Helm install failed.",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::GitCommitFailed
                | Self::DeploymentFailed
                | Self::DeploymentSuperseded
                | Self::HelmInstallFailed
        )
    }
}

/// What a timeline entry belongs to: a workflow run or an installed app
/// version history record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TimelineOwner {
    Runner(Id),
    AppHistory(Id),
}

impl TimelineOwner {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Runner(_) => "runner",
            Self::AppHistory(_) => "app_history",
        }
    }

    pub fn id(&self) -> &Id {
        match self {
            Self::Runner(id) | Self::AppHistory(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "runner" => Some(Self::Runner(Id(id))),
            "app_history" => Some(Self::AppHistory(Id(id))),
            _ => None,
        }
    }
}

/// Immutable, append-only status milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Id,
    pub owner: TimelineOwner,
    pub status: TimelineStatus,
    pub status_detail: String,
    pub status_time: DateTime<Utc>,
    pub created_by: i32,
}

impl TimelineEntry {
    /// Entry with the status' canonical description.
    pub fn new(owner: TimelineOwner, status: TimelineStatus, created_by: i32) -> Self {
        Self::with_detail(owner, status, status.description(), created_by)
    }

    pub fn with_detail(
        owner: TimelineOwner,
        status: TimelineStatus,
        detail: impl Into<String>,
        created_by: i32,
    ) -> Self {
        Self {
            id: Id::new(),
            owner,
            status,
            status_detail: detail.into(),
            status_time: Utc::now(),
            created_by,
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.status_time = time;
        self
    }
}

/// Timeline detail for a failed deployment.
///
/// A vulnerability-scan block gets its own description; anything else is
/// prefixed and truncated to `max_len` characters.
pub fn failed_status_detail(message: &str, max_len: usize) -> String {
    if message == FOUND_VULNERABILITY {
        return "Deployment failed: Vulnerability policy violated.".to_string();
    }
    truncate_chars(&format!("Deployment failed: {message}"), max_len)
}

/// Truncate to at most `max_len` characters, respecting char boundaries.
pub fn truncate_chars(value: &str, max_len: usize) -> String {
    match value.char_indices().nth(max_len) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}
