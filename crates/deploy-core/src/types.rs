//! Core types for the deployment control plane.
//!
//! Status domains are closed enums with a single, central `is_terminal()`
//! predicate each. Raw strings coming from the workflow engine are parsed at
//! the edge and never compared ad hoc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for runs, stages, timeline entries and app versions.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Run status ---

/// Deployment run (workflow runner) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RunStatus {
    Starting,
    Queued,
    WaitingToStart,
    Initiating,
    Running,
    Progressing,
    Succeeded,
    Healthy,
    Degraded,
    Failed,
    Aborted,
    TimedOut,
    Cancelled,
    Unknown,
}

impl RunStatus {
    pub const TERMINAL: [RunStatus; 7] = [
        Self::Succeeded,
        Self::Healthy,
        Self::Degraded,
        Self::Failed,
        Self::Aborted,
        Self::TimedOut,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Queued => "Queued",
            Self::WaitingToStart => "WaitingToStart",
            Self::Initiating => "Initiating",
            Self::Running => "Running",
            Self::Progressing => "Progressing",
            Self::Succeeded => "Succeeded",
            Self::Healthy => "Healthy",
            Self::Degraded => "Degraded",
            Self::Failed => "Failed",
            Self::Aborted => "Aborted",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a raw status as reported by the workflow engine or stored in the
    /// database. Matching is case-insensitive; anything unrecognized is `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "queued" => Self::Queued,
            "waitingtostart" | "waiting_to_start" => Self::WaitingToStart,
            "initiating" => Self::Initiating,
            "running" => Self::Running,
            "progressing" => Self::Progressing,
            "succeeded" => Self::Succeeded,
            "healthy" => Self::Healthy,
            "degraded" => Self::Degraded,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            "timedout" | "timeout" => Self::TimedOut,
            "cancelled" | "canceled" | "cancel" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which workflow of a pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    Pre,
    Deploy,
    Post,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "PRE",
            Self::Deploy => "DEPLOY",
            Self::Post => "POST",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "PRE" => Some(Self::Pre),
            "DEPLOY" => Some(Self::Deploy),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }

    pub fn is_deploy(&self) -> bool {
        matches!(self, Self::Deploy)
    }
}

// --- Workflow stages ---

/// Named phase tracked independently within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StageName {
    Preparation,
    Execution,
    PodExecution,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparation => "Preparation",
            Self::Execution => "Execution",
            Self::PodExecution => "PodExecution",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Preparation" => Some(Self::Preparation),
            "Execution" => Some(Self::Execution),
            "PodExecution" => Some(Self::PodExecution),
            _ => None,
        }
    }
}

/// Whether a stage record tracks the workflow or the pod backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFor {
    Workflow,
    Pod,
}

impl StatusFor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Pod => "pod",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "workflow" => Some(Self::Workflow),
            "pod" => Some(Self::Pod),
            _ => None,
        }
    }
}

/// Normalized stage status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Aborted,
    Unknown,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Aborted => "ABORTED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "NOT_STARTED" => Self::NotStarted,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "TIMEOUT" => Self::Timeout,
            "ABORTED" => Self::Aborted,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Aborted
        )
    }
}

/// Pod phase as reported by the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Other(String),
}

impl PodPhase {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "error" => Self::Error,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Error => "Error",
            Self::Other(raw) => raw,
        }
    }
}

// --- Installed app deployment progress ---

/// Deployment mechanism for an installed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentAppType {
    #[serde(rename = "argo_cd")]
    GitOps,
    #[serde(rename = "helm")]
    Helm,
}

impl DeploymentAppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitOps => "argo_cd",
            Self::Helm => "helm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "argo_cd" => Some(Self::GitOps),
            "helm" => Some(Self::Helm),
            _ => None,
        }
    }
}

/// Externally visible deploy status of an installed app version.
///
/// Derived from [`DeployProgress`]; kept for clients that read the single
/// status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployStatus {
    #[serde(rename = "DEPLOY_INIT")]
    Init,
    Enqueued,
    #[serde(rename = "QUE_ERROR")]
    QueueError,
    GitError,
    GitSuccess,
    AcdError,
    AcdSuccess,
    DeploySuccess,
    HelmError,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "DEPLOY_INIT",
            Self::Enqueued => "ENQUEUED",
            Self::QueueError => "QUE_ERROR",
            Self::GitError => "GIT_ERROR",
            Self::GitSuccess => "GIT_SUCCESS",
            Self::AcdError => "ACD_ERROR",
            Self::AcdSuccess => "ACD_SUCCESS",
            Self::DeploySuccess => "DEPLOY_SUCCESS",
            Self::HelmError => "HELM_ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DEPLOY_INIT" => Some(Self::Init),
            "ENQUEUED" => Some(Self::Enqueued),
            "QUE_ERROR" => Some(Self::QueueError),
            "GIT_ERROR" => Some(Self::GitError),
            "GIT_SUCCESS" => Some(Self::GitSuccess),
            "ACD_ERROR" => Some(Self::AcdError),
            "ACD_SUCCESS" => Some(Self::AcdSuccess),
            "DEPLOY_SUCCESS" => Some(Self::DeploySuccess),
            "HELM_ERROR" => Some(Self::HelmError),
            _ => None,
        }
    }

    /// Reconstruct progress from a bare status value.
    pub fn progress(&self) -> DeployProgress {
        let (stage, last_error) = match self {
            Self::Init => (DeployStage::Init, None),
            Self::Enqueued => (DeployStage::Enqueued, None),
            Self::QueueError => (DeployStage::Init, Some(DeployErrorKind::Queue)),
            Self::GitError => (DeployStage::Enqueued, Some(DeployErrorKind::Git)),
            Self::GitSuccess => (DeployStage::GitCommitted, None),
            Self::AcdError => (DeployStage::GitCommitted, Some(DeployErrorKind::Acd)),
            Self::AcdSuccess => (DeployStage::Synced, None),
            Self::DeploySuccess => (DeployStage::Deployed, None),
            Self::HelmError => (DeployStage::Init, Some(DeployErrorKind::Helm)),
        };
        DeployProgress { stage, last_error }
    }
}

/// Last completed stage of the deploy sequence. Ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Init,
    Enqueued,
    GitCommitted,
    Synced,
    Deployed,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Enqueued => "enqueued",
            Self::GitCommitted => "git_committed",
            Self::Synced => "synced",
            Self::Deployed => "deployed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "init" => Some(Self::Init),
            "enqueued" => Some(Self::Enqueued),
            "git_committed" => Some(Self::GitCommitted),
            "synced" => Some(Self::Synced),
            "deployed" => Some(Self::Deployed),
            _ => None,
        }
    }
}

/// Classification of the last external failure of a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployErrorKind {
    Queue,
    Git,
    Acd,
    Helm,
}

impl DeployErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Git => "git",
            Self::Acd => "acd",
            Self::Helm => "helm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queue" => Some(Self::Queue),
            "git" => Some(Self::Git),
            "acd" => Some(Self::Acd),
            "helm" => Some(Self::Helm),
            _ => None,
        }
    }
}

/// Resumable progress of one installed app version through the deploy sequence.
///
/// `stage` is the last stage that completed; `last_error` is the kind of the
/// most recent failure, cleared whenever a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployProgress {
    pub stage: DeployStage,
    pub last_error: Option<DeployErrorKind>,
}

impl Default for DeployProgress {
    fn default() -> Self {
        Self {
            stage: DeployStage::Init,
            last_error: None,
        }
    }
}

impl DeployProgress {
    pub fn status(&self) -> DeployStatus {
        match self.last_error {
            Some(DeployErrorKind::Queue) => DeployStatus::QueueError,
            Some(DeployErrorKind::Git) => DeployStatus::GitError,
            Some(DeployErrorKind::Acd) => DeployStatus::AcdError,
            Some(DeployErrorKind::Helm) => DeployStatus::HelmError,
            None => match self.stage {
                DeployStage::Init => DeployStatus::Init,
                DeployStage::Enqueued => DeployStatus::Enqueued,
                DeployStage::GitCommitted => DeployStatus::GitSuccess,
                DeployStage::Synced => DeployStatus::AcdSuccess,
                DeployStage::Deployed => DeployStatus::DeploySuccess,
            },
        }
    }

    /// The git commit stage may (re-)run only before it has completed.
    pub fn needs_git_stage(&self) -> bool {
        self.stage < DeployStage::GitCommitted
    }

    /// The GitOps sync stage may (re-)run only before it has completed.
    pub fn needs_sync_stage(&self) -> bool {
        self.stage < DeployStage::Synced
    }

    /// Only versions that never left the queue may be (re-)enqueued.
    pub fn can_enqueue(&self) -> bool {
        self.stage <= DeployStage::Enqueued
            && matches!(self.last_error, None | Some(DeployErrorKind::Queue))
    }

    pub fn completed(self, stage: DeployStage) -> Self {
        Self {
            stage: stage.max(self.stage),
            last_error: None,
        }
    }

    pub fn failed(self, kind: DeployErrorKind) -> Self {
        Self {
            stage: self.stage,
            last_error: Some(kind),
        }
    }
}

/// What a deploy-type run does to the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    #[default]
    Deploy,
    /// Scale the application down (hibernate).
    Stop,
    /// Scale a hibernated application back up.
    Start,
}

impl ReleaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Stop => "stop",
            Self::Start => "start",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "start" => Self::Start,
            _ => Self::Deploy,
        }
    }
}

// --- Records ---

/// One attempt to execute a pipeline's pre/deploy/post workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    pub id: Id,
    pub pipeline_id: i64,
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub release_kind: ReleaseKind,
    /// Workflow name as known to the workflow engine.
    pub name: String,
    pub status: RunStatus,
    pub pod_status: Option<String>,
    pub pod_name: Option<String>,
    pub message: Option<String>,
    /// Idempotency key of the message that triggered this run.
    pub reference_id: Option<String>,
    pub triggered_by: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: i32,
}

impl DeploymentRun {
    /// Build a fresh run for a pipeline, stamped with the current time.
    pub fn new(
        pipeline_id: i64,
        workflow_type: WorkflowType,
        name: impl Into<String>,
        status: RunStatus,
        triggered_by: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            pipeline_id,
            workflow_type,
            release_kind: ReleaseKind::Deploy,
            name: name.into(),
            status,
            pod_status: None,
            pod_name: None,
            message: None,
            reference_id: None,
            triggered_by,
            started_at: now,
            finished_at: None,
            created_at: now,
            updated_at: now,
            updated_by: triggered_by,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-stage status record belonging to exactly one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStage {
    pub id: Id,
    pub run_id: Id,
    pub workflow_type: WorkflowType,
    pub stage_name: StageName,
    pub status_for: StatusFor,
    pub status: StageStatus,
    pub message: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// JSON metadata, e.g. `{"podName": "..."}`.
    pub metadata: Option<String>,
}

/// Target pipeline of deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub app_id: i64,
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub namespace: String,
    pub cluster_id: i64,
    pub deployment_app_name: String,
    pub deployment_app_type: DeploymentAppType,
    /// Whether the deployment app (Argo application or Helm release) exists.
    pub deployment_app_created: bool,
}

/// Git coordinates of a rendered chart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartGitAttribute {
    pub repo_url: String,
    pub target_revision: String,
    pub chart_location: String,
}

/// One installed chart version being advanced through the deploy sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledAppVersion {
    pub id: Id,
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub namespace: String,
    pub deployment_app_type: DeploymentAppType,
    pub chart_repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    pub values_override_yaml: String,
    pub progress: DeployProgress,
    pub git_hash: Option<String>,
    pub gitops_repo_url: Option<String>,
    pub target_revision: Option<String>,
    pub user_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstalledAppVersion {
    /// Name of the Argo CD application / Helm release.
    pub fn deployment_app_name(&self) -> String {
        format!("{}-{}", self.app_name, self.environment_name)
    }

    pub fn status(&self) -> DeployStatus {
        self.progress.status()
    }

    /// Git attributes recorded by a previous, completed git stage.
    pub fn stored_git_attribute(&self) -> ChartGitAttribute {
        ChartGitAttribute {
            repo_url: self.gitops_repo_url.clone().unwrap_or_default(),
            target_revision: self
                .target_revision
                .clone()
                .unwrap_or_else(|| "HEAD".to_string()),
            chart_location: self.deployment_app_name(),
        }
    }
}

/// History record of one deploy request for an installed app version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledAppVersionHistory {
    pub id: Id,
    pub version_id: Id,
    pub git_hash: Option<String>,
    pub created_by: i32,
    pub created_at: DateTime<Utc>,
}

/// Component of a deployed configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigComponent {
    DeploymentTemplate,
    ConfigMap,
    Secret,
    Strategy,
}

impl ConfigComponent {
    pub const ALL: [ConfigComponent; 4] = [
        Self::DeploymentTemplate,
        Self::ConfigMap,
        Self::Secret,
        Self::Strategy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentTemplate => "deployment_template",
            Self::ConfigMap => "config_map",
            Self::Secret => "secret",
            Self::Strategy => "strategy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

/// Snapshot of one configuration component as deployed at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigHistory {
    pub id: Id,
    pub pipeline_id: i64,
    pub component: ConfigComponent,
    /// Opaque JSON document.
    pub snapshot: String,
    pub run_id: Option<Id>,
    pub deployed_on: DateTime<Utc>,
    pub deployed_by: i32,
}

/// Last reconciled health of a deployed application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub app_id: i64,
    pub environment_id: i64,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Deploy request carried by the trigger queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTrigger {
    pub version_id: Id,
    pub history_id: Id,
    pub user_id: i32,
    /// Run this deploy belongs to. On success the run is stamped with the
    /// message id, which is what the duplicate-trigger guard looks up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Id>,
}

/// At-least-once message envelope around a deploy trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMessage {
    /// Idempotency key; stamped into `DeploymentRun::reference_id` once the
    /// deploy stage of the trigger's run succeeds.
    pub msg_id: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub deliver_count: u32,
    pub payload: DeployTrigger,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_parse_is_case_insensitive() {
        assert_eq!(RunStatus::parse("running"), RunStatus::Running);
        assert_eq!(RunStatus::parse("SUCCEEDED"), RunStatus::Succeeded);
        assert_eq!(RunStatus::parse("CANCELLED"), RunStatus::Cancelled);
        assert_eq!(RunStatus::parse("Timeout"), RunStatus::TimedOut);
        assert_eq!(RunStatus::parse("whatever"), RunStatus::Unknown);
    }

    #[test]
    fn run_status_terminal_set() {
        assert!(RunStatus::Healthy.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Progressing.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Unknown.is_terminal());
    }

    #[test]
    fn run_status_serializes_as_str() {
        for status in [RunStatus::WaitingToStart, RunStatus::TimedOut, RunStatus::Healthy] {
            assert_eq!(
                serde_json::to_string(&status).unwrap(),
                format!("\"{}\"", status.as_str())
            );
        }
    }

    #[test]
    fn stage_status_terminal_set() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Timeout.is_terminal());
        assert!(!StageStatus::Unknown.is_terminal());
        assert!(!StageStatus::NotStarted.is_terminal());
    }

    #[test]
    fn pod_phase_keeps_unrecognized_value() {
        assert_eq!(PodPhase::parse("Pending"), PodPhase::Pending);
        assert_eq!(PodPhase::parse("error"), PodPhase::Error);
        let other = PodPhase::parse("Evicted");
        assert_eq!(other.as_str(), "Evicted");
    }

    #[test]
    fn git_stage_gating_matches_legacy_statuses() {
        let git_allowed = [
            DeployStatus::Init,
            DeployStatus::Enqueued,
            DeployStatus::QueueError,
            DeployStatus::GitError,
        ];
        for status in git_allowed {
            assert!(status.progress().needs_git_stage(), "{}", status.as_str());
        }
        for status in [
            DeployStatus::GitSuccess,
            DeployStatus::AcdError,
            DeployStatus::AcdSuccess,
            DeployStatus::DeploySuccess,
        ] {
            assert!(!status.progress().needs_git_stage(), "{}", status.as_str());
        }
    }

    #[test]
    fn sync_stage_gating_matches_legacy_statuses() {
        for status in [
            DeployStatus::Init,
            DeployStatus::Enqueued,
            DeployStatus::QueueError,
            DeployStatus::GitError,
            DeployStatus::GitSuccess,
            DeployStatus::AcdError,
        ] {
            assert!(status.progress().needs_sync_stage(), "{}", status.as_str());
        }
        assert!(!DeployStatus::AcdSuccess.progress().needs_sync_stage());
        assert!(!DeployStatus::DeploySuccess.progress().needs_sync_stage());
    }

    #[test]
    fn progress_round_trips_through_status() {
        for status in [
            DeployStatus::Init,
            DeployStatus::Enqueued,
            DeployStatus::QueueError,
            DeployStatus::GitError,
            DeployStatus::GitSuccess,
            DeployStatus::AcdError,
            DeployStatus::AcdSuccess,
            DeployStatus::DeploySuccess,
            DeployStatus::HelmError,
        ] {
            assert_eq!(status.progress().status(), status);
        }
    }

    #[test]
    fn completing_a_stage_clears_the_error() {
        let progress = DeployStatus::AcdError.progress();
        let done = progress.completed(DeployStage::Synced);
        assert_eq!(done.status(), DeployStatus::AcdSuccess);
        assert!(done.last_error.is_none());
    }

    #[test]
    fn completed_never_moves_backwards() {
        let progress = DeployStatus::GitSuccess.progress();
        let done = progress.completed(DeployStage::Enqueued);
        assert_eq!(done.stage, DeployStage::GitCommitted);
    }

    #[test]
    fn only_queued_versions_can_be_enqueued() {
        assert!(DeployStatus::Init.progress().can_enqueue());
        assert!(DeployStatus::QueueError.progress().can_enqueue());
        assert!(DeployStatus::Enqueued.progress().can_enqueue());
        assert!(!DeployStatus::GitError.progress().can_enqueue());
        assert!(!DeployStatus::GitSuccess.progress().can_enqueue());
    }

    #[test]
    fn config_component_parse() {
        for component in ConfigComponent::ALL {
            assert_eq!(ConfigComponent::parse(component.as_str()), Some(component));
        }
        assert_eq!(ConfigComponent::parse("chart"), None);
    }

    #[test]
    fn deployment_app_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&DeploymentAppType::GitOps).unwrap(),
            "\"argo_cd\""
        );
        assert_eq!(
            serde_json::to_string(&DeploymentAppType::Helm).unwrap(),
            "\"helm\""
        );
    }
}
