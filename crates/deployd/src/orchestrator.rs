//! Deploy stage orchestrator.
//!
//! Advances one installed app version through DB -> Git commit -> GitOps
//! sync (or a direct Helm install). Progress is persisted after every stage
//! as a (last completed stage, last error) pair, and a re-invocation resumes
//! after the last completed stage. The orchestrator never retries by itself;
//! redelivery of the trigger message re-enters it.

use crate::advisory::AdvisoryResultExt;
use crate::cluster::{ClusterError, HelmClient, SyncClient};
use crate::gitops::{GitOpsClient, GitOpsError};
use crate::scheduler::{SchedulerError, TriggerQueue};
use crate::storage::{Storage, StorageError};
use crate::timeline::{TimelineError, TimelineRecorder};
use deploy_core::{
    ChartGitAttribute, DeployErrorKind, DeployProgress, DeployStage, DeployTrigger,
    DeploymentAppType, Id, InstalledAppVersion, TimelineStatus,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("git stage failed: {0}")]
    Git(#[source] GitOpsError),
    #[error("sync stage failed: {0}")]
    Sync(#[source] ClusterError),
    #[error("helm install failed: {0}")]
    Helm(#[source] ClusterError),
    #[error("enqueue failed: {0}")]
    Queue(#[source] SchedulerError),
}

impl DeployError {
    /// The error kind persisted on the version before this error was returned.
    pub fn kind(&self) -> Option<DeployErrorKind> {
        match self {
            Self::Git(_) => Some(DeployErrorKind::Git),
            Self::Sync(_) => Some(DeployErrorKind::Acd),
            Self::Helm(_) => Some(DeployErrorKind::Helm),
            Self::Queue(_) => Some(DeployErrorKind::Queue),
            Self::Storage(_) | Self::Timeline(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

/// Outcome of enqueueing one version.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnqueueResult {
    pub version_id: Id,
    pub msg_id: Option<String>,
    pub progress: DeployProgress,
}

pub struct DeployOrchestrator {
    storage: Arc<Storage>,
    timelines: TimelineRecorder,
    gitops: Arc<dyn GitOpsClient>,
    sync: Arc<dyn SyncClient>,
    helm: Arc<dyn HelmClient>,
    manual_sync: bool,
}

impl DeployOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        timelines: TimelineRecorder,
        gitops: Arc<dyn GitOpsClient>,
        sync: Arc<dyn SyncClient>,
        helm: Arc<dyn HelmClient>,
        manual_sync: bool,
    ) -> Self {
        Self {
            storage,
            timelines,
            gitops,
            sync,
            helm,
            manual_sync,
        }
    }

    /// Run the remaining stages of `version_id`.
    pub async fn perform_deploy_stage(
        &self,
        version_id: &Id,
        history_id: &Id,
        user_id: i32,
    ) -> Result<InstalledAppVersion> {
        let mut version = self.storage.get_app_version(version_id).await?;
        tracing::info!(
            version_id = %version.id,
            app = %version.deployment_app_name(),
            status = version.status().as_str(),
            "performing deploy stage"
        );

        match version.deployment_app_type {
            DeploymentAppType::GitOps => {
                let initiated = self.timelines.new_app_history_entry(
                    history_id,
                    TimelineStatus::DeploymentInitiated,
                    None,
                    version.user_id,
                );
                self.timelines
                    .save(initiated)
                    .await
                    .advisory("record deployment initiated timeline");
                self.deploy_on_gitops(&mut version, history_id, user_id)
                    .await?;
            }
            DeploymentAppType::Helm => {
                if let Err(e) = self.helm.install(&version).await {
                    tracing::error!(version_id = %version.id, error = %e, "helm install failed");
                    self.fail_stage(&mut version, DeployErrorKind::Helm)
                        .await?;
                    let failed = self.timelines.new_app_history_entry(
                        history_id,
                        TimelineStatus::HelmInstallFailed,
                        Some(format!("Helm install failed - {e}")),
                        user_id,
                    );
                    self.timelines
                        .save(failed)
                        .await
                        .advisory("record helm install failed timeline");
                    return Err(DeployError::Helm(e));
                }
            }
        }

        self.complete_stage(&mut version, DeployStage::Deployed)
            .await?;
        tracing::info!(version_id = %version.id, "deployment completed");
        Ok(version)
    }

    async fn deploy_on_gitops(
        &self,
        version: &mut InstalledAppVersion,
        history_id: &Id,
        user_id: i32,
    ) -> Result<()> {
        let attribute = if version.progress.needs_git_stage() {
            self.git_stage(version, history_id, user_id).await?
        } else {
            tracing::info!(
                version_id = %version.id,
                status = version.status().as_str(),
                "git stage already done, reusing stored attributes"
            );
            version.stored_git_attribute()
        };

        if version.progress.needs_sync_stage() {
            if let Err(e) = self.sync.install_or_sync(version, &attribute).await {
                tracing::error!(version_id = %version.id, error = %e, "gitops sync failed");
                self.fail_stage(version, DeployErrorKind::Acd)
                    .await?;
                return Err(DeployError::Sync(e));
            }
            tracing::info!(version_id = %version.id, revision = %attribute.target_revision, "gitops sync done");
            self.complete_stage(version, DeployStage::Synced)
                .await?;
        }
        Ok(())
    }

    async fn git_stage(
        &self,
        version: &mut InstalledAppVersion,
        history_id: &Id,
        user_id: i32,
    ) -> Result<ChartGitAttribute> {
        let committed = match self.gitops.ensure_repo_secret(version).await {
            Ok(()) => self.gitops.generate_manifest_and_commit(version).await,
            Err(e) => Err(e),
        };
        let commit = match committed {
            Ok(commit) => commit,
            Err(e) => {
                tracing::error!(version_id = %version.id, error = %e, "git stage failed");
                self.fail_stage(version, DeployErrorKind::Git)
                    .await?;
                let failed = self.timelines.new_app_history_entry(
                    history_id,
                    TimelineStatus::GitCommitFailed,
                    Some(format!("Git commit failed - {e}")),
                    version.user_id,
                );
                self.timelines
                    .save(failed)
                    .await
                    .advisory("record git commit failed timeline");
                return Err(DeployError::Git(e));
            }
        };
        tracing::info!(version_id = %version.id, git_hash = %commit.commit_hash, "git commit done");

        let mut entries = vec![self.timelines.new_app_history_entry(
            history_id,
            TimelineStatus::GitCommit,
            None,
            user_id,
        )];
        if self.manual_sync {
            entries.push(self.timelines.new_app_history_entry(
                history_id,
                TimelineStatus::ArgocdSyncInitiated,
                None,
                user_id,
            ));
        }

        let progress = version.progress.completed(DeployStage::GitCommitted);
        let attribute = commit.attribute;
        let mut tx = self.storage.begin().await?;
        self.storage
            .update_deploy_progress_with(&mut tx, &version.id, progress)
            .await?;
        self.storage
            .update_version_git(
                &mut tx,
                &version.id,
                &commit.commit_hash,
                &attribute.repo_url,
                &attribute.target_revision,
            )
            .await?;
        self.storage
            .update_history_git_hash(&mut tx, history_id, &commit.commit_hash)
            .await?;
        self.timelines
            .save_timelines_if_not_present(&mut tx, entries)
            .await?;
        tx.commit().await.map_err(StorageError::from)?;

        version.progress = progress;
        version.git_hash = Some(commit.commit_hash);
        version.gitops_repo_url = Some(attribute.repo_url.clone());
        version.target_revision = Some(attribute.target_revision.clone());
        Ok(attribute)
    }

    async fn complete_stage(
        &self,
        version: &mut InstalledAppVersion,
        stage: DeployStage,
    ) -> Result<()> {
        let progress = version.progress.completed(stage);
        self.record_progress(version, progress).await
    }

    async fn fail_stage(&self, version: &mut InstalledAppVersion, kind: DeployErrorKind) -> Result<()> {
        let progress = version.progress.failed(kind);
        self.record_progress(version, progress).await
    }

    async fn record_progress(
        &self,
        version: &mut InstalledAppVersion,
        progress: DeployProgress,
    ) -> Result<()> {
        self.storage
            .update_deploy_progress(&version.id, progress)
            .await?;
        version.progress = progress;
        tracing::debug!(
            version_id = %version.id,
            stage = progress.stage.as_str(),
            status = progress.status().as_str(),
            "deploy progress recorded"
        );
        Ok(())
    }

    /// Publish a deploy trigger for each version that has not passed the
    /// enqueue stage yet. Versions further along are skipped.
    pub async fn enqueue_deployments(
        &self,
        queue: &TriggerQueue,
        triggers: Vec<DeployTrigger>,
    ) -> Result<Vec<EnqueueResult>> {
        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let mut version = self.storage.get_app_version(&trigger.version_id).await?;
            if !version.progress.can_enqueue() {
                tracing::debug!(
                    version_id = %version.id,
                    status = version.status().as_str(),
                    "version past enqueue stage, skipping"
                );
                results.push(EnqueueResult {
                    version_id: version.id,
                    msg_id: None,
                    progress: version.progress,
                });
                continue;
            }

            // Progress is written before publishing so a fast consumer never
            // sees the version in Init.
            self.complete_stage(&mut version, DeployStage::Enqueued)
                .await?;
            match queue.publish(trigger) {
                Ok(msg_id) => results.push(EnqueueResult {
                    version_id: version.id,
                    msg_id: Some(msg_id),
                    progress: version.progress,
                }),
                Err(e) => {
                    tracing::error!(version_id = %version.id, error = %e, "failed to enqueue deployment");
                    self.fail_stage(&mut version, DeployErrorKind::Queue)
                        .await?;
                    results.push(EnqueueResult {
                        version_id: version.id,
                        msg_id: None,
                        progress: version.progress,
                    });
                }
            }
        }
        Ok(results)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeGitOps;
    use super::*;
    use crate::cluster::test_support::FakeDeployer;
    use crate::scheduler::trigger_queue;
    use crate::storage::test_support::test_version;
    use chrono::Utc;
    use deploy_core::{DeployStatus, InstalledAppVersionHistory, TimelineEntry, TimelineOwner};
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        gitops: Arc<FakeGitOps>,
        deployer: Arc<FakeDeployer>,
        orchestrator: DeployOrchestrator,
        _dir: TempDir,
    }

    async fn fixture(gitops: FakeGitOps, deployer: FakeDeployer, manual_sync: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let gitops = Arc::new(gitops);
        let deployer = Arc::new(deployer);
        let orchestrator = DeployOrchestrator::new(
            storage.clone(),
            TimelineRecorder::new(storage.clone(), 255),
            gitops.clone(),
            deployer.clone(),
            deployer.clone(),
            manual_sync,
        );
        Fixture {
            storage,
            gitops,
            deployer,
            orchestrator,
            _dir: dir,
        }
    }

    async fn seed(
        storage: &Storage,
        app_type: DeploymentAppType,
        status: DeployStatus,
    ) -> (InstalledAppVersion, Id) {
        let mut version = test_version(app_type, status.progress());
        if status.progress().stage >= DeployStage::GitCommitted {
            version.git_hash = Some("f".repeat(40));
            version.gitops_repo_url = Some("https://git.example.com/gitops.git".to_string());
            version.target_revision = Some("main".to_string());
        }
        storage.insert_app_version(&version).await.unwrap();
        let history = InstalledAppVersionHistory {
            id: Id::new(),
            version_id: version.id.clone(),
            git_hash: None,
            created_by: 1,
            created_at: Utc::now(),
        };
        storage.insert_app_version_history(&history).await.unwrap();
        (version, history.id)
    }

    async fn history_timeline(storage: &Storage, history_id: &Id) -> Vec<TimelineEntry> {
        storage
            .list_timelines(&TimelineOwner::AppHistory(history_id.clone()))
            .await
            .unwrap()
    }

    fn count(entries: &[TimelineEntry], status: TimelineStatus) -> usize {
        entries.iter().filter(|e| e.status == status).count()
    }

    #[tokio::test]
    async fn git_failure_persists_git_error_and_skips_sync() {
        let f = fixture(FakeGitOps::failing("remote rejected"), FakeDeployer::default(), false).await;
        let (version, history_id) = seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::Init).await;

        let err = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Git(_)));
        assert_eq!(err.kind(), Some(DeployErrorKind::Git));

        let stored = f.storage.get_app_version(&version.id).await.unwrap();
        assert_eq!(stored.status(), DeployStatus::GitError);
        assert!(stored.git_hash.is_none());
        assert_eq!(f.deployer.calls(), 0);

        let timeline = history_timeline(&f.storage, &history_id).await;
        assert_eq!(count(&timeline, TimelineStatus::GitCommitFailed), 1);
        assert_eq!(count(&timeline, TimelineStatus::GitCommit), 0);
        let failed = timeline
            .iter()
            .find(|e| e.status == TimelineStatus::GitCommitFailed)
            .unwrap();
        assert!(failed.status_detail.starts_with("Git commit failed - "));
        assert!(failed.status_detail.contains("remote rejected"));
    }

    #[tokio::test]
    async fn git_success_state_skips_git_and_syncs() {
        let f = fixture(FakeGitOps::default(), FakeDeployer::default(), false).await;
        let (version, history_id) =
            seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::GitSuccess).await;

        let deployed = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap();

        assert_eq!(deployed.status(), DeployStatus::DeploySuccess);
        assert_eq!(f.gitops.commits(), 0);
        assert_eq!(f.deployer.calls(), 1);
        let stored = f.storage.get_app_version(&version.id).await.unwrap();
        assert_eq!(stored.status(), DeployStatus::DeploySuccess);
        assert_eq!(stored.git_hash.as_deref(), Some("f".repeat(40).as_str()));

        let timeline = history_timeline(&f.storage, &history_id).await;
        assert_eq!(count(&timeline, TimelineStatus::GitCommit), 0);
        assert_eq!(count(&timeline, TimelineStatus::DeploymentInitiated), 1);
    }

    #[tokio::test]
    async fn resumes_after_sync_failure_without_recommitting() {
        let f = fixture(
            FakeGitOps::default(),
            FakeDeployer::failing("argocd unreachable"),
            true,
        )
        .await;
        let (version, history_id) = seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::Init).await;

        let err = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(DeployErrorKind::Acd));
        let stored = f.storage.get_app_version(&version.id).await.unwrap();
        assert_eq!(stored.status(), DeployStatus::AcdError);
        assert_eq!(stored.git_hash.as_deref(), Some(format!("{:040x}", 1).as_str()));
        assert_eq!(stored.target_revision.as_deref(), Some("main"));
        let history = f.storage.get_app_version_history(&history_id).await.unwrap();
        assert_eq!(history.git_hash, stored.git_hash);

        f.deployer.heal();
        let deployed = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap();
        assert_eq!(deployed.status(), DeployStatus::DeploySuccess);
        assert_eq!(f.gitops.commits(), 1);
        assert_eq!(f.deployer.calls(), 2);

        let timeline = history_timeline(&f.storage, &history_id).await;
        assert_eq!(count(&timeline, TimelineStatus::GitCommit), 1);
        assert_eq!(count(&timeline, TimelineStatus::ArgocdSyncInitiated), 1);
        assert_eq!(count(&timeline, TimelineStatus::ArgocdSyncCompleted), 0);
        assert_eq!(count(&timeline, TimelineStatus::DeploymentInitiated), 2);
    }

    #[tokio::test]
    async fn git_retry_after_failure_commits_once() {
        let f = fixture(FakeGitOps::failing("lock held"), FakeDeployer::default(), false).await;
        let (version, history_id) = seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::Init).await;

        assert!(f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .is_err());
        f.gitops.heal();
        f.orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap();
        // Already deployed: nothing runs again.
        f.orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap();

        assert_eq!(f.gitops.commits(), 2);
        assert_eq!(f.deployer.calls(), 1);
        let timeline = history_timeline(&f.storage, &history_id).await;
        assert_eq!(count(&timeline, TimelineStatus::GitCommit), 1);
        assert_eq!(count(&timeline, TimelineStatus::GitCommitFailed), 1);
    }

    #[tokio::test]
    async fn helm_failure_persists_helm_error() {
        let f = fixture(FakeGitOps::default(), FakeDeployer::failing("chart not found"), false).await;
        let (version, history_id) = seed(&f.storage, DeploymentAppType::Helm, DeployStatus::Init).await;

        let err = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Helm(_)));
        let stored = f.storage.get_app_version(&version.id).await.unwrap();
        assert_eq!(stored.status(), DeployStatus::HelmError);
        assert_eq!(f.gitops.commits(), 0);

        let timeline = history_timeline(&f.storage, &history_id).await;
        assert_eq!(count(&timeline, TimelineStatus::HelmInstallFailed), 1);
        assert_eq!(count(&timeline, TimelineStatus::DeploymentInitiated), 0);

        f.deployer.heal();
        let deployed = f
            .orchestrator
            .perform_deploy_stage(&version.id, &history_id, 1)
            .await
            .unwrap();
        assert_eq!(deployed.status(), DeployStatus::DeploySuccess);
    }

    #[tokio::test]
    async fn missing_version_is_not_found() {
        let f = fixture(FakeGitOps::default(), FakeDeployer::default(), false).await;
        let err = f
            .orchestrator
            .perform_deploy_stage(&Id::new(), &Id::new(), 1)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.kind(), None);
    }

    #[tokio::test]
    async fn enqueue_marks_versions_and_skips_progressed_ones() {
        let f = fixture(FakeGitOps::default(), FakeDeployer::default(), false).await;
        let (fresh, fresh_history) =
            seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::Init).await;
        let (done, done_history) =
            seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::GitSuccess).await;
        let (queue, mut rx) = trigger_queue(4);

        let results = f
            .orchestrator
            .enqueue_deployments(
                &queue,
                vec![
                    DeployTrigger {
                        version_id: fresh.id.clone(),
                        history_id: fresh_history,
                        user_id: 1,
                        run_id: None,
                    },
                    DeployTrigger {
                        version_id: done.id.clone(),
                        history_id: done_history,
                        user_id: 1,
                        run_id: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert!(results[0].msg_id.is_some());
        assert_eq!(results[0].progress.status(), DeployStatus::Enqueued);
        assert!(results[1].msg_id.is_none());
        assert_eq!(
            f.storage.get_app_version(&done.id).await.unwrap().status(),
            DeployStatus::GitSuccess
        );

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.version_id, fresh.id);
        assert_eq!(msg.deliver_count, 1);
    }

    #[tokio::test]
    async fn enqueue_on_closed_queue_records_queue_error() {
        let f = fixture(FakeGitOps::default(), FakeDeployer::default(), false).await;
        let (version, history_id) =
            seed(&f.storage, DeploymentAppType::GitOps, DeployStatus::Init).await;
        let (queue, rx) = trigger_queue(4);
        drop(rx);

        let results = f
            .orchestrator
            .enqueue_deployments(
                &queue,
                vec![DeployTrigger {
                    version_id: version.id.clone(),
                    history_id,
                    user_id: 1,
                    run_id: None,
                }],
            )
            .await
            .unwrap();
        assert!(results[0].msg_id.is_none());
        assert_eq!(
            f.storage.get_app_version(&version.id).await.unwrap().status(),
            DeployStatus::QueueError
        );
    }
}
