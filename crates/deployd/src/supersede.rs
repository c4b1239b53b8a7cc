//! Deployment supersession and run failure handling.
//!
//! Only the most recently triggered deployment of a pipeline may finish
//! successfully. When a new deploy run starts, every older in-flight run is
//! fenced by marking it failed with [`DEPLOYMENT_SUPERSEDED`]. This module
//! also owns the terminal/non-terminal write guards for runs and the
//! duplicate-trigger predicate of the inbound queue.

use crate::advisory::AdvisoryResultExt;
use crate::metrics::{DeploymentMetric, MetricsSink};
use crate::storage::{Storage, StorageError};
use crate::timeline::{TimelineError, TimelineRecorder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deploy_core::{DeploymentRun, Id, RunStatus, TriggerMessage};
use std::sync::Arc;
use thiserror::Error;

/// Message written on runs fenced by a newer deployment.
pub const DEPLOYMENT_SUPERSEDED: &str = "deployment superseded";

#[derive(Debug, Error)]
pub enum SupersessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("unsupported status {0} for update operation")]
    UnsupportedOperation(RunStatus),
    #[error("deployment superseded")]
    Superseded,
}

impl SupersessionError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

pub type Result<T> = std::result::Result<T, SupersessionError>;

/// A release failure reported by a caller, carrying the client-facing message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ReleaseError(pub String);

/// Whether `err` (or anything in its source chain) is the supersession sentinel.
pub fn is_superseded_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<SupersessionError>()
            .is_some_and(SupersessionError::is_superseded)
        {
            return true;
        }
        current = e.source();
    }
    false
}

pub struct SupersessionManager {
    storage: Arc<Storage>,
    timelines: TimelineRecorder,
    metrics: Arc<dyn MetricsSink>,
    expose_metrics: bool,
}

impl SupersessionManager {
    pub fn new(
        storage: Arc<Storage>,
        timelines: TimelineRecorder,
        metrics: Arc<dyn MetricsSink>,
        expose_metrics: bool,
    ) -> Self {
        Self {
            storage,
            timelines,
            metrics,
            expose_metrics,
        }
    }

    /// Fail every older non-terminal deploy run of `pipeline_id`.
    ///
    /// Run updates and superseded timelines are written in one transaction.
    /// Returns the ids of the fenced runs.
    pub async fn supersede_previous_deployments(
        &self,
        current_run_id: &Id,
        pipeline_id: i64,
        triggered_at: DateTime<Utc>,
        triggered_by: i32,
    ) -> Result<Vec<Id>> {
        let mut tx = self.storage.begin().await?;
        let current = self.storage.get_run_with(&mut tx, current_run_id).await?;
        let mut previous = self
            .storage
            .find_previous_runs_excluding_status(
                &mut tx,
                pipeline_id,
                &current,
                &RunStatus::TERMINAL,
            )
            .await?;

        if previous.is_empty() {
            tracing::info!(run_id = %current_run_id, pipeline_id, "no previous in-flight runs");
            return Ok(Vec::new());
        }

        let now = Utc::now();
        for run in &mut previous {
            tracing::info!(
                run_id = %run.id,
                previous_status = run.status.as_str(),
                superseded_by = %current_run_id,
                "superseding run"
            );
            run.status = RunStatus::Failed;
            run.message = Some(DEPLOYMENT_SUPERSEDED.to_string());
            run.finished_at = Some(triggered_at);
            run.updated_at = now;
            run.updated_by = triggered_by;
        }

        self.storage.update_runs(&mut tx, &previous).await?;
        for run in &previous {
            self.timelines
                .mark_superseded(&mut tx, &run.id, triggered_by)
                .await?;
        }
        tx.commit().await.map_err(StorageError::from)?;

        Ok(previous.into_iter().map(|r| r.id).collect())
    }

    /// Fail older deploy runs that are still queued, emitting a metric for each.
    pub async fn update_previous_queued_runner_status(
        &self,
        current_run_id: &Id,
        pipeline_id: i64,
        triggered_by: i32,
    ) -> Result<Vec<Id>> {
        let current = self.storage.get_run(current_run_id).await?;
        let queued = self.storage.find_queued_runs(pipeline_id, &current).await?;
        if queued.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.storage.acquire().await?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(queued.len());
        for mut run in queued {
            self.timelines
                .mark_superseded(&mut conn, &run.id, triggered_by)
                .await?;
            run.status = RunStatus::Failed;
            run.message = Some(DEPLOYMENT_SUPERSEDED.to_string());
            run.finished_at = Some(now);
            self.emit_metric(&run).await;
            ids.push(run.id);
        }
        drop(conn);

        self.storage
            .update_runs_to_failed_for_ids(&ids, DEPLOYMENT_SUPERSEDED, triggered_by)
            .await?;
        tracing::info!(pipeline_id, count = ids.len(), "superseded queued runs");
        Ok(ids)
    }

    pub async fn mark_deployment_failed_for_runner_id(
        &self,
        run_id: &Id,
        err: &(dyn std::error::Error + Send + Sync + 'static),
        triggered_by: i32,
    ) -> Result<DeploymentRun> {
        let mut run = self.storage.get_run(run_id).await?;
        self.mark_current_deployment_failed(&mut run, err, triggered_by)
            .await?;
        Ok(run)
    }

    /// Fail `run` with `err`. A run that is already terminal is left untouched.
    pub async fn mark_current_deployment_failed(
        &self,
        run: &mut DeploymentRun,
        err: &(dyn std::error::Error + Send + Sync + 'static),
        triggered_by: i32,
    ) -> Result<()> {
        if run.is_terminal() {
            tracing::info!(run_id = %run.id, status = run.status.as_str(), "run already terminal");
            return Ok(());
        }

        let message = err.to_string();
        tracing::error!(run_id = %run.id, error = %message, "deployment failed, marking run");
        let now = Utc::now();
        run.status = RunStatus::Failed;
        run.message = Some(message.clone());
        run.finished_at = Some(now);
        run.updated_at = now;
        run.updated_by = triggered_by;

        let mut tx = self.storage.begin().await?;
        if !self.storage.update_run_if_not_terminal(&mut tx, run).await? {
            drop(tx);
            *run = self.storage.get_run(&run.id).await?;
            tracing::info!(
                run_id = %run.id,
                status = run.status.as_str(),
                "run terminated concurrently, failure not recorded"
            );
            return Ok(());
        }
        if run.workflow_type.is_deploy() {
            if is_superseded_error(err) {
                self.timelines
                    .mark_superseded(&mut tx, &run.id, triggered_by)
                    .await?;
            } else {
                self.timelines
                    .mark_failed(&mut tx, &run.id, &message, triggered_by)
                    .await?;
            }
        }
        tx.commit().await.map_err(StorageError::from)?;

        if run.workflow_type.is_deploy() {
            self.emit_metric(run).await;
        }
        Ok(())
    }

    /// Write a non-terminal status. Terminal targets are rejected; a run that
    /// is already terminal is left untouched.
    pub async fn update_non_terminal_status_in_runner(
        &self,
        run_id: &Id,
        user_id: i32,
        status: RunStatus,
    ) -> Result<DeploymentRun> {
        if status.is_terminal() {
            return Err(SupersessionError::UnsupportedOperation(status));
        }

        let run = self.storage.get_run(run_id).await?;
        self.apply_non_terminal_status(run, user_id, status).await
    }

    async fn apply_non_terminal_status(
        &self,
        mut run: DeploymentRun,
        user_id: i32,
        status: RunStatus,
    ) -> Result<DeploymentRun> {
        if run.is_terminal() {
            tracing::warn!(
                run_id = %run.id,
                status = run.status.as_str(),
                requested = status.as_str(),
                "deployment already terminated, ignoring status update"
            );
            return Ok(run);
        }

        run.status = status;
        run.updated_at = Utc::now();
        run.updated_by = user_id;
        let mut conn = self.storage.acquire().await?;
        if self.storage.update_run_if_not_terminal(&mut conn, &run).await? {
            return Ok(run);
        }
        let stored = self.storage.get_run_with(&mut conn, &run.id).await?;
        tracing::warn!(
            run_id = %stored.id,
            status = stored.status.as_str(),
            requested = status.as_str(),
            "deployment terminated concurrently, ignoring status update"
        );
        Ok(stored)
    }

    /// Predicates the trigger consumer runs before dispatching a message.
    pub fn trigger_validate_funcs(&self) -> Vec<Arc<dyn TriggerValidator>> {
        vec![Arc::new(DuplicateTriggerValidator {
            storage: self.storage.clone(),
        })]
    }

    async fn emit_metric(&self, run: &DeploymentRun) {
        if !self.expose_metrics {
            return;
        }
        let Some(pipeline) = self
            .storage
            .get_pipeline(run.pipeline_id)
            .await
            .advisory("load pipeline for deployment metric")
        else {
            return;
        };
        let metric = DeploymentMetric::new(run, &pipeline);
        self.metrics
            .emit_deployment_metric(&metric)
            .advisory("emit deployment metric");
    }
}

#[async_trait]
pub trait TriggerValidator: Send + Sync {
    /// `false` rejects the message before any side effect.
    async fn validate(&self, msg: &TriggerMessage) -> bool;
}

/// Rejects a redelivered message whose id already produced a run.
pub struct DuplicateTriggerValidator {
    storage: Arc<Storage>,
}

impl DuplicateTriggerValidator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TriggerValidator for DuplicateTriggerValidator {
    async fn validate(&self, msg: &TriggerMessage) -> bool {
        if msg.deliver_count <= 1 || msg.msg_id.is_empty() {
            return true;
        }
        match self.storage.runner_exists_by_reference_id(&msg.msg_id).await {
            Ok(false) => true,
            Ok(true) => {
                tracing::warn!(msg_id = %msg.msg_id, "duplicate trigger, message already processed");
                false
            }
            Err(e) => {
                tracing::error!(msg_id = %msg.msg_id, error = %e, "failed to check trigger reference id");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::RecordingMetricsSink;
    use crate::storage::test_support::{
        create_test_storage, insert_deploy_run, test_pipeline, update_run,
    };
    use deploy_core::{
        DeployTrigger, DeploymentAppType, TimelineOwner, TimelineStatus, WorkflowType,
    };

    struct Fixture {
        storage: Arc<Storage>,
        manager: SupersessionManager,
        metrics: Arc<RecordingMetricsSink>,
        _ts: tempfile::TempDir,
    }

    async fn fixture(expose_metrics: bool) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        storage
            .upsert_pipeline(&test_pipeline(1, DeploymentAppType::GitOps))
            .await
            .unwrap();
        let metrics = Arc::new(RecordingMetricsSink::default());
        let manager = SupersessionManager::new(
            storage.clone(),
            TimelineRecorder::new(storage.clone(), 255),
            metrics.clone(),
            expose_metrics,
        );
        Fixture {
            storage,
            manager,
            metrics,
            _ts: dir,
        }
    }

    async fn superseded_count(storage: &Storage, run_id: &Id) -> usize {
        storage
            .list_timelines(&TimelineOwner::Runner(run_id.clone()))
            .await
            .unwrap()
            .iter()
            .filter(|e| e.status == TimelineStatus::DeploymentSuperseded)
            .count()
    }

    #[tokio::test]
    async fn supersede_fails_in_flight_runs_only() {
        let f = fixture(false).await;
        let r1 = insert_deploy_run(&f.storage, 1, RunStatus::Running, -2_000).await;
        let r2 = insert_deploy_run(&f.storage, 1, RunStatus::Succeeded, -1_000).await;
        let r3 = insert_deploy_run(&f.storage, 1, RunStatus::Starting, 0).await;
        let triggered_at = Utc::now();

        let fenced = f
            .manager
            .supersede_previous_deployments(&r3.id, 1, triggered_at, 7)
            .await
            .unwrap();
        assert_eq!(fenced, vec![r1.id.clone()]);

        let r1 = f.storage.get_run(&r1.id).await.unwrap();
        assert_eq!(r1.status, RunStatus::Failed);
        assert_eq!(r1.message.as_deref(), Some(DEPLOYMENT_SUPERSEDED));
        assert_eq!(r1.updated_by, 7);
        assert_eq!(
            r1.finished_at.map(|t| t.timestamp_millis()),
            Some(triggered_at.timestamp_millis())
        );
        assert_eq!(superseded_count(&f.storage, &r1.id).await, 1);

        let r2 = f.storage.get_run(&r2.id).await.unwrap();
        assert_eq!(r2.status, RunStatus::Succeeded);
        assert!(r2.message.is_none());
        assert_eq!(superseded_count(&f.storage, &r2.id).await, 0);

        let r3 = f.storage.get_run(&r3.id).await.unwrap();
        assert_eq!(r3.status, RunStatus::Starting);
    }

    #[tokio::test]
    async fn supersede_marks_every_non_terminal_run() {
        let f = fixture(false).await;
        let mut prior = Vec::new();
        for (i, status) in [RunStatus::Running, RunStatus::Progressing, RunStatus::Starting]
            .into_iter()
            .enumerate()
        {
            prior.push(insert_deploy_run(&f.storage, 1, status, -1_000 * (i as i64 + 1)).await);
        }
        insert_deploy_run(&f.storage, 1, RunStatus::Healthy, -5_000).await;
        let current = insert_deploy_run(&f.storage, 1, RunStatus::Starting, 0).await;

        let fenced = f
            .manager
            .supersede_previous_deployments(&current.id, 1, Utc::now(), 1)
            .await
            .unwrap();
        assert_eq!(fenced.len(), 3);
        for run in &prior {
            assert_eq!(
                f.storage.get_run(&run.id).await.unwrap().status,
                RunStatus::Failed
            );
            assert_eq!(superseded_count(&f.storage, &run.id).await, 1);
        }
    }

    #[tokio::test]
    async fn supersede_without_previous_runs_is_noop() {
        let f = fixture(false).await;
        let current = insert_deploy_run(&f.storage, 1, RunStatus::Starting, 0).await;
        let fenced = f
            .manager
            .supersede_previous_deployments(&current.id, 1, Utc::now(), 1)
            .await
            .unwrap();
        assert!(fenced.is_empty());
    }

    #[tokio::test]
    async fn queued_runs_are_failed_and_metered() {
        let f = fixture(true).await;
        let queued = insert_deploy_run(&f.storage, 1, RunStatus::Queued, -1_000).await;
        let running = insert_deploy_run(&f.storage, 1, RunStatus::Running, -500).await;
        let current = insert_deploy_run(&f.storage, 1, RunStatus::Starting, 0).await;

        let ids = f
            .manager
            .update_previous_queued_runner_status(&current.id, 1, 4)
            .await
            .unwrap();
        assert_eq!(ids, vec![queued.id.clone()]);

        let stored = f.storage.get_run(&queued.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.message.as_deref(), Some(DEPLOYMENT_SUPERSEDED));
        assert_eq!(superseded_count(&f.storage, &queued.id).await, 1);
        assert_eq!(
            f.storage.get_run(&running.id).await.unwrap().status,
            RunStatus::Running
        );
        assert_eq!(f.metrics.count(), 1);
    }

    #[tokio::test]
    async fn mark_failed_records_detail_and_metric() {
        let f = fixture(true).await;
        let mut run = insert_deploy_run(&f.storage, 1, RunStatus::Running, 0).await;

        f.manager
            .mark_current_deployment_failed(&mut run, &ReleaseError("image pull failed".into()), 3)
            .await
            .unwrap();

        let stored = f.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.message.as_deref(), Some("image pull failed"));
        let timeline = f
            .storage
            .list_timelines(&TimelineOwner::Runner(run.id.clone()))
            .await
            .unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].status, TimelineStatus::DeploymentFailed);
        assert_eq!(
            timeline[0].status_detail,
            "Deployment failed: image pull failed"
        );
        assert_eq!(f.metrics.count(), 1);
    }

    #[tokio::test]
    async fn mark_failed_with_supersession_error_records_superseded() {
        let f = fixture(false).await;
        let run = insert_deploy_run(&f.storage, 1, RunStatus::Running, 0).await;

        let stored = f
            .manager
            .mark_deployment_failed_for_runner_id(&run.id, &SupersessionError::Superseded, 1)
            .await
            .unwrap();
        assert_eq!(stored.message.as_deref(), Some(DEPLOYMENT_SUPERSEDED));
        assert_eq!(superseded_count(&f.storage, &run.id).await, 1);
        assert_eq!(f.metrics.count(), 0);
    }

    /// Simulates a stage ingest committing `Succeeded` after `run` was read.
    async fn terminate_behind(storage: &Storage, run: &DeploymentRun) {
        let mut finished = run.clone();
        finished.status = RunStatus::Succeeded;
        finished.finished_at = Some(Utc::now());
        update_run(storage, &finished).await;
    }

    #[tokio::test]
    async fn mark_failed_keeps_success_committed_after_read() {
        let f = fixture(true).await;
        let mut run = insert_deploy_run(&f.storage, 1, RunStatus::Running, 0).await;
        terminate_behind(&f.storage, &run).await;

        f.manager
            .mark_current_deployment_failed(&mut run, &ReleaseError("timeout".into()), 1)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(
            f.storage.get_run(&run.id).await.unwrap().status,
            RunStatus::Succeeded
        );
        assert!(f
            .storage
            .list_timelines(&TimelineOwner::Runner(run.id.clone()))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.metrics.count(), 0);
    }

    #[tokio::test]
    async fn status_update_keeps_success_committed_after_read() {
        let f = fixture(false).await;
        let run = insert_deploy_run(&f.storage, 1, RunStatus::Running, 0).await;
        terminate_behind(&f.storage, &run).await;

        let returned = f
            .manager
            .apply_non_terminal_status(run.clone(), 4, RunStatus::Progressing)
            .await
            .unwrap();

        assert_eq!(returned.status, RunStatus::Succeeded);
        let stored = f.storage.get_run(&run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert_ne!(stored.updated_by, 4);
    }

    #[tokio::test]
    async fn mark_failed_on_terminal_run_is_noop() {
        let f = fixture(true).await;
        let mut run = insert_deploy_run(&f.storage, 1, RunStatus::Succeeded, 0).await;

        f.manager
            .mark_current_deployment_failed(&mut run, &ReleaseError("late".into()), 1)
            .await
            .unwrap();

        assert_eq!(
            f.storage.get_run(&run.id).await.unwrap().status,
            RunStatus::Succeeded
        );
        assert!(f
            .storage
            .list_timelines(&TimelineOwner::Runner(run.id.clone()))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.metrics.count(), 0);
    }

    #[tokio::test]
    async fn pre_stage_failure_writes_no_timeline() {
        let f = fixture(false).await;
        let mut run = DeploymentRun::new(1, WorkflowType::Pre, "pre-wf", RunStatus::Running, 1);
        f.storage.insert_run(&run).await.unwrap();

        f.manager
            .mark_current_deployment_failed(&mut run, &ReleaseError("script exited 1".into()), 1)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(f
            .storage
            .list_timelines(&TimelineOwner::Runner(run.id.clone()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn non_terminal_update_guards() {
        let f = fixture(false).await;
        let running = insert_deploy_run(&f.storage, 1, RunStatus::Starting, 0).await;
        let done = insert_deploy_run(&f.storage, 1, RunStatus::Failed, 1).await;

        let updated = f
            .manager
            .update_non_terminal_status_in_runner(&running.id, 2, RunStatus::Progressing)
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Progressing);
        assert_eq!(updated.updated_by, 2);

        // Terminal run stays terminal, without an error.
        let unchanged = f
            .manager
            .update_non_terminal_status_in_runner(&done.id, 2, RunStatus::Progressing)
            .await
            .unwrap();
        assert_eq!(unchanged.status, RunStatus::Failed);
        assert_eq!(
            f.storage.get_run(&done.id).await.unwrap().status,
            RunStatus::Failed
        );

        // Terminal target is rejected whatever the current state.
        for id in [&running.id, &done.id] {
            let err = f
                .manager
                .update_non_terminal_status_in_runner(id, 2, RunStatus::Succeeded)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                SupersessionError::UnsupportedOperation(RunStatus::Succeeded)
            ));
        }
    }

    #[tokio::test]
    async fn duplicate_trigger_rejected_only_on_redelivery() {
        let ts = create_test_storage().await;
        let storage = Arc::new(ts.storage);
        let mut run = DeploymentRun::new(1, WorkflowType::Deploy, "cd", RunStatus::Starting, 1);
        run.reference_id = Some("msg-42".to_string());
        storage.insert_run(&run).await.unwrap();
        let validator = DuplicateTriggerValidator::new(storage.clone());

        let msg = |msg_id: &str, deliver_count| TriggerMessage {
            msg_id: msg_id.to_string(),
            deliver_count,
            payload: DeployTrigger {
                version_id: Id::new(),
                history_id: Id::new(),
                user_id: 1,
                run_id: None,
            },
        };

        assert!(validator.validate(&msg("msg-42", 1)).await);
        assert!(!validator.validate(&msg("msg-42", 2)).await);
        assert!(validator.validate(&msg("msg-43", 2)).await);
        assert!(validator.validate(&msg("", 3)).await);
    }

    #[test]
    fn superseded_sentinel_detected_through_sources() {
        #[derive(Debug, Error)]
        #[error("wrapped: {0}")]
        struct Wrapper(#[source] SupersessionError);

        assert!(is_superseded_error(&SupersessionError::Superseded));
        assert!(is_superseded_error(&Wrapper(SupersessionError::Superseded)));
        assert!(!is_superseded_error(&ReleaseError("boom".into())));
        assert!(!is_superseded_error(&SupersessionError::UnsupportedOperation(
            RunStatus::Failed
        )));
    }
}
