//! Workflow stage tracker.
//!
//! Owns the per-run {preparation, execution, pod} stage records and folds raw
//! workflow engine signals into them through the pure reducers in
//! `deploy_core::stage_model`. Stage tracking can be switched off with
//! `enable_workflow_execution_stage`; runs created before it existed have no
//! stage records and are passed through untouched.

use crate::storage::{Storage, StorageError};
use chrono::Utc;
use deploy_core::stage_model::{self, WorkflowSignal};
use deploy_core::{DeploymentRun, Id, RunStatus, WorkflowStage, WorkflowType};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageTrackerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, StageTrackerError>;

/// Raw status report for one workflow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatusUpdate {
    pub wf_status: String,
    #[serde(default)]
    pub pod_status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pod_name: String,
}

impl WorkflowStatusUpdate {
    fn signal(&self) -> WorkflowSignal<'_> {
        WorkflowSignal {
            wf_status: &self.wf_status,
            pod_status: &self.pod_status,
            message: &self.message,
            pod_name: &self.pod_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageTracker {
    storage: Arc<Storage>,
    enabled: bool,
}

impl StageTracker {
    pub fn new(storage: Arc<Storage>, enabled: bool) -> Self {
        Self { storage, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create the default stage records for a new run.
    pub async fn save_workflow_stages(
        &self,
        run_id: &Id,
        workflow_type: WorkflowType,
        wf_name: &str,
    ) -> Result<Vec<WorkflowStage>> {
        if !self.enabled {
            tracing::debug!(workflow = wf_name, "workflow execution stage is disabled");
            return Ok(Vec::new());
        }
        let stages = stage_model::default_stages(run_id, workflow_type, Utc::now());
        self.storage.save_workflow_stages(&stages).await?;
        Ok(stages)
    }

    /// Fold `update` into the stage records of `run` and persist them on `conn`.
    ///
    /// Returns the run status and pod status the caller should persist. When
    /// tracking is disabled or the run has no stage records the raw inputs are
    /// returned unchanged.
    pub async fn update_workflow_stages(
        &self,
        conn: &mut SqliteConnection,
        run: &DeploymentRun,
        update: &WorkflowStatusUpdate,
    ) -> Result<(RunStatus, String)> {
        let passthrough = (RunStatus::parse(&update.wf_status), update.pod_status.clone());
        if !self.enabled {
            tracing::debug!(workflow = %run.name, "workflow execution stage is disabled");
            return Ok(passthrough);
        }

        let mut stages = self
            .storage
            .get_workflow_stages_with(conn, &run.id, run.workflow_type)
            .await?;
        if stages.is_empty() {
            return Ok(passthrough);
        }

        let (wf_status, pod_status) = stage_model::reduce(
            &mut stages,
            &update.signal(),
            run.status,
            run.pod_status.as_deref(),
            Utc::now(),
        );
        self.storage.update_workflow_stages(conn, &stages).await?;
        tracing::debug!(
            run_id = %run.id,
            wf_status = wf_status.as_str(),
            pod_status = %pod_status,
            "workflow stages updated"
        );
        Ok((wf_status, pod_status))
    }

    /// Apply a workflow engine report to a run: stages and run fields are
    /// written in one transaction. A run that is already terminal is left as is.
    pub async fn ingest(&self, run_id: &Id, update: &WorkflowStatusUpdate) -> Result<DeploymentRun> {
        let mut tx = self.storage.begin().await?;
        let mut run = self.storage.get_run_with(&mut tx, run_id).await?;
        if run.is_terminal() {
            tracing::debug!(run_id = %run.id, status = run.status.as_str(), "ignoring report for terminal run");
            return Ok(run);
        }

        let (status, pod_status) = self.update_workflow_stages(&mut tx, &run, update).await?;
        let now = Utc::now();
        run.status = status;
        run.pod_status = (!pod_status.is_empty()).then_some(pod_status);
        if !update.pod_name.is_empty() {
            run.pod_name = Some(update.pod_name.clone());
        }
        if !update.message.is_empty() {
            run.message = Some(update.message.clone());
        }
        if status.is_terminal() {
            run.finished_at = Some(now);
        }
        run.updated_at = now;
        self.storage
            .update_runs(&mut tx, std::slice::from_ref(&run))
            .await?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(run)
    }

    /// Stage records of a run grouped by `status_for`. Empty when tracking is
    /// disabled or the run predates stage tracking.
    pub async fn stages_for_run(
        &self,
        run_id: &Id,
        workflow_type: WorkflowType,
    ) -> Result<BTreeMap<String, Vec<WorkflowStage>>> {
        let mut grouped: BTreeMap<String, Vec<WorkflowStage>> = BTreeMap::new();
        if !self.enabled {
            return Ok(grouped);
        }
        for stage in self
            .storage
            .get_workflow_stages(run_id, workflow_type)
            .await?
        {
            grouped
                .entry(stage.status_for.as_str().to_string())
                .or_default()
                .push(stage);
        }
        Ok(grouped)
    }
}
