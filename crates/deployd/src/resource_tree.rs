//! Resource tree reconciler.
//!
//! Fetches the live resource tree of a pipeline's deployment app, derives the
//! application status shown to users, and writes that status back: the
//! latest in-flight deploy run is closed as healthy and `app_status` is
//! refreshed. Write-backs are advisory.

use crate::advisory::AdvisoryResultExt;
use crate::cluster::{ClusterError, ClusterStateClient};
use crate::storage::{Storage, StorageError};
use crate::timeline::{TimelineError, TimelineRecorder};
use chrono::Utc;
use deploy_core::{
    DeploymentAppType, Pipeline, ReleaseKind, RunStatus, TimelineEntry, TimelineOwner,
    TimelineStatus,
};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const HEALTHY: &str = "Healthy";
pub const DEGRADED: &str = "Degraded";
pub const HIBERNATING: &str = "HIBERNATING";
pub const NOT_DEPLOYED: &str = "NOT_DEPLOYED";

/// Timeline author for writes made by the reconciler itself.
const SYSTEM_USER_ID: i32 = 1;

const RECONCILE_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Resource tree of a pipeline's deployment app as returned to clients.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppResourceTree {
    pub status: String,
    pub nodes: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

pub struct ResourceTreeReconciler {
    storage: Arc<Storage>,
    timelines: TimelineRecorder,
    cluster: Arc<dyn ClusterStateClient>,
}

impl ResourceTreeReconciler {
    pub fn new(
        storage: Arc<Storage>,
        timelines: TimelineRecorder,
        cluster: Arc<dyn ClusterStateClient>,
    ) -> Self {
        Self {
            storage,
            timelines,
            cluster,
        }
    }

    pub async fn fetch_resource_tree(&self, pipeline_id: i64) -> Result<AppResourceTree> {
        let pipeline = self.storage.get_pipeline(pipeline_id).await?;
        if !pipeline.deployment_app_created || pipeline.deployment_app_name.is_empty() {
            tracing::warn!(
                pipeline_id,
                app = %pipeline.deployment_app_name,
                "deployment app not created, skipping resource tree"
            );
            return Ok(AppResourceTree::default());
        }

        let tree = match pipeline.deployment_app_type {
            DeploymentAppType::GitOps => Some(self.gitops_tree(&pipeline).await?),
            DeploymentAppType::Helm => self.helm_tree(&pipeline).await,
        };
        let Some(mut tree) = tree else {
            return Ok(AppResourceTree::default());
        };

        tree.server_version = self
            .cluster
            .server_version(pipeline.cluster_id)
            .await
            .advisory("fetch cluster server version")
            .flatten();
        Ok(tree)
    }

    async fn gitops_tree(&self, pipeline: &Pipeline) -> Result<AppResourceTree> {
        let live = self
            .cluster
            .argo_resource_tree(&pipeline.deployment_app_name)
            .await?;
        let mut status = live.health;

        if status == HEALTHY && self.last_release_is_stop(pipeline.id).await {
            status = HIBERNATING.to_string();
        }
        if status == DEGRADED {
            let releases = self
                .storage
                .count_deploy_runs(pipeline.id)
                .await
                .advisory("count releases");
            if releases == Some(0) {
                status = NOT_DEPLOYED.to_string();
            }
        }

        if status == HEALTHY {
            if let Err(e) = self.sync_pipeline_status(pipeline).await {
                tracing::warn!(pipeline_id = pipeline.id, error = %e, "failed to sync pipeline status");
            }
        }
        self.storage
            .upsert_app_status(pipeline.app_id, pipeline.environment_id, &status)
            .await
            .advisory("update app status");

        Ok(AppResourceTree {
            status,
            nodes: live.nodes,
            release_status: None,
            server_version: None,
        })
    }

    async fn helm_tree(&self, pipeline: &Pipeline) -> Option<AppResourceTree> {
        let detail = self
            .cluster
            .helm_app_detail(&pipeline.deployment_app_name, &pipeline.namespace)
            .await
            .advisory("fetch helm app detail")
            .flatten()?;

        let mut status = detail.health;
        if status == HEALTHY && self.last_release_is_stop(pipeline.id).await {
            status = HIBERNATING.to_string();
        }
        Some(AppResourceTree {
            status,
            nodes: detail
                .resource_tree
                .as_array()
                .cloned()
                .unwrap_or_default(),
            release_status: Some(detail.release_status),
            server_version: None,
        })
    }

    async fn last_release_is_stop(&self, pipeline_id: i64) -> bool {
        self.storage
            .latest_deploy_run(pipeline_id)
            .await
            .advisory("load last release")
            .flatten()
            .is_some_and(|run| run.release_kind == ReleaseKind::Stop)
    }

    /// Close the latest in-flight deploy run as healthy. The HEALTHY timeline
    /// is written at most once per run.
    async fn sync_pipeline_status(&self, pipeline: &Pipeline) -> Result<()> {
        let Some(mut run) = self.storage.latest_deploy_run(pipeline.id).await? else {
            return Ok(());
        };
        if run.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        run.status = RunStatus::Healthy;
        run.finished_at = Some(now);
        run.updated_at = now;
        run.updated_by = SYSTEM_USER_ID;

        let mut tx = self.storage.begin().await?;
        self.storage
            .update_runs(&mut tx, std::slice::from_ref(&run))
            .await?;
        self.timelines
            .save_timelines_if_not_present(
                &mut tx,
                vec![TimelineEntry::new(
                    TimelineOwner::Runner(run.id.clone()),
                    TimelineStatus::Healthy,
                    SYSTEM_USER_ID,
                )],
            )
            .await?;
        tx.commit().await.map_err(StorageError::from)?;
        tracing::info!(pipeline_id = pipeline.id, run_id = %run.id, "deploy run marked healthy");
        Ok(())
    }

    /// Fetch the resource tree of every pipeline with a created deployment
    /// app. Returns the number of pipelines reconciled successfully.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let pipelines: Vec<i64> = self
            .storage
            .list_pipelines()
            .await?
            .into_iter()
            .filter(|p| p.deployment_app_created)
            .map(|p| p.id)
            .collect();

        let outcomes: Vec<(i64, Result<AppResourceTree>)> = stream::iter(pipelines)
            .map(|id| async move { (id, self.fetch_resource_tree(id).await) })
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .collect()
            .await;

        let mut reconciled = 0;
        for (pipeline_id, outcome) in outcomes {
            match outcome {
                Ok(tree) => {
                    tracing::debug!(pipeline_id, status = %tree.status, "pipeline reconciled");
                    reconciled += 1;
                }
                Err(e) => {
                    tracing::warn!(pipeline_id, error = %e, "pipeline reconcile failed");
                }
            }
        }
        Ok(reconciled)
    }

    /// Run [`Self::reconcile_all`] every `interval` until `cancel` fires.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reconcile_all().await {
                        Ok(count) => tracing::debug!(count, "reconcile pass finished"),
                        Err(e) => tracing::warn!(error = %e, "reconcile pass failed"),
                    }
                }
            }
        }
        tracing::info!("resource tree reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::FakeClusterState;
    use crate::cluster::HelmAppDetail;
    use crate::storage::test_support::{insert_deploy_run, test_pipeline};
    use deploy_core::{DeploymentRun, WorkflowType};
    use tempfile::TempDir;

    async fn reconciler(
        cluster: FakeClusterState,
        app_type: DeploymentAppType,
    ) -> (ResourceTreeReconciler, Arc<Storage>, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        storage
            .upsert_pipeline(&test_pipeline(1, app_type))
            .await
            .unwrap();
        let reconciler = ResourceTreeReconciler::new(
            storage.clone(),
            TimelineRecorder::new(storage.clone(), 255),
            Arc::new(cluster),
        );
        (reconciler, storage, dir)
    }

    async fn healthy_timelines(storage: &Storage, run: &DeploymentRun) -> usize {
        storage
            .list_timelines(&TimelineOwner::Runner(run.id.clone()))
            .await
            .unwrap()
            .iter()
            .filter(|e| e.status == TimelineStatus::Healthy)
            .count()
    }

    #[tokio::test]
    async fn healthy_tree_closes_latest_run_once() {
        let mut cluster = FakeClusterState::with_argo_health(HEALTHY);
        cluster.server_version = Some("v1.29.2".to_string());
        let (reconciler, storage, _ts) = reconciler(cluster, DeploymentAppType::GitOps).await;
        let run = insert_deploy_run(&storage, 1, RunStatus::Progressing, 0).await;

        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert_eq!(tree.status, HEALTHY);
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.server_version.as_deref(), Some("v1.29.2"));

        reconciler.fetch_resource_tree(1).await.unwrap();

        let run_after = storage.get_run(&run.id).await.unwrap();
        assert_eq!(run_after.status, RunStatus::Healthy);
        assert!(run_after.finished_at.is_some());
        assert_eq!(healthy_timelines(&storage, &run).await, 1);
        let app_status = storage.get_app_status(10, 20).await.unwrap().unwrap();
        assert_eq!(app_status.status, HEALTHY);
    }

    #[tokio::test]
    async fn healthy_after_stop_release_is_hibernating() {
        let (reconciler, storage, _ts) = reconciler(
            FakeClusterState::with_argo_health(HEALTHY),
            DeploymentAppType::GitOps,
        )
        .await;
        let mut run = DeploymentRun::new(1, WorkflowType::Deploy, "cd-wf", RunStatus::Succeeded, 1);
        run.release_kind = ReleaseKind::Stop;
        storage.insert_run(&run).await.unwrap();

        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert_eq!(tree.status, HIBERNATING);
        assert_eq!(
            storage.get_app_status(10, 20).await.unwrap().unwrap().status,
            HIBERNATING
        );
    }

    #[tokio::test]
    async fn degraded_without_releases_is_not_deployed() {
        let (reconciler, storage, _ts) = reconciler(
            FakeClusterState::with_argo_health(DEGRADED),
            DeploymentAppType::GitOps,
        )
        .await;

        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert_eq!(tree.status, NOT_DEPLOYED);

        insert_deploy_run(&storage, 1, RunStatus::Failed, 0).await;
        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert_eq!(tree.status, DEGRADED);
    }

    #[tokio::test]
    async fn uncreated_app_yields_empty_tree() {
        let (reconciler, storage, _ts) = reconciler(
            FakeClusterState::with_argo_health(HEALTHY),
            DeploymentAppType::GitOps,
        )
        .await;
        let mut pipeline = test_pipeline(2, DeploymentAppType::GitOps);
        pipeline.deployment_app_created = false;
        storage.upsert_pipeline(&pipeline).await.unwrap();

        let tree = reconciler.fetch_resource_tree(2).await.unwrap();
        assert!(tree.status.is_empty());
        assert!(tree.nodes.is_empty());
        assert!(storage.get_app_status(10, 20).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn helm_release_detail_is_used() {
        let cluster = FakeClusterState::default();
        *cluster.helm.lock().unwrap() = Some(HelmAppDetail {
            release_status: "deployed".to_string(),
            health: HEALTHY.to_string(),
            resource_tree: serde_json::json!([{"kind": "Service", "name": "billing"}]),
        });
        let (reconciler, _storage, _ts) = reconciler(cluster, DeploymentAppType::Helm).await;

        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert_eq!(tree.status, HEALTHY);
        assert_eq!(tree.release_status.as_deref(), Some("deployed"));
        assert_eq!(tree.nodes[0]["kind"], "Service");
    }

    #[tokio::test]
    async fn missing_helm_release_yields_empty_tree() {
        let (reconciler, _storage, _ts) =
            reconciler(FakeClusterState::default(), DeploymentAppType::Helm).await;
        let tree = reconciler.fetch_resource_tree(1).await.unwrap();
        assert!(tree.status.is_empty());
        assert!(tree.server_version.is_none());
    }

    #[tokio::test]
    async fn reconcile_all_covers_created_apps() {
        let (reconciler, storage, _ts) = reconciler(
            FakeClusterState::with_argo_health(HEALTHY),
            DeploymentAppType::GitOps,
        )
        .await;
        storage
            .upsert_pipeline(&test_pipeline(2, DeploymentAppType::GitOps))
            .await
            .unwrap();
        let mut hidden = test_pipeline(3, DeploymentAppType::GitOps);
        hidden.deployment_app_created = false;
        storage.upsert_pipeline(&hidden).await.unwrap();

        assert_eq!(reconciler.reconcile_all().await.unwrap(), 2);
    }
}
