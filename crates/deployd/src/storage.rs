//! SQLite storage module for the deployment daemon.
//!
//! Persistence gateway for pipelines, deployment runs, workflow stages,
//! timelines, installed app versions, app status and configuration history.
//! Operations that must be atomic with others take a `&mut SqliteConnection`
//! so callers can run them inside a transaction from [`Storage::begin`].

use chrono::{DateTime, Utc};
use deploy_core::{
    report, AppStatus, ConfigComponent, ConfigHistory, DeployErrorKind, DeployProgress,
    DeployStage, DeploymentAppType, DeploymentRun, Id, InstalledAppVersion,
    InstalledAppVersionHistory, Pipeline, ReleaseKind, RunStatus, StageName, StageStatus,
    StatusFor, TimelineEntry, TimelineOwner, TimelineStatus, WorkflowStage, WorkflowType,
};
use sqlx::{
    pool::PoolConnection, sqlite::SqlitePoolOptions, Pool, Sqlite, SqliteConnection, Transaction,
};
use std::path::Path;
use thiserror::Error;

/// Explicit column list for deployment run queries.
const RUN_COLUMNS: &str = "id, pipeline_id, workflow_type, release_kind, name, status, \
    pod_status, pod_name, message, reference_id, triggered_by, started_at, finished_at, \
    created_at, updated_at, updated_by";

const VERSION_COLUMNS: &str = "id, app_name, environment_id, environment_name, namespace, \
    deployment_app_type, chart_repo_url, chart_name, chart_version, values_override_yaml, \
    deploy_stage, last_error, git_hash, gitops_repo_url, target_revision, user_id, \
    created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("pipeline not found: {0}")]
    PipelineNotFound(i64),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("installed app version not found: {0}")]
    VersionNotFound(String),
    #[error("installed app version history not found: {0}")]
    HistoryNotFound(String),
    #[error("reference id already used by another run: {0}")]
    DuplicateReference(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound(_)
                | Self::RunNotFound(_)
                | Self::VersionNotFound(_)
                | Self::HistoryNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run the embedded schema migrations. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a transaction. Dropping it without `commit()` rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Check out a plain pooled connection for single-statement writes.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    // --- Pipelines ---

    /// Insert or replace a pipeline definition.
    pub async fn upsert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (id, app_id, app_name, environment_id, environment_name,
                                   namespace, cluster_id, deployment_app_name,
                                   deployment_app_type, deployment_app_created, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                app_id = excluded.app_id,
                app_name = excluded.app_name,
                environment_id = excluded.environment_id,
                environment_name = excluded.environment_name,
                namespace = excluded.namespace,
                cluster_id = excluded.cluster_id,
                deployment_app_name = excluded.deployment_app_name,
                deployment_app_type = excluded.deployment_app_type,
                deployment_app_created = excluded.deployment_app_created
            "#,
        )
        .bind(pipeline.id)
        .bind(pipeline.app_id)
        .bind(&pipeline.app_name)
        .bind(pipeline.environment_id)
        .bind(&pipeline.environment_name)
        .bind(&pipeline.namespace)
        .bind(pipeline.cluster_id)
        .bind(&pipeline.deployment_app_name)
        .bind(pipeline.deployment_app_type.as_str())
        .bind(pipeline.deployment_app_created)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_pipeline(&self, id: i64) -> Result<Pipeline> {
        let row = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, app_id, app_name, environment_id, environment_name, namespace, \
             cluster_id, deployment_app_name, deployment_app_type, deployment_app_created \
             FROM pipelines WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::PipelineNotFound(id))?;
        Ok(row.into_pipeline())
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            "SELECT id, app_id, app_name, environment_id, environment_name, namespace, \
             cluster_id, deployment_app_name, deployment_app_type, deployment_app_created \
             FROM pipelines ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PipelineRow::into_pipeline).collect())
    }

    pub async fn mark_deployment_app_created(&self, id: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE pipelines SET deployment_app_created = 1 WHERE id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::PipelineNotFound(id));
        }
        Ok(())
    }

    // --- Deployment runs ---

    pub async fn insert_run(&self, run: &DeploymentRun) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.insert_run_with(&mut conn, run).await
    }

    pub async fn insert_run_with(
        &self,
        conn: &mut SqliteConnection,
        run: &DeploymentRun,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_runs (id, pipeline_id, workflow_type, release_kind, name,
                                         status, pod_status, pod_name, message, reference_id,
                                         triggered_by, started_at, finished_at, created_at,
                                         updated_at, updated_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(run.id.as_ref())
        .bind(run.pipeline_id)
        .bind(run.workflow_type.as_str())
        .bind(run.release_kind.as_str())
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&run.pod_status)
        .bind(&run.pod_name)
        .bind(&run.message)
        .bind(&run.reference_id)
        .bind(run.triggered_by)
        .bind(run.started_at.timestamp_millis())
        .bind(run.finished_at.map(|t| t.timestamp_millis()))
        .bind(run.created_at.timestamp_millis())
        .bind(run.updated_at.timestamp_millis())
        .bind(run.updated_by)
        .execute(&mut *conn)
        .await
        .map_err(|e| match &run.reference_id {
            Some(reference_id) if is_unique_violation(&e) => {
                StorageError::DuplicateReference(reference_id.clone())
            }
            _ => StorageError::Database(e),
        })?;
        Ok(())
    }

    pub async fn get_run(&self, id: &Id) -> Result<DeploymentRun> {
        let mut conn = self.pool.acquire().await?;
        self.get_run_with(&mut conn, id).await
    }

    pub async fn get_run_with(&self, conn: &mut SqliteConnection, id: &Id) -> Result<DeploymentRun> {
        let query = format!("SELECT {RUN_COLUMNS} FROM deployment_runs WHERE id = ?1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        Ok(row.into_run())
    }

    /// List runs, newest first, optionally filtered by pipeline.
    pub async fn list_runs(&self, pipeline_id: Option<i64>) -> Result<Vec<DeploymentRun>> {
        let rows = match pipeline_id {
            Some(pipeline_id) => {
                let query = format!(
                    "SELECT {RUN_COLUMNS} FROM deployment_runs WHERE pipeline_id = ?1 \
                     ORDER BY created_at DESC, id DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .bind(pipeline_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {RUN_COLUMNS} FROM deployment_runs ORDER BY created_at DESC, id DESC"
                );
                sqlx::query_as::<_, RunRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Deploy-type runs of `pipeline_id` created before `current`, whose status
    /// is not in `excluded`.
    pub async fn find_previous_runs_excluding_status(
        &self,
        conn: &mut SqliteConnection,
        pipeline_id: i64,
        current: &DeploymentRun,
        excluded: &[RunStatus],
    ) -> Result<Vec<DeploymentRun>> {
        let runs = self.previous_deploy_runs(conn, pipeline_id, current).await?;
        Ok(runs
            .into_iter()
            .filter(|r| !excluded.contains(&r.status))
            .collect())
    }

    /// Deploy-type runs of `pipeline_id` created before `current` that are still queued.
    pub async fn find_queued_runs(
        &self,
        pipeline_id: i64,
        current: &DeploymentRun,
    ) -> Result<Vec<DeploymentRun>> {
        let mut conn = self.pool.acquire().await?;
        let runs = self.previous_deploy_runs(&mut conn, pipeline_id, current).await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Queued)
            .collect())
    }

    async fn previous_deploy_runs(
        &self,
        conn: &mut SqliteConnection,
        pipeline_id: i64,
        current: &DeploymentRun,
    ) -> Result<Vec<DeploymentRun>> {
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM deployment_runs \
             WHERE pipeline_id = ?1 AND workflow_type = ?2 AND id != ?3 \
             AND (created_at < ?4 OR (created_at = ?4 AND id < ?3)) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&query)
            .bind(pipeline_id)
            .bind(WorkflowType::Deploy.as_str())
            .bind(current.id.as_ref())
            .bind(current.created_at.timestamp_millis())
            .fetch_all(&mut *conn)
            .await?;
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    /// Persist the mutable fields of a batch of runs on the given connection.
    pub async fn update_runs(
        &self,
        conn: &mut SqliteConnection,
        runs: &[DeploymentRun],
    ) -> Result<()> {
        for run in runs {
            let result = sqlx::query(
                "UPDATE deployment_runs SET status = ?1, pod_status = ?2, pod_name = ?3, \
                 message = ?4, finished_at = ?5, updated_at = ?6, updated_by = ?7 WHERE id = ?8",
            )
            .bind(run.status.as_str())
            .bind(&run.pod_status)
            .bind(&run.pod_name)
            .bind(&run.message)
            .bind(run.finished_at.map(|t| t.timestamp_millis()))
            .bind(run.updated_at.timestamp_millis())
            .bind(run.updated_by)
            .bind(run.id.as_ref())
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 0 {
                return Err(StorageError::RunNotFound(run.id.to_string()));
            }
        }
        Ok(())
    }

    /// Persist the mutable fields of `run` unless the stored row is already
    /// terminal. Returns `false` when the stored terminal status was kept.
    pub async fn update_run_if_not_terminal(
        &self,
        conn: &mut SqliteConnection,
        run: &DeploymentRun,
    ) -> Result<bool> {
        let terminal = (0..RunStatus::TERMINAL.len())
            .map(|i| format!("?{}", i + 9))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE deployment_runs SET status = ?1, pod_status = ?2, pod_name = ?3, \
             message = ?4, finished_at = ?5, updated_at = ?6, updated_by = ?7 \
             WHERE id = ?8 AND status NOT IN ({terminal})"
        );
        let mut query = sqlx::query(&sql)
            .bind(run.status.as_str())
            .bind(&run.pod_status)
            .bind(&run.pod_name)
            .bind(&run.message)
            .bind(run.finished_at.map(|t| t.timestamp_millis()))
            .bind(run.updated_at.timestamp_millis())
            .bind(run.updated_by)
            .bind(run.id.as_ref());
        for status in RunStatus::TERMINAL {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&mut *conn).await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        self.get_run_with(conn, &run.id).await?;
        Ok(false)
    }

    /// Bulk-terminalize runs as `Failed` with `message`.
    pub async fn update_runs_to_failed_for_ids(
        &self,
        ids: &[Id],
        message: &str,
        updated_by: i32,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp_millis();
        let mut tx = self.begin().await?;
        for id in ids {
            sqlx::query(
                "UPDATE deployment_runs SET status = ?1, message = ?2, finished_at = ?3, \
                 updated_at = ?3, updated_by = ?4 WHERE id = ?5",
            )
            .bind(RunStatus::Failed.as_str())
            .bind(message)
            .bind(now)
            .bind(updated_by)
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn runner_exists_by_reference_id(&self, reference_id: &str) -> Result<bool> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM deployment_runs WHERE reference_id = ?1")
                .bind(reference_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0 > 0)
    }

    /// Stamp `reference_id` on a run that has none yet. Returns `false` when
    /// the run already carries a reference id.
    pub async fn stamp_run_reference_id(&self, id: &Id, reference_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployment_runs SET reference_id = ?1 WHERE id = ?2 AND reference_id IS NULL",
        )
        .bind(reference_id)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::DuplicateReference(reference_id.to_string())
            } else {
                StorageError::Database(e)
            }
        })?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish an already-stamped run from a missing one.
        self.get_run(id).await?;
        Ok(false)
    }

    /// Most recent deploy-type run of a pipeline.
    pub async fn latest_deploy_run(&self, pipeline_id: i64) -> Result<Option<DeploymentRun>> {
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM deployment_runs \
             WHERE pipeline_id = ?1 AND workflow_type = ?2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(pipeline_id)
            .bind(WorkflowType::Deploy.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RunRow::into_run))
    }

    pub async fn count_deploy_runs(&self, pipeline_id: i64) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM deployment_runs WHERE pipeline_id = ?1 AND workflow_type = ?2",
        )
        .bind(pipeline_id)
        .bind(WorkflowType::Deploy.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    // --- Workflow stages ---

    pub async fn save_workflow_stages(&self, stages: &[WorkflowStage]) -> Result<()> {
        let mut tx = self.begin().await?;
        for stage in stages {
            sqlx::query(
                r#"
                INSERT INTO workflow_stages (id, run_id, workflow_type, stage_name, status_for,
                                             status, message, start_time, end_time, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(stage.id.as_ref())
            .bind(stage.run_id.as_ref())
            .bind(stage.workflow_type.as_str())
            .bind(stage.stage_name.as_str())
            .bind(stage.status_for.as_str())
            .bind(stage.status.as_str())
            .bind(&stage.message)
            .bind(stage.start_time.map(|t| t.timestamp_millis()))
            .bind(stage.end_time.map(|t| t.timestamp_millis()))
            .bind(&stage.metadata)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_workflow_stages(
        &self,
        run_id: &Id,
        workflow_type: WorkflowType,
    ) -> Result<Vec<WorkflowStage>> {
        let mut conn = self.pool.acquire().await?;
        self.get_workflow_stages_with(&mut conn, run_id, workflow_type)
            .await
    }

    pub async fn get_workflow_stages_with(
        &self,
        conn: &mut SqliteConnection,
        run_id: &Id,
        workflow_type: WorkflowType,
    ) -> Result<Vec<WorkflowStage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            "SELECT id, run_id, workflow_type, stage_name, status_for, status, message, \
             start_time, end_time, metadata FROM workflow_stages \
             WHERE run_id = ?1 AND workflow_type = ?2 ORDER BY rowid ASC",
        )
        .bind(run_id.as_ref())
        .bind(workflow_type.as_str())
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().filter_map(StageRow::into_stage).collect())
    }

    pub async fn update_workflow_stages(
        &self,
        conn: &mut SqliteConnection,
        stages: &[WorkflowStage],
    ) -> Result<()> {
        for stage in stages {
            sqlx::query(
                "UPDATE workflow_stages SET status = ?1, message = ?2, start_time = ?3, \
                 end_time = ?4, metadata = ?5 WHERE id = ?6",
            )
            .bind(stage.status.as_str())
            .bind(&stage.message)
            .bind(stage.start_time.map(|t| t.timestamp_millis()))
            .bind(stage.end_time.map(|t| t.timestamp_millis()))
            .bind(&stage.metadata)
            .bind(stage.id.as_ref())
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    // --- Timelines ---

    pub async fn insert_timeline(
        &self,
        conn: &mut SqliteConnection,
        entry: &TimelineEntry,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO timelines (id, owner_kind, owner_id, status, status_detail, \
             status_time, created_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(entry.id.as_ref())
        .bind(entry.owner.kind())
        .bind(entry.owner.id().as_ref())
        .bind(entry.status.as_str())
        .bind(&entry.status_detail)
        .bind(entry.status_time.timestamp_millis())
        .bind(entry.created_by)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn timeline_exists(
        &self,
        conn: &mut SqliteConnection,
        owner: &TimelineOwner,
        status: TimelineStatus,
    ) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM timelines WHERE owner_kind = ?1 AND owner_id = ?2 AND status = ?3",
        )
        .bind(owner.kind())
        .bind(owner.id().as_ref())
        .bind(status.as_str())
        .fetch_one(&mut *conn)
        .await?;
        Ok(count.0 > 0)
    }

    /// Timeline of an owner in chronological order.
    pub async fn list_timelines(&self, owner: &TimelineOwner) -> Result<Vec<TimelineEntry>> {
        let rows = sqlx::query_as::<_, TimelineRow>(
            "SELECT id, owner_kind, owner_id, status, status_detail, status_time, created_by \
             FROM timelines WHERE owner_kind = ?1 AND owner_id = ?2 \
             ORDER BY status_time ASC, rowid ASC",
        )
        .bind(owner.kind())
        .bind(owner.id().as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(TimelineRow::into_entry).collect())
    }

    // --- Installed app versions ---

    pub async fn insert_app_version(&self, version: &InstalledAppVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO installed_app_versions (id, app_name, environment_id, environment_name,
                namespace, deployment_app_type, chart_repo_url, chart_name, chart_version,
                values_override_yaml, deploy_stage, last_error, status, git_hash,
                gitops_repo_url, target_revision, user_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19)
            "#,
        )
        .bind(version.id.as_ref())
        .bind(&version.app_name)
        .bind(version.environment_id)
        .bind(&version.environment_name)
        .bind(&version.namespace)
        .bind(version.deployment_app_type.as_str())
        .bind(&version.chart_repo_url)
        .bind(&version.chart_name)
        .bind(&version.chart_version)
        .bind(&version.values_override_yaml)
        .bind(version.progress.stage.as_str())
        .bind(version.progress.last_error.map(|e| e.as_str()))
        .bind(version.progress.status().as_str())
        .bind(&version.git_hash)
        .bind(&version.gitops_repo_url)
        .bind(&version.target_revision)
        .bind(version.user_id)
        .bind(version.created_at.timestamp_millis())
        .bind(version.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_app_version(&self, id: &Id) -> Result<InstalledAppVersion> {
        let query = format!("SELECT {VERSION_COLUMNS} FROM installed_app_versions WHERE id = ?1");
        let row = sqlx::query_as::<_, VersionRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound(id.to_string()))?;
        Ok(row.into_version())
    }

    pub async fn list_app_versions(&self) -> Result<Vec<InstalledAppVersion>> {
        let query =
            format!("SELECT {VERSION_COLUMNS} FROM installed_app_versions ORDER BY created_at DESC");
        let rows = sqlx::query_as::<_, VersionRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(VersionRow::into_version).collect())
    }

    /// Persist deploy progress. The legacy status column is kept in sync.
    pub async fn update_deploy_progress(&self, id: &Id, progress: DeployProgress) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.update_deploy_progress_with(&mut conn, id, progress).await
    }

    pub async fn update_deploy_progress_with(
        &self,
        conn: &mut SqliteConnection,
        id: &Id,
        progress: DeployProgress,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE installed_app_versions SET deploy_stage = ?1, last_error = ?2, status = ?3, \
             updated_at = ?4 WHERE id = ?5",
        )
        .bind(progress.stage.as_str())
        .bind(progress.last_error.map(|e| e.as_str()))
        .bind(progress.status().as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::VersionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the git coordinates produced by a commit.
    pub async fn update_version_git(
        &self,
        conn: &mut SqliteConnection,
        id: &Id,
        git_hash: &str,
        repo_url: &str,
        target_revision: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE installed_app_versions SET git_hash = ?1, gitops_repo_url = ?2, \
             target_revision = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(git_hash)
        .bind(repo_url)
        .bind(target_revision)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::VersionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn insert_app_version_history(
        &self,
        history: &InstalledAppVersionHistory,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO installed_app_version_histories (id, version_id, git_hash, created_by, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(history.id.as_ref())
        .bind(history.version_id.as_ref())
        .bind(&history.git_hash)
        .bind(history.created_by)
        .bind(history.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_app_version_history(&self, id: &Id) -> Result<InstalledAppVersionHistory> {
        let row = sqlx::query_as::<_, HistoryRow>(
            "SELECT id, version_id, git_hash, created_by, created_at \
             FROM installed_app_version_histories WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::HistoryNotFound(id.to_string()))?;
        Ok(row.into_history())
    }

    pub async fn update_history_git_hash(
        &self,
        conn: &mut SqliteConnection,
        history_id: &Id,
        git_hash: &str,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE installed_app_version_histories SET git_hash = ?1 WHERE id = ?2")
                .bind(git_hash)
                .bind(history_id.as_ref())
                .execute(&mut *conn)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::HistoryNotFound(history_id.to_string()));
        }
        Ok(())
    }

    // --- App status ---

    pub async fn upsert_app_status(
        &self,
        app_id: i64,
        environment_id: i64,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO app_status (app_id, environment_id, status, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(app_id, environment_id) DO UPDATE SET \
             status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(app_id)
        .bind(environment_id)
        .bind(status)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_app_status(
        &self,
        app_id: i64,
        environment_id: i64,
    ) -> Result<Option<AppStatus>> {
        let row: Option<(i64, i64, String, i64)> = sqlx::query_as(
            "SELECT app_id, environment_id, status, updated_at FROM app_status \
             WHERE app_id = ?1 AND environment_id = ?2",
        )
        .bind(app_id)
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(app_id, environment_id, status, updated_at)| AppStatus {
            app_id,
            environment_id,
            status,
            updated_at: from_millis(updated_at),
        }))
    }

    // --- Configuration history ---

    pub async fn config_history_exists(
        &self,
        conn: &mut SqliteConnection,
        pipeline_id: i64,
        component: ConfigComponent,
        deployed_on: DateTime<Utc>,
    ) -> Result<bool> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM config_histories \
             WHERE pipeline_id = ?1 AND component = ?2 AND deployed_on = ?3",
        )
        .bind(pipeline_id)
        .bind(component.as_str())
        .bind(deployed_on.timestamp_millis())
        .fetch_one(&mut *conn)
        .await?;
        Ok(count.0 > 0)
    }

    pub async fn insert_config_history(
        &self,
        conn: &mut SqliteConnection,
        history: &ConfigHistory,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO config_histories (id, pipeline_id, component, snapshot, run_id, \
             deployed_on, deployed_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(history.id.as_ref())
        .bind(history.pipeline_id)
        .bind(history.component.as_str())
        .bind(&history.snapshot)
        .bind(history.run_id.as_ref().map(AsRef::as_ref))
        .bind(history.deployed_on.timestamp_millis())
        .bind(history.deployed_by)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Configuration history rows of a pipeline, newest first, optionally
    /// restricted to one run.
    pub async fn list_config_histories(
        &self,
        pipeline_id: i64,
        run_id: Option<&Id>,
    ) -> Result<Vec<ConfigHistory>> {
        let base = "SELECT id, pipeline_id, component, snapshot, run_id, deployed_on, \
                    deployed_by FROM config_histories WHERE pipeline_id = ?1";
        let rows = match run_id {
            Some(run_id) => {
                sqlx::query_as::<_, ConfigHistoryRow>(&format!(
                    "{base} AND run_id = ?2 ORDER BY deployed_on DESC, rowid ASC"
                ))
                .bind(pipeline_id)
                .bind(run_id.as_ref())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ConfigHistoryRow>(&format!(
                    "{base} ORDER BY deployed_on DESC, rowid ASC"
                ))
                .bind(pipeline_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().filter_map(ConfigHistoryRow::into_history).collect())
    }

    // --- Report TSV export ---

    /// Export a run's timeline to a TSV report file.
    pub async fn export_timeline_report(&self, run_id: &Id, report_path: &Path) -> Result<()> {
        self.get_run(run_id).await?;
        let entries = self
            .list_timelines(&TimelineOwner::Runner(run_id.clone()))
            .await?;

        let rows = report::rows_from_timeline(&entries);
        report::write_report(report_path, &rows).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    app_id: i64,
    app_name: String,
    environment_id: i64,
    environment_name: String,
    namespace: String,
    cluster_id: i64,
    deployment_app_name: String,
    deployment_app_type: String,
    deployment_app_created: bool,
}

impl PipelineRow {
    fn into_pipeline(self) -> Pipeline {
        Pipeline {
            id: self.id,
            app_id: self.app_id,
            app_name: self.app_name,
            environment_id: self.environment_id,
            environment_name: self.environment_name,
            namespace: self.namespace,
            cluster_id: self.cluster_id,
            deployment_app_name: self.deployment_app_name,
            deployment_app_type: DeploymentAppType::parse(&self.deployment_app_type)
                .unwrap_or(DeploymentAppType::Helm),
            deployment_app_created: self.deployment_app_created,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    pipeline_id: i64,
    workflow_type: String,
    release_kind: String,
    name: String,
    status: String,
    pod_status: Option<String>,
    pod_name: Option<String>,
    message: Option<String>,
    reference_id: Option<String>,
    triggered_by: i32,
    started_at: i64,
    finished_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    updated_by: i32,
}

impl RunRow {
    fn into_run(self) -> DeploymentRun {
        DeploymentRun {
            id: Id::from_string(self.id),
            pipeline_id: self.pipeline_id,
            workflow_type: WorkflowType::parse(&self.workflow_type).unwrap_or(WorkflowType::Deploy),
            release_kind: ReleaseKind::parse(&self.release_kind),
            name: self.name,
            status: RunStatus::parse(&self.status),
            pod_status: self.pod_status,
            pod_name: self.pod_name,
            message: self.message,
            reference_id: self.reference_id,
            triggered_by: self.triggered_by,
            started_at: from_millis(self.started_at),
            finished_at: self.finished_at.map(from_millis),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            updated_by: self.updated_by,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: String,
    run_id: String,
    workflow_type: String,
    stage_name: String,
    status_for: String,
    status: String,
    message: String,
    start_time: Option<i64>,
    end_time: Option<i64>,
    metadata: Option<String>,
}

impl StageRow {
    /// Rows with an unrecognized stage name or type are skipped.
    fn into_stage(self) -> Option<WorkflowStage> {
        Some(WorkflowStage {
            id: Id::from_string(self.id),
            run_id: Id::from_string(self.run_id),
            workflow_type: WorkflowType::parse(&self.workflow_type)?,
            stage_name: StageName::parse(&self.stage_name)?,
            status_for: StatusFor::parse(&self.status_for)?,
            status: StageStatus::parse(&self.status),
            message: self.message,
            start_time: self.start_time.map(from_millis),
            end_time: self.end_time.map(from_millis),
            metadata: self.metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TimelineRow {
    id: String,
    owner_kind: String,
    owner_id: String,
    status: String,
    status_detail: String,
    status_time: i64,
    created_by: i32,
}

impl TimelineRow {
    fn into_entry(self) -> Option<TimelineEntry> {
        Some(TimelineEntry {
            id: Id::from_string(self.id),
            owner: TimelineOwner::from_parts(&self.owner_kind, self.owner_id)?,
            status: TimelineStatus::parse(&self.status)?,
            status_detail: self.status_detail,
            status_time: from_millis(self.status_time),
            created_by: self.created_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: String,
    app_name: String,
    environment_id: i64,
    environment_name: String,
    namespace: String,
    deployment_app_type: String,
    chart_repo_url: String,
    chart_name: String,
    chart_version: String,
    values_override_yaml: String,
    deploy_stage: String,
    last_error: Option<String>,
    git_hash: Option<String>,
    gitops_repo_url: Option<String>,
    target_revision: Option<String>,
    user_id: i32,
    created_at: i64,
    updated_at: i64,
}

impl VersionRow {
    fn into_version(self) -> InstalledAppVersion {
        InstalledAppVersion {
            id: Id::from_string(self.id),
            app_name: self.app_name,
            environment_id: self.environment_id,
            environment_name: self.environment_name,
            namespace: self.namespace,
            deployment_app_type: DeploymentAppType::parse(&self.deployment_app_type)
                .unwrap_or(DeploymentAppType::Helm),
            chart_repo_url: self.chart_repo_url,
            chart_name: self.chart_name,
            chart_version: self.chart_version,
            values_override_yaml: self.values_override_yaml,
            progress: DeployProgress {
                stage: DeployStage::parse(&self.deploy_stage).unwrap_or(DeployStage::Init),
                last_error: self.last_error.as_deref().and_then(DeployErrorKind::parse),
            },
            git_hash: self.git_hash,
            gitops_repo_url: self.gitops_repo_url,
            target_revision: self.target_revision,
            user_id: self.user_id,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    version_id: String,
    git_hash: Option<String>,
    created_by: i32,
    created_at: i64,
}

impl HistoryRow {
    fn into_history(self) -> InstalledAppVersionHistory {
        InstalledAppVersionHistory {
            id: Id::from_string(self.id),
            version_id: Id::from_string(self.version_id),
            git_hash: self.git_hash,
            created_by: self.created_by,
            created_at: from_millis(self.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ConfigHistoryRow {
    id: String,
    pipeline_id: i64,
    component: String,
    snapshot: String,
    run_id: Option<String>,
    deployed_on: i64,
    deployed_by: i32,
}

impl ConfigHistoryRow {
    fn into_history(self) -> Option<ConfigHistory> {
        Some(ConfigHistory {
            id: Id::from_string(self.id),
            pipeline_id: self.pipeline_id,
            component: ConfigComponent::parse(&self.component)?,
            snapshot: self.snapshot,
            run_id: self.run_id.map(Id::from_string),
            deployed_on: from_millis(self.deployed_on),
            deployed_by: self.deployed_by,
        })
    }
}

/// Shared fixtures for storage-backed tests across modules.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub struct TestStorage {
        pub storage: Storage,
        _dir: TempDir,
    }

    pub async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    pub fn test_pipeline(id: i64, app_type: DeploymentAppType) -> Pipeline {
        Pipeline {
            id,
            app_id: 10,
            app_name: "billing".to_string(),
            environment_id: 20,
            environment_name: "prod".to_string(),
            namespace: "billing-prod".to_string(),
            cluster_id: 1,
            deployment_app_name: "billing-prod".to_string(),
            deployment_app_type: app_type,
            deployment_app_created: true,
        }
    }

    /// Insert a deploy run whose creation time is offset by `offset_ms` so
    /// ordering between runs is deterministic.
    /// Overwrite a run unconditionally, as a concurrent writer would.
    pub async fn update_run(storage: &Storage, run: &DeploymentRun) {
        let mut conn = storage.acquire().await.unwrap();
        storage
            .update_runs(&mut conn, std::slice::from_ref(run))
            .await
            .unwrap();
    }

    pub async fn insert_deploy_run(
        storage: &Storage,
        pipeline_id: i64,
        status: RunStatus,
        offset_ms: i64,
    ) -> DeploymentRun {
        let mut run = DeploymentRun::new(pipeline_id, WorkflowType::Deploy, "cd-wf", status, 1);
        run.created_at += chrono::Duration::milliseconds(offset_ms);
        storage.insert_run(&run).await.unwrap();
        run
    }

    pub fn test_version(app_type: DeploymentAppType, progress: DeployProgress) -> InstalledAppVersion {
        let now = Utc::now();
        InstalledAppVersion {
            id: Id::new(),
            app_name: "billing".to_string(),
            environment_id: 20,
            environment_name: "prod".to_string(),
            namespace: "billing-prod".to_string(),
            deployment_app_type: app_type,
            chart_repo_url: "https://charts.example.com".to_string(),
            chart_name: "billing".to_string(),
            chart_version: "1.2.3".to_string(),
            values_override_yaml: "replicaCount: 2\n".to_string(),
            progress,
            git_hash: None,
            gitops_repo_url: None,
            target_revision: None,
            user_id: 1,
            created_at: now,
            updated_at: now,
        }
    }
}
