//! Timeline recorder.
//!
//! Appends immutable status milestones for deployment runs and app version
//! histories. Writes that must be atomic with other changes take the caller's
//! connection; a milestone already recorded for the same owner and status is
//! never written twice through [`TimelineRecorder::save_timelines_if_not_present`].

use crate::storage::{Storage, StorageError};
use deploy_core::timeline::{failed_status_detail, truncate_chars};
use deploy_core::{Id, TimelineEntry, TimelineOwner, TimelineStatus};
use sqlx::SqliteConnection;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, TimelineError>;

#[derive(Debug, Clone)]
pub struct TimelineRecorder {
    storage: Arc<Storage>,
    detail_max_len: usize,
}

impl TimelineRecorder {
    pub fn new(storage: Arc<Storage>, detail_max_len: usize) -> Self {
        Self {
            storage,
            detail_max_len,
        }
    }

    fn bounded(&self, mut entry: TimelineEntry) -> TimelineEntry {
        entry.status_detail = truncate_chars(&entry.status_detail, self.detail_max_len);
        entry
    }

    /// Append one entry on the given connection.
    pub async fn save_timeline(
        &self,
        conn: &mut SqliteConnection,
        entry: TimelineEntry,
    ) -> Result<()> {
        let entry = self.bounded(entry);
        self.storage.insert_timeline(conn, &entry).await?;
        tracing::debug!(
            owner = %entry.owner.id(),
            status = entry.status.as_str(),
            "timeline recorded"
        );
        Ok(())
    }

    /// Append one entry outside any transaction.
    pub async fn save(&self, entry: TimelineEntry) -> Result<()> {
        let mut conn = self.storage.acquire().await?;
        self.save_timeline(&mut conn, entry).await
    }

    /// Append each entry whose (owner, status) is not recorded yet.
    /// Returns the number of entries written.
    pub async fn save_timelines_if_not_present(
        &self,
        conn: &mut SqliteConnection,
        entries: Vec<TimelineEntry>,
    ) -> Result<usize> {
        let mut written = 0;
        for entry in entries {
            if self
                .storage
                .timeline_exists(conn, &entry.owner, entry.status)
                .await?
            {
                tracing::debug!(
                    owner = %entry.owner.id(),
                    status = entry.status.as_str(),
                    "timeline already present, skipping"
                );
                continue;
            }
            self.save_timeline(conn, entry).await?;
            written += 1;
        }
        Ok(written)
    }

    pub async fn mark_superseded(
        &self,
        conn: &mut SqliteConnection,
        run_id: &Id,
        user_id: i32,
    ) -> Result<()> {
        let entry = TimelineEntry::new(
            TimelineOwner::Runner(run_id.clone()),
            TimelineStatus::DeploymentSuperseded,
            user_id,
        );
        self.save_timeline(conn, entry).await
    }

    /// Record a failure with a detail extracted from `message`.
    pub async fn mark_failed(
        &self,
        conn: &mut SqliteConnection,
        run_id: &Id,
        message: &str,
        user_id: i32,
    ) -> Result<()> {
        let entry = TimelineEntry::with_detail(
            TimelineOwner::Runner(run_id.clone()),
            TimelineStatus::DeploymentFailed,
            failed_status_detail(message, self.detail_max_len),
            user_id,
        );
        self.save_timeline(conn, entry).await
    }

    /// Build (without saving) an entry owned by an app version history.
    pub fn new_app_history_entry(
        &self,
        history_id: &Id,
        status: TimelineStatus,
        detail: Option<String>,
        user_id: i32,
    ) -> TimelineEntry {
        let owner = TimelineOwner::AppHistory(history_id.clone());
        let entry = match detail {
            Some(detail) => TimelineEntry::with_detail(owner, status, detail, user_id),
            None => TimelineEntry::new(owner, status, user_id),
        };
        self.bounded(entry)
    }

    pub async fn list(&self, owner: &TimelineOwner) -> Result<Vec<TimelineEntry>> {
        Ok(self.storage.list_timelines(owner).await?)
    }
}
