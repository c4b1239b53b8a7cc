//! Advisory operations.
//!
//! Some side effects must never fail the stage that triggers them: the
//! "deployment initiated" timeline write, metric emission, and app status
//! write-back after a resource tree fetch. Those operations return
//! `Result<T, AdvisoryError>` and call sites log and drop the error through
//! [`AdvisoryResultExt::advisory`] instead of propagating it with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("timeline write failed: {0}")]
    Timeline(#[from] crate::timeline::TimelineError),
    #[error("storage write failed: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("cluster query failed: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),
    #[error("metric emission failed: {0}")]
    Metrics(String),
}

impl AdvisoryError {
    /// Log the failure at `warn` and discard it.
    pub fn log_and_ignore(self, context: &str) {
        tracing::warn!(error = %self, "{context}");
    }
}

pub trait AdvisoryResultExt<T> {
    /// Convert to an advisory result, logging and discarding any error.
    fn advisory(self, context: &str) -> Option<T>;
}

impl<T, E: Into<AdvisoryError>> AdvisoryResultExt<T> for Result<T, E> {
    fn advisory(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                e.into().log_and_ignore(context);
                None
            }
        }
    }
}
