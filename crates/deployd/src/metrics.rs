//! Deployment metrics emission.
//!
//! Metrics are fire-and-forget: emission failures are advisory.

use crate::advisory::AdvisoryError;
use chrono::{DateTime, Utc};
use deploy_core::{DeploymentAppType, DeploymentRun, Id, Pipeline, RunStatus};
use serde::Serialize;

/// Snapshot of a finished (or superseded) deployment run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentMetric {
    pub run_id: Id,
    pub pipeline_id: i64,
    pub app_name: String,
    pub environment_name: String,
    pub deployment_app_type: DeploymentAppType,
    pub status: RunStatus,
    pub triggered_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl DeploymentMetric {
    /// Build a metric from a run and the environment it targets.
    pub fn new(run: &DeploymentRun, pipeline: &Pipeline) -> Self {
        let finished = run.finished_at.unwrap_or_else(Utc::now);
        let duration = (finished - run.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        Self {
            run_id: run.id.clone(),
            pipeline_id: run.pipeline_id,
            app_name: pipeline.app_name.clone(),
            environment_name: pipeline.environment_name.clone(),
            deployment_app_type: pipeline.deployment_app_type,
            status: run.status,
            triggered_at: run.started_at,
            duration_secs: duration,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn emit_deployment_metric(&self, metric: &DeploymentMetric) -> Result<(), AdvisoryError>;
}

/// Emits metrics as structured tracing events under the `deploy_metrics` target.
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn emit_deployment_metric(&self, metric: &DeploymentMetric) -> Result<(), AdvisoryError> {
        tracing::info!(
            target: "deploy_metrics",
            run_id = %metric.run_id,
            pipeline_id = metric.pipeline_id,
            app = %metric.app_name,
            env = %metric.environment_name,
            app_type = metric.deployment_app_type.as_str(),
            status = metric.status.as_str(),
            duration_secs = metric.duration_secs,
            "cd_deployment"
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::WorkflowType;

    #[test]
    fn metric_duration_from_run_times() {
        let mut run = DeploymentRun::new(1, WorkflowType::Deploy, "cd", RunStatus::Failed, 1);
        run.finished_at = Some(run.started_at + chrono::Duration::milliseconds(2_500));
        let pipeline = crate::storage::test_support::test_pipeline(1, DeploymentAppType::Helm);

        let metric = DeploymentMetric::new(&run, &pipeline);
        assert!((metric.duration_secs - 2.5).abs() < f64::EPSILON);
        assert_eq!(metric.app_name, "billing");
        assert_eq!(metric.status, RunStatus::Failed);
        assert!(TracingMetricsSink.emit_deployment_metric(&metric).is_ok());
    }
}
