//! Deployed configuration history.
//!
//! Every deploy trigger records the configuration it shipped: deployment
//! template, config maps, secrets and deployment strategy. A component is
//! written at most once per (pipeline, deployed_on), so a redelivered trigger
//! does not duplicate rows.

use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use deploy_core::{ConfigComponent, ConfigHistory, Id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Configuration shipped with one deploy trigger. Absent components are not
/// recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_template: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<serde_json::Value>,
}

impl DeploymentSnapshot {
    fn component(&self, component: ConfigComponent) -> Option<&serde_json::Value> {
        match component {
            ConfigComponent::DeploymentTemplate => self.deployment_template.as_ref(),
            ConfigComponent::ConfigMap => self.config_map.as_ref(),
            ConfigComponent::Secret => self.secret.as_ref(),
            ConfigComponent::Strategy => self.strategy.as_ref(),
        }
    }
}

/// Recorded configuration keyed by component name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployedConfiguration {
    pub pipeline_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_on: Option<DateTime<Utc>>,
    pub components: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ConfigHistoryService {
    storage: Arc<Storage>,
}

impl ConfigHistoryService {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record each component of `snapshot` that has no row yet for
    /// (pipeline, component, deployed_on). Returns the components written.
    pub async fn create_histories_for_deployment_trigger(
        &self,
        pipeline_id: i64,
        snapshot: &DeploymentSnapshot,
        deployed_on: DateTime<Utc>,
        deployed_by: i32,
        run_id: Option<&Id>,
    ) -> Result<Vec<ConfigComponent>> {
        let mut tx = self.storage.begin().await?;
        let mut written = Vec::new();
        for component in ConfigComponent::ALL {
            let Some(value) = snapshot.component(component) else {
                continue;
            };
            if self
                .storage
                .config_history_exists(&mut tx, pipeline_id, component, deployed_on)
                .await?
            {
                tracing::debug!(
                    pipeline_id,
                    component = component.as_str(),
                    "config history already recorded"
                );
                continue;
            }
            let history = ConfigHistory {
                id: Id::new(),
                pipeline_id,
                component,
                snapshot: serde_json::to_string(value)?,
                run_id: run_id.cloned(),
                deployed_on,
                deployed_by,
            };
            self.storage.insert_config_history(&mut tx, &history).await?;
            written.push(component);
        }
        tx.commit().await.map_err(StorageError::from)?;

        tracing::info!(pipeline_id, written = written.len(), "config histories recorded");
        Ok(written)
    }

    /// Configuration recorded for one run of a pipeline.
    pub async fn deployed_configuration_by_run(
        &self,
        pipeline_id: i64,
        run_id: &Id,
    ) -> Result<DeployedConfiguration> {
        let rows = self
            .storage
            .list_config_histories(pipeline_id, Some(run_id))
            .await?;
        let mut config = collect_latest(pipeline_id, rows);
        config.run_id = Some(run_id.clone());
        Ok(config)
    }

    /// Most recently deployed value of every component of a pipeline.
    pub async fn latest_deployed_configuration(
        &self,
        pipeline_id: i64,
    ) -> Result<DeployedConfiguration> {
        let rows = self.storage.list_config_histories(pipeline_id, None).await?;
        Ok(collect_latest(pipeline_id, rows))
    }
}

/// Keep the first row per component. `rows` arrive newest first.
fn collect_latest(pipeline_id: i64, rows: Vec<ConfigHistory>) -> DeployedConfiguration {
    let mut config = DeployedConfiguration {
        pipeline_id,
        ..DeployedConfiguration::default()
    };
    for row in rows {
        let key = row.component.as_str().to_string();
        if config.components.contains_key(&key) {
            continue;
        }
        config.deployed_on = Some(config.deployed_on.map_or(row.deployed_on, |d| d.max(row.deployed_on)));
        if config.run_id.is_none() {
            config.run_id = row.run_id.clone();
        }
        let value = serde_json::from_str(&row.snapshot)
            .unwrap_or(serde_json::Value::String(row.snapshot));
        config.components.insert(key, value);
    }
    config
}
