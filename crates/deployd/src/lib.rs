//! deployd - deployment control plane daemon
//!
//! Library components for the daemon process: persistence, the deploy stage
//! orchestrator and its trigger queue, supersession, workflow stage tracking,
//! timelines, resource tree reconciliation and the HTTP API.

pub mod advisory;
pub mod cluster;
pub mod gitops;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod resource_tree;
pub mod scheduler;
pub mod server;
pub mod stages;
pub mod storage;
pub mod supersede;
pub mod timeline;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use deploy_core::Config;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cluster::CliClusterClient;
use gitops::LocalGitOpsClient;
use history::ConfigHistoryService;
use metrics::{MetricsSink, TracingMetricsSink};
use orchestrator::DeployOrchestrator;
use resource_tree::ResourceTreeReconciler;
use scheduler::{trigger_queue, TriggerConsumer};
use server::AppState;
use stages::StageTracker;
use storage::Storage;
use supersede::SupersessionManager;
use timeline::TimelineRecorder;

/// Default trigger queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP listen address (default: 127.0.0.1:7800).
    pub bind: SocketAddr,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// Directory timeline reports are written to.
    pub reports_dir: PathBuf,
    pub queue_capacity: usize,
    /// Control plane settings.
    pub core: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("deployd.db"),
            bind: SocketAddr::from(([127, 0, 0, 1], 7800)),
            auth_token: std::env::var("DEPLOYD_AUTH_TOKEN").ok(),
            reports_dir: data_dir.join("reports"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            core: Config::default(),
        }
    }
}

/// Get the default data directory (~/.local/share/deployd).
fn default_data_dir() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("deployd")
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    state: Arc<AppState>,
    consumer: Arc<TriggerConsumer>,
    reconciler: Arc<ResourceTreeReconciler>,
    trigger_rx: Mutex<Option<mpsc::Receiver<deploy_core::TriggerMessage>>>,
    cancel: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let core = &config.core;
        let timelines = TimelineRecorder::new(Arc::clone(&storage), core.timeline_detail_max_len);
        let cluster = Arc::new(CliClusterClient::from_config(core));
        let gitops = Arc::new(LocalGitOpsClient::new(
            core.gitops_repo_root.clone(),
            core.gitops_remote_url.clone(),
            core.git_bin.clone(),
        ));
        let orchestrator = Arc::new(DeployOrchestrator::new(
            Arc::clone(&storage),
            timelines.clone(),
            gitops,
            cluster.clone(),
            cluster.clone(),
            core.argocd_manual_sync,
        ));
        let metrics: Arc<dyn MetricsSink> = Arc::new(TracingMetricsSink);
        let supersession = Arc::new(SupersessionManager::new(
            Arc::clone(&storage),
            timelines.clone(),
            metrics,
            core.expose_cd_metrics,
        ));

        let (queue, trigger_rx) = trigger_queue(config.queue_capacity);
        let consumer = Arc::new(TriggerConsumer::new(
            Arc::clone(&storage),
            Arc::clone(&orchestrator),
            supersession.trigger_validate_funcs(),
            queue.clone(),
            core.max_concurrent_deploys,
            core.max_trigger_deliveries,
        ));
        let reconciler = Arc::new(ResourceTreeReconciler::new(
            Arc::clone(&storage),
            timelines.clone(),
            cluster,
        ));

        let state = Arc::new(AppState {
            stages: StageTracker::new(Arc::clone(&storage), core.enable_workflow_execution_stage),
            history: ConfigHistoryService::new(Arc::clone(&storage)),
            storage,
            orchestrator,
            queue,
            supersession,
            timelines,
            reconciler: Arc::clone(&reconciler),
            reports_dir: config.reports_dir.clone(),
            auth_token: config.auth_token.clone(),
        });

        Ok(Self {
            config,
            state,
            consumer,
            reconciler,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the daemon until [`Daemon::shutdown`] is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        info!("deployd listening on {}", self.config.bind);
        info!("database: {}", self.config.db_path.display());
        info!(
            "max concurrent deploys: {}",
            self.config.core.max_concurrent_deploys
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let trigger_rx = self
            .trigger_rx
            .lock()
            .map_err(|_| "trigger receiver lock poisoned")?
            .take()
            .ok_or("daemon is already running")?;

        let consumer = tokio::spawn(Arc::clone(&self.consumer).run(trigger_rx, self.cancel.clone()));
        let reconciler = (self.config.core.reconcile_interval_sec > 0).then(|| {
            tokio::spawn(Arc::clone(&self.reconciler).run_periodic(
                Duration::from_secs(self.config.core.reconcile_interval_sec),
                self.cancel.clone(),
            ))
        });

        let served = server::start_server(
            Arc::clone(&self.state),
            self.config.bind,
            self.cancel.clone(),
        )
        .await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }

        // Stop background tasks even when the server exited on its own.
        self.cancel.cancel();
        if let Err(e) = consumer.await {
            error!("trigger consumer task failed: {}", e);
        }
        if let Some(handle) = reconciler {
            if let Err(e) = handle.await {
                error!("reconciler task failed: {}", e);
            }
        }
        info!("deployd stopped");

        served.map_err(|e| -> Box<dyn std::error::Error> { e })
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.cancel.cancel();
    }
}
