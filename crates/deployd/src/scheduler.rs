//! Trigger queue and consumer.
//!
//! Deploy triggers travel through a bounded in-process queue with
//! at-least-once semantics: the consumer validates each message, runs the
//! deploy stage under a concurrency limit, and redelivers the message with an
//! incremented delivery count when the stage fails.

use crate::advisory::AdvisoryResultExt;
use crate::orchestrator::DeployOrchestrator;
use crate::storage::Storage;
use crate::supersede::TriggerValidator;
use deploy_core::{DeployTrigger, TriggerMessage};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("trigger queue is full")]
    QueueFull,
    #[error("trigger queue is closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Publishing half of the trigger queue.
#[derive(Debug, Clone)]
pub struct TriggerQueue {
    tx: mpsc::Sender<TriggerMessage>,
}

/// Create a bounded trigger queue.
pub fn trigger_queue(capacity: usize) -> (TriggerQueue, mpsc::Receiver<TriggerMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TriggerQueue { tx }, rx)
}

impl TriggerQueue {
    /// Publish a first delivery of `trigger`. Returns the message id.
    pub fn publish(&self, trigger: DeployTrigger) -> Result<String> {
        let msg = TriggerMessage {
            msg_id: uuid::Uuid::now_v7().to_string(),
            deliver_count: 1,
            payload: trigger,
        };
        let msg_id = msg.msg_id.clone();
        self.send(msg)?;
        Ok(msg_id)
    }

    /// Put a message back on the queue with the same id.
    pub fn redeliver(&self, mut msg: TriggerMessage) -> Result<()> {
        msg.deliver_count += 1;
        self.send(msg)
    }

    fn send(&self, msg: TriggerMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SchedulerError::QueueFull,
            TrySendError::Closed(_) => SchedulerError::QueueClosed,
        })
    }
}

/// Drains the trigger queue into the deploy orchestrator.
pub struct TriggerConsumer {
    storage: Arc<Storage>,
    orchestrator: Arc<DeployOrchestrator>,
    validators: Vec<Arc<dyn TriggerValidator>>,
    queue: TriggerQueue,
    /// Semaphore for concurrency limiting (backpressure).
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    max_deliveries: u32,
    redelivery_delay: Duration,
}

impl TriggerConsumer {
    pub fn new(
        storage: Arc<Storage>,
        orchestrator: Arc<DeployOrchestrator>,
        validators: Vec<Arc<dyn TriggerValidator>>,
        queue: TriggerQueue,
        max_concurrent: usize,
        max_deliveries: u32,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            storage,
            orchestrator,
            validators,
            queue,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_deliveries: max_deliveries.max(1),
            redelivery_delay: DEFAULT_REDELIVERY_DELAY,
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Number of deploy stages currently executing.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Consume messages until `cancel` fires or the queue closes, then wait
    /// for in-flight deploy stages to finish.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TriggerMessage>,
        cancel: CancellationToken,
    ) {
        tracing::info!(max_concurrent = self.max_concurrent, "trigger consumer started");
        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if !self.validate(&msg).await {
                continue;
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let consumer = Arc::clone(&self);
            tokio::spawn(async move {
                consumer.handle(msg).await;
                drop(permit);
            });
        }

        tracing::info!(in_flight = self.in_flight(), "trigger consumer draining");
        if let Ok(all) = self.permits.acquire_many(self.max_concurrent as u32).await {
            drop(all);
        }
        tracing::info!("trigger consumer stopped");
    }

    async fn validate(&self, msg: &TriggerMessage) -> bool {
        for validator in &self.validators {
            if !validator.validate(msg).await {
                tracing::info!(
                    msg_id = %msg.msg_id,
                    deliver_count = msg.deliver_count,
                    "trigger rejected by validator"
                );
                return false;
            }
        }
        true
    }

    async fn handle(&self, msg: TriggerMessage) {
        let trigger = &msg.payload;
        tracing::info!(
            msg_id = %msg.msg_id,
            version_id = %trigger.version_id,
            deliver_count = msg.deliver_count,
            "handling deploy trigger"
        );
        let result = self
            .orchestrator
            .perform_deploy_stage(&trigger.version_id, &trigger.history_id, trigger.user_id)
            .await;

        let err = match result {
            Ok(version) => {
                tracing::info!(
                    msg_id = %msg.msg_id,
                    version_id = %version.id,
                    status = version.status().as_str(),
                    "deploy trigger done"
                );
                self.bind_run(&msg).await;
                return;
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(msg_id = %msg.msg_id, error = %e, "dropping trigger for unknown version");
                return;
            }
            Err(e) => e,
        };

        if msg.deliver_count >= self.max_deliveries {
            tracing::error!(
                msg_id = %msg.msg_id,
                version_id = %trigger.version_id,
                deliver_count = msg.deliver_count,
                error = %err,
                "deploy trigger exhausted its deliveries"
            );
            return;
        }

        tracing::warn!(
            msg_id = %msg.msg_id,
            deliver_count = msg.deliver_count,
            error = %err,
            "deploy stage failed, redelivering"
        );
        tokio::time::sleep(self.redelivery_delay).await;
        if let Err(e) = self.queue.redeliver(msg) {
            tracing::error!(error = %e, "failed to redeliver deploy trigger");
        }
    }

    /// Stamp the message id on the trigger's run so later deliveries of the
    /// same message are rejected as duplicates.
    async fn bind_run(&self, msg: &TriggerMessage) {
        let Some(run_id) = &msg.payload.run_id else {
            return;
        };
        if let Some(false) = self
            .storage
            .stamp_run_reference_id(run_id, &msg.msg_id)
            .await
            .advisory("stamp trigger message on run")
        {
            tracing::warn!(
                msg_id = %msg.msg_id,
                run_id = %run_id,
                "run already carries a reference id"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::FakeDeployer;
    use crate::orchestrator::test_support::FakeGitOps;
    use crate::storage::Storage;
    use crate::supersede::DuplicateTriggerValidator;
    use crate::timeline::TimelineRecorder;
    use chrono::Utc;
    use deploy_core::{
        DeployProgress, DeployStatus, DeploymentAppType, DeploymentRun, Id,
        InstalledAppVersionHistory, RunStatus, TimelineOwner, TimelineStatus, WorkflowType,
    };
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        gitops: Arc<FakeGitOps>,
        orchestrator: Arc<DeployOrchestrator>,
        _dir: TempDir,
    }

    async fn fixture(gitops: FakeGitOps) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let gitops = Arc::new(gitops);
        let deployer = Arc::new(FakeDeployer::default());
        let orchestrator = Arc::new(DeployOrchestrator::new(
            storage.clone(),
            TimelineRecorder::new(storage.clone(), 255),
            gitops.clone(),
            deployer.clone(),
            deployer,
            false,
        ));
        Fixture {
            storage,
            gitops,
            orchestrator,
            _dir: dir,
        }
    }

    async fn seed_trigger(storage: &Storage) -> DeployTrigger {
        let version = crate::storage::test_support::test_version(
            DeploymentAppType::GitOps,
            DeployProgress::default(),
        );
        storage.insert_app_version(&version).await.unwrap();
        let history = InstalledAppVersionHistory {
            id: Id::new(),
            version_id: version.id.clone(),
            git_hash: None,
            created_by: 1,
            created_at: Utc::now(),
        };
        storage.insert_app_version_history(&history).await.unwrap();
        DeployTrigger {
            version_id: version.id,
            history_id: history.id,
            user_id: 1,
            run_id: None,
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn publish_and_redeliver_track_delivery_count() {
        let (queue, mut rx) = trigger_queue(2);
        let trigger = DeployTrigger {
            version_id: Id::new(),
            history_id: Id::new(),
            user_id: 1,
            run_id: None,
        };

        let msg_id = queue.publish(trigger).unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.msg_id, msg_id);
        assert_eq!(first.deliver_count, 1);

        queue.redeliver(first).unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(second.msg_id, msg_id);
        assert_eq!(second.deliver_count, 2);
    }

    #[test]
    fn publish_reports_full_and_closed_queue() {
        let (queue, rx) = trigger_queue(1);
        let trigger = DeployTrigger {
            version_id: Id::new(),
            history_id: Id::new(),
            user_id: 1,
            run_id: None,
        };
        queue.publish(trigger.clone()).unwrap();
        assert!(matches!(
            queue.publish(trigger.clone()),
            Err(SchedulerError::QueueFull)
        ));
        drop(rx);
        assert!(matches!(
            queue.publish(trigger),
            Err(SchedulerError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn consumer_runs_deploy_stage() {
        let f = fixture(FakeGitOps::default()).await;
        let trigger = seed_trigger(&f.storage).await;
        let version_id = trigger.version_id.clone();
        let (queue, rx) = trigger_queue(8);
        let consumer = Arc::new(TriggerConsumer::new(
            f.storage.clone(),
            f.orchestrator.clone(),
            Vec::new(),
            queue.clone(),
            2,
            3,
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&consumer).run(rx, cancel.clone()));

        queue.publish(trigger).unwrap();
        let storage = f.storage.clone();
        wait_for(|| {
            let storage = storage.clone();
            let version_id = version_id.clone();
            async move {
                storage.get_app_version(&version_id).await.unwrap().status()
                    == DeployStatus::DeploySuccess
            }
        })
        .await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(f.gitops.commits(), 1);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn failing_stage_is_redelivered_until_exhausted() {
        let f = fixture(FakeGitOps::failing("remote rejected")).await;
        let trigger = seed_trigger(&f.storage).await;
        let (queue, rx) = trigger_queue(8);
        let consumer = Arc::new(
            TriggerConsumer::new(
                f.storage.clone(),
                f.orchestrator.clone(),
                Vec::new(),
                queue.clone(),
                1,
                3,
            )
                .with_redelivery_delay(Duration::from_millis(5)),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&consumer).run(rx, cancel.clone()));

        queue.publish(trigger.clone()).unwrap();
        let gitops = f.gitops.clone();
        wait_for(|| {
            let gitops = gitops.clone();
            async move { gitops.commits() == 3 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(f.gitops.commits(), 3);
        assert_eq!(
            f.storage
                .get_app_version(&trigger.version_id)
                .await
                .unwrap()
                .status(),
            DeployStatus::GitError
        );
    }

    #[tokio::test]
    async fn duplicate_redelivery_is_rejected() {
        let f = fixture(FakeGitOps::default()).await;
        let trigger = seed_trigger(&f.storage).await;
        let mut run = DeploymentRun::new(1, WorkflowType::Deploy, "cd-wf", RunStatus::Starting, 1);
        run.reference_id = Some("msg-already-seen".to_string());
        f.storage.insert_run(&run).await.unwrap();

        let (queue, rx) = trigger_queue(8);
        let consumer = Arc::new(TriggerConsumer::new(
            f.storage.clone(),
            f.orchestrator.clone(),
            vec![Arc::new(DuplicateTriggerValidator::new(f.storage.clone()))],
            queue.clone(),
            1,
            3,
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&consumer).run(rx, cancel.clone()));

        queue
            .redeliver(TriggerMessage {
                msg_id: "msg-already-seen".to_string(),
                deliver_count: 1,
                payload: trigger.clone(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(f.gitops.commits(), 0);
        assert_eq!(
            f.storage
                .get_app_version(&trigger.version_id)
                .await
                .unwrap()
                .status(),
            DeployStatus::Init
        );
    }

    #[tokio::test]
    async fn trigger_delivered_again_after_success_is_dropped() {
        let f = fixture(FakeGitOps::default()).await;
        let mut trigger = seed_trigger(&f.storage).await;
        let run = DeploymentRun::new(1, WorkflowType::Deploy, "cd-wf", RunStatus::Starting, 1);
        f.storage.insert_run(&run).await.unwrap();
        trigger.run_id = Some(run.id.clone());

        let (queue, rx) = trigger_queue(8);
        let consumer = Arc::new(TriggerConsumer::new(
            f.storage.clone(),
            f.orchestrator.clone(),
            vec![Arc::new(DuplicateTriggerValidator::new(f.storage.clone()))],
            queue.clone(),
            1,
            3,
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&consumer).run(rx, cancel.clone()));

        let msg_id = queue.publish(trigger.clone()).unwrap();
        let storage = f.storage.clone();
        let run_id = run.id.clone();
        let expected = msg_id.clone();
        wait_for(|| {
            let storage = storage.clone();
            let run_id = run_id.clone();
            let expected = expected.clone();
            async move {
                storage.get_run(&run_id).await.unwrap().reference_id.as_deref()
                    == Some(expected.as_str())
            }
        })
        .await;

        // The broker hands out the same message a second time.
        queue
            .redeliver(TriggerMessage {
                msg_id,
                deliver_count: 1,
                payload: trigger.clone(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(f.gitops.commits(), 1);
        let timeline = f
            .storage
            .list_timelines(&TimelineOwner::AppHistory(trigger.history_id.clone()))
            .await
            .unwrap();
        let initiated = timeline
            .iter()
            .filter(|e| e.status == TimelineStatus::DeploymentInitiated)
            .count();
        assert_eq!(initiated, 1);
    }
}
