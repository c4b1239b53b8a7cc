//! Stage model reducers for workflow runs.
//!
//! Two independent reducers consume the same raw signal from the workflow
//! engine: [`update_pod_stages`] drives the pod-level stage from the pod phase,
//! and [`update_workflow_stages`] drives the preparation and execution stages
//! and recomputes the run status. Both are pure; callers load and persist.
//!
//! A stage that reached a terminal status is never written again.

use crate::types::{
    Id, PodPhase, RunStatus, StageName, StageStatus, StatusFor, WorkflowStage, WorkflowType,
};
use chrono::{DateTime, Utc};

/// One raw status report from the workflow engine.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowSignal<'a> {
    pub wf_status: &'a str,
    pub pod_status: &'a str,
    pub message: &'a str,
    pub pod_name: &'a str,
}

/// Stage records created when a run starts.
pub fn default_stages(
    run_id: &Id,
    workflow_type: WorkflowType,
    now: DateTime<Utc>,
) -> Vec<WorkflowStage> {
    let stage = |stage_name, status_for, status, start_time| WorkflowStage {
        id: Id::new(),
        run_id: run_id.clone(),
        workflow_type,
        stage_name,
        status_for,
        status,
        message: String::new(),
        start_time,
        end_time: None,
        metadata: None,
    };
    vec![
        stage(
            StageName::Preparation,
            StatusFor::Workflow,
            StageStatus::Running,
            Some(now),
        ),
        stage(
            StageName::Execution,
            StatusFor::Workflow,
            StageStatus::NotStarted,
            None,
        ),
        stage(
            StageName::PodExecution,
            StatusFor::Pod,
            StageStatus::NotStarted,
            None,
        ),
    ]
}

/// Map a raw workflow status (plus its message) onto the stage status domain.
pub fn convert_status_to_stage_status(wf_status: &str, message: &str) -> StageStatus {
    match wf_status.trim().to_ascii_lowercase().as_str() {
        "running" | "progressing" => StageStatus::Running,
        // Application health arrives after the workflow itself completed.
        "succeeded" | "healthy" | "degraded" => StageStatus::Succeeded,
        "failed" | "error" | "errored" => failure_from_message(message),
        "timedout" | "timeout" => StageStatus::Timeout,
        "aborted" | "cancelled" | "canceled" | "cancel" => StageStatus::Aborted,
        "pending" | "waitingtostart" | "starting" | "queued" => StageStatus::NotStarted,
        _ => StageStatus::Unknown,
    }
}

fn failure_from_message(message: &str) -> StageStatus {
    let message = message.to_ascii_lowercase();
    if message.contains("deadline exceeded")
        || message.contains("timeout")
        || message.contains("timed out")
    {
        StageStatus::Timeout
    } else if message.contains("abort") || message.contains("cancel") {
        StageStatus::Aborted
    } else {
        StageStatus::Failed
    }
}

/// Merge the stored run status with an incoming raw status.
///
/// A terminal stored status always wins. Otherwise a terminal incoming status
/// wins over the candidate derived from the pod phase.
pub fn compute_workflow_status(
    current: RunStatus,
    incoming: RunStatus,
    candidate: RunStatus,
) -> RunStatus {
    if current.is_terminal() {
        current
    } else if incoming.is_terminal() {
        incoming
    } else {
        candidate
    }
}

/// Reduce the pod phase onto pod-level stages.
///
/// Returns the pod status to persist: the incoming one, unless the stored pod
/// status is already terminal.
pub fn update_pod_stages(
    stages: &mut [WorkflowStage],
    signal: &WorkflowSignal<'_>,
    current_pod_status: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let updated_pod_status = match current_pod_status {
        Some(current) if RunStatus::parse(current).is_terminal() => current.to_string(),
        _ => signal.pod_status.to_string(),
    };

    let phase = PodPhase::parse(signal.pod_status);
    for stage in stages.iter_mut().filter(|s| s.status_for == StatusFor::Pod) {
        if !signal.pod_name.is_empty() {
            stage.metadata = Some(serde_json::json!({ "podName": signal.pod_name }).to_string());
        }
        if stage.status.is_terminal() {
            continue;
        }

        match phase {
            PodPhase::Pending => {
                stage.message = signal.message.to_string();
                stage.status = StageStatus::NotStarted;
            }
            PodPhase::Running => {
                if matches!(stage.status, StageStatus::NotStarted | StageStatus::Unknown) {
                    stage.message = signal.message.to_string();
                    stage.status = StageStatus::Running;
                    stage.start_time = Some(now);
                }
            }
            PodPhase::Succeeded => {
                // The pod may finish before a running phase was ever observed.
                stage.message = signal.message.to_string();
                stage.status = StageStatus::Succeeded;
                stage.start_time.get_or_insert(now);
                stage.end_time = Some(now);
            }
            PodPhase::Failed | PodPhase::Error => {
                stage.message = signal.message.to_string();
                stage.status = StageStatus::Failed;
                stage.start_time.get_or_insert(now);
                stage.end_time = Some(now);
            }
            PodPhase::Other(_) => {
                stage.message = signal.message.to_string();
                stage.status = StageStatus::Unknown;
                stage.end_time = Some(now);
            }
        }
    }
    updated_pod_status
}

/// Reduce the signal onto workflow-level stages and recompute the run status.
pub fn update_workflow_stages(
    stages: &mut [WorkflowStage],
    signal: &WorkflowSignal<'_>,
    current: RunStatus,
    now: DateTime<Utc>,
) -> RunStatus {
    let incoming = RunStatus::parse(signal.wf_status);
    let extracted = convert_status_to_stage_status(signal.wf_status, signal.message);
    let mut updated = current;

    match PodPhase::parse(signal.pod_status) {
        PodPhase::Pending => {
            updated = compute_workflow_status(current, incoming, RunStatus::WaitingToStart);
            for stage in stages.iter_mut() {
                if stage.status.is_terminal() {
                    continue;
                }
                match stage.stage_name {
                    StageName::Preparation if extracted != StageStatus::NotStarted => {
                        stage.status = extracted;
                    }
                    // The pod can vanish before it reports a final phase.
                    StageName::PodExecution if incoming.is_terminal() && extracted.is_terminal() => {
                        stage.status = extracted;
                        stage.end_time = Some(now);
                    }
                    _ => {}
                }
            }
        }
        PodPhase::Running => {
            updated = compute_workflow_status(current, incoming, RunStatus::Running);
            for stage in workflow_stages(stages) {
                match (stage.stage_name, stage.status) {
                    (StageName::Preparation, StageStatus::Running) => {
                        stage.status = StageStatus::Succeeded;
                        stage.end_time = Some(now);
                    }
                    (StageName::Execution, StageStatus::NotStarted) => {
                        stage.status = StageStatus::Running;
                        stage.start_time = Some(now);
                    }
                    (StageName::Execution, StageStatus::Running) if extracted.is_terminal() => {
                        stage.status = extracted;
                        stage.end_time = Some(now);
                    }
                    _ => {}
                }
            }
        }
        PodPhase::Succeeded => {
            updated = compute_workflow_status(current, incoming, RunStatus::Succeeded);
            for stage in workflow_stages(stages) {
                if stage.stage_name == StageName::Execution && stage.status == StageStatus::Running
                {
                    stage.status = StageStatus::Succeeded;
                    stage.end_time = Some(now);
                }
            }
        }
        PodPhase::Failed | PodPhase::Error => {
            updated = compute_workflow_status(current, incoming, RunStatus::Failed);
            for stage in workflow_stages(stages) {
                let closes = match stage.stage_name {
                    StageName::Execution => stage.status == StageStatus::Running,
                    StageName::Preparation => !stage.status.is_terminal(),
                    StageName::PodExecution => false,
                };
                if !closes || !extracted.is_terminal() {
                    continue;
                }
                stage.status = extracted;
                stage.end_time = Some(now);
                if !current.is_terminal() {
                    match extracted {
                        StageStatus::Timeout => updated = RunStatus::TimedOut,
                        StageStatus::Aborted => updated = RunStatus::Cancelled,
                        _ => {}
                    }
                }
            }
        }
        PodPhase::Other(_) => {
            for stage in workflow_stages(stages) {
                if stage.stage_name == StageName::Execution && stage.status == StageStatus::Running
                {
                    stage.status = StageStatus::Unknown;
                    if !current.is_terminal() {
                        updated = RunStatus::Unknown;
                    }
                }
            }
        }
    }
    updated
}

fn workflow_stages(stages: &mut [WorkflowStage]) -> impl Iterator<Item = &mut WorkflowStage> {
    stages
        .iter_mut()
        .filter(|s| s.status_for == StatusFor::Workflow)
}

/// Apply both reducers: pod stages first, then workflow stages.
///
/// Returns the run status and pod status to persist.
pub fn reduce(
    stages: &mut [WorkflowStage],
    signal: &WorkflowSignal<'_>,
    current_status: RunStatus,
    current_pod_status: Option<&str>,
    now: DateTime<Utc>,
) -> (RunStatus, String) {
    let pod_status = update_pod_stages(stages, signal, current_pod_status, now);
    let wf_status = update_workflow_stages(stages, signal, current_status, now);
    (wf_status, pod_status)
}
