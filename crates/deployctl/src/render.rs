//! Output rendering for deployctl.

use std::collections::BTreeMap;

use deploy_core::types::{DeploymentRun, InstalledAppVersion, Pipeline, WorkflowStage};
use deploy_core::TimelineEntry;

pub fn print_pipeline_list(pipelines: &[Pipeline]) {
    if pipelines.is_empty() {
        println!("No pipelines found.");
        return;
    }

    println!(
        "{:<6}  {:<24}  {:<16}  {:<8}  {:<7}",
        "ID", "APP", "ENVIRONMENT", "TYPE", "CREATED"
    );
    println!("{}", "-".repeat(70));
    for p in pipelines {
        println!(
            "{:<6}  {:<24}  {:<16}  {:<8}  {:<7}",
            p.id,
            truncate(&p.deployment_app_name, 24),
            truncate(&p.environment_name, 16),
            p.deployment_app_type.as_str(),
            if p.deployment_app_created { "yes" } else { "no" },
        );
    }
}

pub fn print_run_created(run: &DeploymentRun, superseded: &[String]) {
    println!("Created run: {}", run.id);
    println!("  Pipeline: {}", run.pipeline_id);
    println!("  Type:     {}", run.workflow_type.as_str());
    println!("  Status:   {}", run.status.as_str());
    for id in superseded {
        println!("  Superseded: {id}");
    }
}

pub fn print_run_list(runs: &[DeploymentRun]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<36}  {:<8}  {:<6}  {:<14}  {:<20}",
        "ID", "PIPELINE", "TYPE", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(92));

    for run in runs {
        println!(
            "{:<36}  {:<8}  {:<6}  {:<14}  {:<20}",
            run.id.0,
            run.pipeline_id,
            run.workflow_type.as_str(),
            run.status.as_str(),
            format_time(&run.created_at),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print a run with its stage records and timeline.
pub fn print_run_details(
    run: &DeploymentRun,
    stages: &BTreeMap<String, Vec<WorkflowStage>>,
    timeline: &[TimelineEntry],
) {
    println!("Run: {}", run.id);
    println!();
    println!("  Name:        {}", run.name);
    println!("  Pipeline:    {}", run.pipeline_id);
    println!("  Type:        {}", run.workflow_type.as_str());
    println!("  Release:     {}", run.release_kind.as_str());
    println!("  Status:      {}", run.status.as_str());
    if let Some(pod) = &run.pod_name {
        println!(
            "  Pod:         {} ({})",
            pod,
            run.pod_status.as_deref().unwrap_or("-")
        );
    }
    if let Some(message) = &run.message {
        println!("  Message:     {message}");
    }
    println!("  Started:     {}", format_time(&run.started_at));
    if let Some(finished) = &run.finished_at {
        println!("  Finished:    {}", format_time(finished));
    }

    if !stages.is_empty() {
        println!();
        println!("  Stages:");
        println!(
            "    {:<8}  {:<14}  {:<12}  {:<20}",
            "FOR", "STAGE", "STATUS", "ENDED"
        );
        println!("    {}", "-".repeat(60));
        for (status_for, records) in stages {
            for stage in records {
                println!(
                    "    {:<8}  {:<14}  {:<12}  {:<20}",
                    status_for,
                    stage.stage_name.as_str(),
                    stage.status.as_str(),
                    stage.end_time.as_ref().map_or_else(|| "-".to_string(), format_time),
                );
            }
        }
    }

    print_timeline(timeline);
}

pub fn print_timeline(timeline: &[TimelineEntry]) {
    if timeline.is_empty() {
        return;
    }
    println!();
    println!("  Timeline:");
    for entry in timeline {
        println!(
            "    {}  {:<28}  {}",
            format_time(&entry.status_time),
            entry.status.as_str(),
            entry.status_detail
        );
    }
}

pub fn print_deployment(version: &InstalledAppVersion) {
    println!("Deployment: {}", version.id);
    println!();
    println!("  App:       {}", version.deployment_app_name());
    println!("  Namespace: {}", version.namespace);
    println!("  Type:      {}", version.deployment_app_type.as_str());
    println!(
        "  Chart:     {}/{}@{}",
        version.chart_repo_url, version.chart_name, version.chart_version
    );
    println!("  Status:    {}", version.status().as_str());
    if let Some(hash) = &version.git_hash {
        println!("  Commit:    {hash}");
    }
    println!("  Updated:   {}", format_time(&version.updated_at));
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_values() {
        assert_eq!(truncate("billing", 10), "billing");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }
}
