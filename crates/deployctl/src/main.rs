//! deployctl - CLI client for deployd
//!
//! Inspect pipelines, runs, timelines and resource trees, and drive
//! deployments through the daemon's HTTP API.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use deploy_core::types::{RunStatus, WorkflowType};

/// CLI client for the deployd control plane.
#[derive(Parser)]
#[command(name = "deployctl")]
#[command(about = "Control plane client for deployd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7800)
    #[arg(long, global = true, env = "DEPLOYD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "DEPLOYD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List pipelines
    Pipelines,

    /// Start a run; a deploy run supersedes older runs of the pipeline
    Run {
        /// Pipeline ID
        pipeline_id: i64,

        /// Workflow name
        name: String,

        /// Workflow type: PRE, DEPLOY or POST
        #[arg(long = "type", default_value = "DEPLOY", value_parser = parse_workflow_type)]
        workflow_type: WorkflowType,

        /// Triggering user
        #[arg(long, default_value_t = 1)]
        user: i32,
    },

    /// List runs (optionally filter by pipeline or status)
    List {
        #[arg(long)]
        pipeline: Option<i64>,

        #[arg(long, value_parser = parse_run_status)]
        status: Option<RunStatus>,
    },

    /// Show a run with its stages and timeline
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// Write a non-terminal status to a run
    Status {
        run_id: String,

        #[arg(value_parser = parse_run_status)]
        status: RunStatus,

        #[arg(long, default_value_t = 1)]
        user: i32,
    },

    /// Fail a run
    Fail {
        run_id: String,

        /// Failure message
        #[arg(long, default_value = "")]
        message: String,

        /// Record the failure as a supersession
        #[arg(long)]
        superseded: bool,

        #[arg(long, default_value_t = 1)]
        user: i32,
    },

    /// Supersede every older in-flight run of a pipeline
    Supersede {
        pipeline_id: i64,

        /// The run that stays current
        run_id: String,

        #[arg(long, default_value_t = 1)]
        user: i32,
    },

    /// Show an installed app version
    Deployment {
        version_id: String,

        /// Also show the timeline of this deploy request
        #[arg(long)]
        history: Option<String>,
    },

    /// Enqueue the deploy stages of an installed app version
    Deploy {
        version_id: String,

        /// Reuse an existing history record
        #[arg(long)]
        history: Option<String>,

        /// Run that owns this deploy
        #[arg(long)]
        run: Option<String>,

        #[arg(long, default_value_t = 1)]
        user: i32,
    },

    /// Show the live resource tree of a pipeline
    Tree { pipeline_id: i64 },

    /// Show the deployed configuration of a pipeline
    Config {
        pipeline_id: i64,

        /// Configuration of a specific run (default: latest)
        #[arg(long)]
        run: Option<String>,
    },

    /// Print the timeline report of a run as TSV
    Report { run_id: String },
}

fn parse_run_status(s: &str) -> Result<RunStatus, String> {
    match RunStatus::parse(s) {
        RunStatus::Unknown if !s.trim().eq_ignore_ascii_case("unknown") => {
            Err(format!("invalid status '{s}'"))
        }
        status => Ok(status),
    }
}

fn parse_workflow_type(s: &str) -> Result<WorkflowType, String> {
    WorkflowType::parse(s)
        .ok_or_else(|| format!("invalid workflow type '{s}', expected: PRE, DEPLOY, POST"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7800".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = dispatch(&client, cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(client: &Client, command: Command) -> Result<(), ClientError> {
    match command {
        Command::Pipelines => {
            let pipelines = client.list_pipelines().await?;
            render::print_pipeline_list(&pipelines);
        }
        Command::Run {
            pipeline_id,
            name,
            workflow_type,
            user,
        } => {
            let created = client
                .create_run(&client::CreateRunRequest {
                    pipeline_id,
                    workflow_type,
                    name,
                    triggered_by: user,
                    reference_id: None,
                })
                .await?;
            render::print_run_created(&created.run, &created.superseded);
        }
        Command::List { pipeline, status } => {
            let runs = client.list_runs(pipeline, status).await?;
            render::print_run_list(&runs);
        }
        Command::Inspect { run_id } => {
            let run = client.get_run(&run_id).await?;
            let stages = client.run_stages(&run_id).await?;
            let timeline = client.run_timeline(&run_id).await?;
            render::print_run_details(&run, &stages, &timeline);
        }
        Command::Status {
            run_id,
            status,
            user,
        } => {
            let run = client.update_status(&run_id, status, user).await?;
            println!("Run {} is {}", run.id, run.status.as_str());
        }
        Command::Fail {
            run_id,
            message,
            superseded,
            user,
        } => {
            let run = client.fail_run(&run_id, &message, superseded, user).await?;
            println!("Run {} is {}", run.id, run.status.as_str());
        }
        Command::Supersede {
            pipeline_id,
            run_id,
            user,
        } => {
            let result = client.supersede(pipeline_id, &run_id, user).await?;
            println!(
                "Superseded {} run(s), {} queued run(s)",
                result.superseded.len(),
                result.queued.len()
            );
        }
        Command::Deployment {
            version_id,
            history,
        } => {
            let version = client.get_deployment(&version_id).await?;
            render::print_deployment(&version);
            if let Some(history_id) = history {
                let timeline = client.history_timeline(&history_id).await?;
                render::print_timeline(&timeline);
            }
        }
        Command::Deploy {
            version_id,
            history,
            run,
            user,
        } => {
            let response = client
                .deploy(&version_id, history.as_deref(), run.as_deref(), user)
                .await?;
            println!("History: {}", response.history_id);
            for result in response.results {
                match result.msg_id {
                    Some(msg_id) => println!("  {} enqueued ({})", result.version_id, msg_id),
                    None => println!("  {} not enqueued", result.version_id),
                }
            }
        }
        Command::Tree { pipeline_id } => {
            let tree = client.resource_tree(pipeline_id).await?;
            print_json(&tree)?;
        }
        Command::Config { pipeline_id, run } => {
            let config = client.configuration(pipeline_id, run.as_deref()).await?;
            print_json(&config)?;
        }
        Command::Report { run_id } => {
            client.write_report(&run_id, &mut std::io::stdout()).await?;
        }
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<(), ClientError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
    println!("{rendered}");
    Ok(())
}
