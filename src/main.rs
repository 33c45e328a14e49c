use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use conductor::agent::Agent;
use conductor::config::Config;
use conductor::core::task::{CollaborationSpec, CollaborationStrategy, Priority, TaskId, TaskSpec};
use conductor::events::OrchestratorEvent;
use conductor::orchestration::{EchoExecutor, Orchestrator};
use conductor::state::{MemoryTaskStore, Snapshot};
use conductor::{Error, Result};

/// Conductor - task orchestration and capacity balancing for agent pools
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG              Overrides both")]
pub struct Cli {
    /// Enable debug logging (written to stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Write logs to ~/.conductor/conductor.log instead of stderr
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Config file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a simulated agent pool and print lifecycle events as JSON lines
    Simulate {
        /// Number of agents to register
        #[arg(long, default_value_t = 3)]
        agents: usize,

        /// Number of tasks to submit
        #[arg(long, default_value_t = 10)]
        tasks: usize,

        /// Concurrent task slots per agent
        #[arg(long, default_value_t = 2)]
        slots: u32,

        /// Simulated work time per dispatch, in milliseconds
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,

        /// Also submit one parallel collaboration across two agents
        #[arg(long)]
        collaborate: bool,
    },

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Report what a saved snapshot would resume
    Resume {
        /// Snapshot file written on shutdown
        snapshot: PathBuf,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration if no file exists
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_file {
        conductor::log::init_to_file(&Config::log_path()?, cli.debug)?;
    } else {
        conductor::log::init_with_debug(cli.debug);
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    match cli.command {
        Command::Simulate {
            agents,
            tasks,
            slots,
            delay_ms,
            collaborate,
        } => {
            let config = Config::load_from(&config_path)?;
            run_simulate(
                config,
                agents,
                tasks,
                slots,
                Duration::from_millis(delay_ms),
                collaborate,
            )
            .await
        }
        Command::Config { action } => run_config(action, &config_path),
        Command::Resume { snapshot } => run_resume(&snapshot).await,
    }
}

/// Run an echo-backed pool until every submitted task settles.
async fn run_simulate(
    config: Config,
    agent_count: usize,
    task_count: usize,
    slots: u32,
    delay: Duration,
    collaborate: bool,
) -> Result<()> {
    if agent_count == 0 {
        return Err(Error::Validation("--agents must be at least 1".to_string()));
    }
    tracing::info!(agents = agent_count, tasks = task_count, "Simulation starting");

    let orchestrator = Orchestrator::new(
        config,
        Box::new(MemoryTaskStore::new()),
        Arc::new(EchoExecutor::new(delay)),
    )?;
    let handle = orchestrator.spawn();
    let mut events = handle.subscribe();

    for i in 0..agent_count {
        let kind = if i % 2 == 0 { "coder" } else { "reviewer" };
        let agent = Agent::new(&format!("{}-{}", kind, i + 1), kind).with_capacity(slots.max(1));
        handle.register_agent(agent).await?;
    }

    let specs = simulation_specs(task_count, collaborate && agent_count >= 2);
    let mut waiting: HashSet<TaskId> = specs.iter().filter_map(|s| s.id).collect();
    handle.submit_batch(specs).await?;

    while !waiting.is_empty() {
        match events.recv().await {
            Ok(event) => {
                println!("{}", serde_json::to_string(&event)?);
                if let Some(task) = settled(&event) {
                    waiting.remove(&task);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event stream lagged");
                // Catch up from the authoritative task states
                for task in waiting.clone() {
                    if handle.task(task).await?.is_some_and(|t| t.is_finished()) {
                        waiting.remove(&task);
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }

    let report = handle.capacity().await?;
    let snapshot = handle.shutdown().await?;
    let completed = snapshot.tasks.iter().filter(|t| t.is_finished()).count();
    eprintln!(
        "Simulation finished: {} task(s) settled, {} agent(s), {}/{} slots in use",
        completed,
        snapshot.agents.len(),
        report.used_capacity,
        report.total_capacity
    );
    Ok(())
}

/// A chain of three tasks followed by independent work, priorities cycling.
fn simulation_specs(count: usize, collaborate: bool) -> Vec<TaskSpec> {
    let priorities = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];
    let mut specs: Vec<TaskSpec> = Vec::with_capacity(count + 1);
    for i in 0..count {
        let mut spec = TaskSpec::new(&format!("task-{}", i + 1))
            .with_id(TaskId::new())
            .with_prompt(&format!("simulated work item {}", i + 1))
            .with_priority(priorities[i % priorities.len()]);
        if (1..3).contains(&i) {
            if let Some(previous) = specs[i - 1].id {
                spec = spec.depends_on(previous);
            }
        }
        specs.push(spec);
    }
    if collaborate {
        specs.push(
            TaskSpec::new("review-together")
                .with_id(TaskId::new())
                .with_prompt("review the simulated output")
                .with_collaboration(CollaborationSpec::new(CollaborationStrategy::Parallel, 2)),
        );
    }
    specs
}

/// Task that reached a state it will not leave on its own.
fn settled(event: &OrchestratorEvent) -> Option<TaskId> {
    match event {
        OrchestratorEvent::TaskCompleted { task, .. }
        | OrchestratorEvent::TaskBlocked { task, .. }
        | OrchestratorEvent::TaskCancelled { task } => Some(*task),
        OrchestratorEvent::TaskFailed {
            task,
            will_retry: false,
            ..
        } => Some(*task),
        _ => None,
    }
}

fn run_config(action: ConfigAction, path: &std::path::Path) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load_from(path)?;
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!("Config already exists at {}", path.display());
                println!("Use 'conductor config init --force' to overwrite it.");
                return Ok(());
            }
            Config::default().save_to(path)?;
            println!("Wrote default config to {}", path.display());
        }
    }
    Ok(())
}

async fn run_resume(path: &std::path::Path) -> Result<()> {
    let Some(snapshot) = Snapshot::load(path).await? else {
        println!("No snapshot at {}", path.display());
        return Ok(());
    };

    println!("Snapshot from {}", snapshot.saved_at.to_rfc3339());
    println!("  Agents: {}", snapshot.agents.len());
    for agent in &snapshot.agents {
        println!(
            "    - {} ({}, {} slot(s), {:?})",
            agent.name, agent.kind, agent.max_concurrent_tasks, agent.status
        );
    }

    let unfinished: Vec<_> = snapshot.unfinished().collect();
    println!(
        "  Tasks: {} total, {} would resume",
        snapshot.tasks.len(),
        unfinished.len()
    );
    for task in unfinished {
        println!(
            "    - {} [{}] {} ({})",
            task.id.short(),
            task.priority,
            task.title,
            task.status.kind()
        );
    }
    Ok(())
}
