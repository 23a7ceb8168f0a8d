use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use foreman::config::{Config, LauncherMode};
use foreman::graph::{GraphSpec, TaskGraph, TaskId};
use foreman::orchestrator::{
    request_stop, CommandGate, Orchestrator, RetryTarget, RunOutcome, StatusReport,
};
use foreman::state::StatePersistence;
use foreman::worker::{NullLauncher, SubprocessLauncher, WorkerLauncher};
use foreman::{flog, Error, Result};

/// Foreman - parallel task execution engine with git worktree isolation
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)")]
struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long)]
    debug: bool,

    /// Repository to run in (default: current directory)
    #[arg(long)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run from a task-graph document
    Start {
        /// Path to the task graph JSON document
        graph: PathBuf,

        /// Feature name (branch prefix and state file name)
        #[arg(long)]
        feature: String,

        /// Branch to build on
        #[arg(long, default_value = "main")]
        base: String,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Resume an interrupted or paused run
    Resume {
        /// Path to the task graph JSON document
        graph: PathBuf,

        #[arg(long)]
        feature: String,

        #[arg(long, default_value = "main")]
        base: String,
    },

    /// Ask a running orchestrator to stop
    Stop {
        #[arg(long)]
        feature: String,

        /// Kill workers immediately instead of draining them
        #[arg(long)]
        force: bool,
    },

    /// Show run status from the persisted state
    Status {
        #[arg(long)]
        feature: String,
    },

    /// Requeue a blocked or failed task (or a whole level)
    Retry {
        /// Path to the task graph JSON document
        graph: PathBuf,

        #[arg(long)]
        feature: String,

        #[arg(long, default_value = "main")]
        base: String,

        /// Task id to retry
        #[arg(long, conflicts_with = "level")]
        task: Option<String>,

        /// Level whose blocked tasks should be retried
        #[arg(long)]
        level: Option<usize>,

        /// Also clear attempt counters
        #[arg(long)]
        force: bool,
    },
}

fn state_path(feature: &str) -> Result<PathBuf> {
    Ok(Config::foreman_dir()?.join(format!("{}.state.json", feature)))
}

fn load_graph(path: &PathBuf) -> Result<TaskGraph> {
    let json = std::fs::read_to_string(path)?;
    TaskGraph::build(GraphSpec::from_json(&json)?)
}

fn make_launcher(config: &Config) -> Arc<dyn WorkerLauncher> {
    match config.launcher {
        LauncherMode::Null => Arc::new(NullLauncher::new()),
        // Container workers run through the same worker binary; the
        // program is expected to wrap the container runtime.
        LauncherMode::Subprocess | LauncherMode::Container => {
            Arc::new(SubprocessLauncher::new(config.worker_program.clone()))
        }
    }
}

fn make_gate(config: &Config) -> Box<CommandGate> {
    Box::new(CommandGate::new(
        config.gate_command.clone(),
        Duration::from_secs(config.gate_timeout_secs),
    ))
}

fn print_report(report: &StatusReport) {
    println!("feature:  {}", report.feature);
    println!("state:    {}", report.run_state);
    println!(
        "level:    {}/{} ({} complete, {} blocked)",
        report.current_level, report.level_count, report.complete, report.blocked
    );
    if !report.workers.is_empty() {
        println!("workers:");
        for w in &report.workers {
            println!(
                "  {}  {:<12} {}  {:.0}%",
                w.id,
                w.state,
                w.task.as_deref().unwrap_or("-"),
                w.context_usage * 100.0
            );
        }
    }
    println!("tasks:");
    for t in &report.tasks {
        println!(
            "  L{} {:<12} [{}] {} (attempts: {})",
            t.level, t.id, t.status, t.title, t.attempts
        );
    }
}

fn report_outcome(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Complete => println!("run complete: all levels merged and promoted"),
        RunOutcome::Paused(reason) => {
            println!("run paused: {}", reason);
            println!("fix the cause, then `foreman retry` and `foreman resume`");
        }
        RunOutcome::Stopped => println!("run stopped; `foreman resume` to continue"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let repo = match cli.repo {
        Some(repo) => repo,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Start {
            graph,
            feature,
            base,
            workers,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.max_concurrent = workers;
            }
            let graph = load_graph(&graph)?;
            flog!(
                "start: feature={} tasks={} levels={}",
                feature,
                graph.len(),
                graph.level_count()
            );
            let launcher = make_launcher(&config);
            let gate = make_gate(&config);
            let mut orchestrator = Orchestrator::new(
                config,
                graph,
                &repo,
                &base,
                &feature,
                &state_path(&feature)?,
                launcher,
                gate,
            )?;
            install_signal_handler(&orchestrator);
            report_outcome(orchestrator.run().await?);
        }
        Command::Resume {
            graph,
            feature,
            base,
        } => {
            let graph = load_graph(&graph)?;
            let launcher = make_launcher(&config);
            let gate = make_gate(&config);
            let mut orchestrator = Orchestrator::resume(
                config,
                graph,
                &repo,
                &base,
                &feature,
                &state_path(&feature)?,
                launcher,
                gate,
            )?;
            install_signal_handler(&orchestrator);
            report_outcome(orchestrator.run().await?);
        }
        Command::Stop { feature, force } => {
            request_stop(&state_path(&feature)?, force)?;
            println!(
                "{} stop requested for '{}'",
                if force { "forced" } else { "graceful" },
                feature
            );
        }
        Command::Status { feature } => {
            // Read-only view over the persisted state; a live
            // orchestrator in another process keeps it current.
            let state = StatePersistence::load(&state_path(&feature)?)?;
            println!("feature:  {}", state.feature);
            println!(
                "state:    {}",
                state.paused.as_deref().map(|r| format!("paused: {}", r)).unwrap_or_else(|| "running or stopped".to_string())
            );
            println!("level:    {}", state.current_level);
            for (id, record) in &state.tasks {
                println!("  {:<12} [{}] attempts: {}", id, record.status, record.attempts);
            }
        }
        Command::Retry {
            graph,
            feature,
            base,
            task,
            level,
            force,
        } => {
            let target = match (task, level) {
                (Some(task), None) => RetryTarget::Task(TaskId::parse(&task)?),
                (None, Some(level)) => RetryTarget::Level(level),
                _ => {
                    return Err(Error::Validation(
                        "retry needs exactly one of --task or --level".to_string(),
                    ))
                }
            };
            let graph = load_graph(&graph)?;
            let launcher = make_launcher(&config);
            let gate = make_gate(&config);
            let mut orchestrator = Orchestrator::resume(
                config,
                graph,
                &repo,
                &base,
                &feature,
                &state_path(&feature)?,
                launcher,
                gate,
            )?;
            orchestrator.retry(target, force)?;
            print_report(&orchestrator.status());
            install_signal_handler(&orchestrator);
            report_outcome(orchestrator.run().await?);
        }
    }
    Ok(())
}

/// First ctrl-c drains gracefully, second kills workers.
fn install_signal_handler(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancel_token();
    let kill = orchestrator.kill_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stopping gracefully (ctrl-c again to force)");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("forcing stop");
            kill.cancel();
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    foreman::log::init_with_debug(cli.debug);

    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
