//! Ruleflow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Run ruleflow.yml in the current directory
//! ruleflow
//!
//! # Only what `report` needs, re-running everything
//! ruleflow pipeline.yml --until report --forceall
//!
//! # Walk the workflow without running any tool
//! ruleflow pipeline.yml --dry-run
//!
//! # Export the dependency graph
//! ruleflow pipeline.yml --dot dag.dot
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use log::{error, info};

use ruleflow::execution::{RunReport, WorkflowManager};
use ruleflow::storage::HistoryStore;
use ruleflow::workflow::{load_workflow, RuleStatus};
use ruleflow::{APP_NAME, VERSION};

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ruleflow",
    version,
    about = "Run rule-based workflows, skipping rules whose outputs are up to date.",
    long_about = None
)]
struct Cli {
    /// Workflow definition file (YAML).
    #[arg(value_name = "WORKFLOW", default_value = "ruleflow.yml")]
    workflow: PathBuf,

    /// Execution history file.
    #[arg(long, value_name = "PATH", default_value = ".ruleflow/history.json")]
    history: PathBuf,

    /// Run only this rule and the rules downstream of it.
    #[arg(long, value_name = "RULE")]
    start_from: Option<String>,

    /// Run only this rule and the rules it depends on.
    #[arg(long, value_name = "RULE")]
    until: Option<String>,

    /// Re-execute every rule, even if its outputs are up to date.
    #[arg(long)]
    forceall: bool,

    /// Walk the workflow without running any tool.
    #[arg(long)]
    dry_run: bool,

    /// Forget every previous execution before running.
    #[arg(long)]
    clear_history: bool,

    /// Maximum number of rules running at once.
    #[arg(long, value_name = "N", default_value_t = num_cpus::get())]
    parallel: usize,

    /// Directory relative rule paths resolve against.
    #[arg(long, value_name = "PATH")]
    working_dir: Option<PathBuf>,

    /// Write the dependency graph in Graphviz DOT format.
    #[arg(long, value_name = "PATH")]
    dot: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!();
}

fn colored_status(status: RuleStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        RuleStatus::Executed => label.green(),
        RuleStatus::AlreadyExecuted => label.cyan(),
        RuleStatus::Dry => label.blue(),
        RuleStatus::Error => label.red().bold(),
        RuleStatus::NotPlanned => label.dimmed(),
        RuleStatus::NotExecuted => label.yellow(),
    }
}

fn print_summary(report: &RunReport) {
    println!();
    println!("{}", format!("Execution #{}", report.execution_id).bold());
    for rule in &report.rules {
        let duration = rule
            .duration
            .map(|d| format!("{} ms", d.num_milliseconds()))
            .unwrap_or_default();
        println!(
            "  {:<24} {:<18} {:<18} {}",
            rule.name,
            rule.tool,
            colored_status(rule.status),
            duration
        );
    }
    println!();
    println!(
        "{} executed, {} up to date, {} simulated, {} not planned ({:.2}s)",
        report.count(RuleStatus::Executed),
        report.count(RuleStatus::AlreadyExecuted),
        report.count(RuleStatus::Dry),
        report.count(RuleStatus::NotPlanned),
        report.elapsed.as_secs_f64()
    );
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    print_banner();

    if let Some(dir) = &cli.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
    }

    info!("Loading workflow: {}", cli.workflow.display());
    let loaded = load_workflow(&cli.workflow).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;
    info!(
        "Workflow loaded: {} rules, {} tools",
        loaded.workflow.len(),
        loaded.workflow.tools.len()
    );

    let store = Arc::new(HistoryStore::open(&cli.history)?);
    let mut manager = WorkflowManager::new(loaded.workflow, loaded.registry, store);
    manager.set_max_parallel(cli.parallel);
    manager.set_force_all(cli.forceall);
    manager.set_simulate(cli.dry_run);
    if let Some(rule) = cli.start_from {
        manager.set_start_from(rule);
    }
    if let Some(rule) = cli.until {
        manager.set_until(rule);
    }
    if let Some(dir) = cli.working_dir {
        manager.set_working_dir(dir);
    }

    if let Some(path) = manager.store().path() {
        info!("History: {}", path.display());
    }
    if let Some(dir) = manager.working_dir() {
        info!("Working directory: {}", dir.display());
    }

    if cli.clear_history {
        manager.clear_history()?;
    }

    if let Some(path) = &cli.dot {
        let dot = manager.dag()?.to_dot(manager.workflow());
        fs::write(path, dot)?;
        info!("Wrote DAG to {}", path.display());
    }

    if cli.dry_run {
        info!("Mode: DRY RUN (tools will not run)");
    }

    let result = manager.run();
    if !manager.timeline().get_events().is_empty() {
        println!("{}", manager.timeline().gantt_chart());
    }
    let report = result?;
    print_summary(&report);

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
