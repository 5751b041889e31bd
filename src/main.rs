mod agent;
mod config;
mod error;
mod exec;
mod git;
mod github;
mod pipeline;
mod report;
mod state;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{DeflakeError, Result};
use crate::exec::{CancelFlag, SystemRunner};
use crate::pipeline::{RunOutcome, Workflow};
use crate::report::Report;
use crate::state::handoff::Handoff;
use crate::state::lock::RunLock;
use crate::state::workflow::{Stage, WorkflowState};

const RUN_LOG: &str = "last-run.log";

#[derive(Parser)]
#[command(
  name = "deflake",
  about = "Reproduce, fix and submit flaky tests from reliability reports"
)]
struct Cli {
  #[command(subcommand)]
  command: Commands,

  /// Path to config file
  #[arg(short, long, default_value = "deflake.yaml")]
  config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
  /// Fetch the latest report and take the best candidate through to a pull request
  Run {
    /// Stop after reproducing the first candidate
    #[arg(long)]
    dry_run: bool,
    /// Read the report from a markdown file instead of the tracker
    #[arg(long)]
    report: Option<PathBuf>,
  },
  /// List eligible candidates, best first
  Candidates {
    /// Read the report from a markdown file instead of the tracker
    #[arg(long)]
    report: Option<PathBuf>,
  },
  /// Run one test repeatedly and report how often it failed
  Reproduce {
    /// Test path as it appears in the report; defaults to the best candidate
    test: Option<String>,
    /// Number of runs (defaults to runner.repeat_count)
    #[arg(long)]
    count: Option<u32>,
    /// Read the report from a markdown file instead of the tracker
    #[arg(long)]
    report: Option<PathBuf>,
  },
  /// Lint, verify, commit and submit a fix made by hand
  Finish {
    /// Commit summary after the subsystem prefix
    #[arg(long)]
    summary: Option<String>,
  },
  /// Drop the fix in progress and delete its branch
  Abandon,
  /// Show the fix in progress, if any
  Status,
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  if let Err(e) = run(cli).await {
    error!("{e}");
    std::process::exit(1);
  }
}

async fn run(cli: Cli) -> Result<()> {
  let config = Config::load(&cli.config)?;

  if let Commands::Status = cli.command {
    return cmd_status(&config);
  }

  let cancel = CancelFlag::default();
  listen_for_ctrl_c(cancel.clone());

  let command = cli.command;
  tokio::task::spawn_blocking(move || dispatch(command, &config, cancel))
    .await
    .map_err(|e| DeflakeError::Io(std::io::Error::other(format!("spawn_blocking: {e}"))))?
}

fn listen_for_ctrl_c(cancel: CancelFlag) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, stopping the current command");
      cancel.cancel();
    }
  });
}

fn dispatch(command: Commands, config: &Config, cancel: CancelFlag) -> Result<()> {
  let runner = SystemRunner::new(cancel.clone());
  let workflow = Workflow::new(config, &runner, cancel);

  match command {
    Commands::Run { dry_run, report } => {
      let _lock = lock(&runner, config)?;
      cmd_run(&workflow, &runner, config, dry_run, report.as_deref())
    }
    Commands::Candidates { report } => cmd_candidates(&workflow, &runner, config, report.as_deref()),
    Commands::Reproduce {
      test,
      count,
      report,
    } => cmd_reproduce(&workflow, &runner, config, test, count, report.as_deref()),
    Commands::Finish { summary } => {
      let _lock = lock(&runner, config)?;
      let handoff = Handoff::load(&config.state_dir())?;
      let mut state = WorkflowState::new();
      let url = workflow.finish(&mut state, &handoff, summary.as_deref())?;
      println!("submitted {}: {url}", handoff.candidate.test_path);
      Ok(())
    }
    Commands::Abandon => {
      let _lock = lock(&runner, config)?;
      let handoff = Handoff::load(&config.state_dir())?;
      workflow.abandon(&handoff)?;
      println!("abandoned {}", handoff.candidate.test_path);
      Ok(())
    }
    Commands::Status => cmd_status(config),
  }
}

/// Keep `.deflake/` out of `git status`, then take the per-checkout lock.
fn lock(runner: &SystemRunner, config: &Config) -> Result<RunLock> {
  git::branch::ensure_excluded(runner, &config.repo_path, pipeline::STATE_DIR_PATTERN)?;
  RunLock::acquire(&config.state_dir())
}

fn load_report(runner: &SystemRunner, config: &Config, path: Option<&Path>) -> Result<Report> {
  match path {
    Some(path) => pipeline::fetch::load_report(path, config),
    None => pipeline::fetch::fetch_report(runner, config),
  }
}

fn cmd_run(
  workflow: &Workflow<'_, SystemRunner>,
  runner: &SystemRunner,
  config: &Config,
  dry_run: bool,
  report_path: Option<&Path>,
) -> Result<()> {
  let mut state = WorkflowState::new();
  state.set_stage(Stage::Fetching);
  let report = load_report(runner, config, report_path)?;

  let result = workflow.run(&mut state, &report, dry_run);
  let log_path = config.state_dir().join(RUN_LOG);
  if let Err(e) = std::fs::write(&log_path, state.log().join("\n") + "\n") {
    warn!("could not write {}: {e}", log_path.display());
  }
  let outcome = match result {
    Ok(outcome) => outcome,
    Err(e) => {
      if let Some(candidate) = state.candidate() {
        let branch = state
          .branch()
          .map(|b| format!(" on {b}"))
          .unwrap_or_default();
        error!(
          "stopped while {:?} {}{branch}",
          state.stage(),
          candidate.test_path
        );
      }
      return Err(e);
    }
  };

  match outcome {
    RunOutcome::NoCandidate => println!("no eligible candidate in {report}"),
    RunOutcome::Reproduced(result) => println!("reproduced {result}"),
    RunOutcome::AwaitingFix(handoff) => {
      println!("reproduced {}", handoff.reproduction);
      println!();
      println!("branch {} is checked out.", handoff.branch);
      println!("fix {} and run `deflake finish`,", handoff.test_file);
      println!("or `deflake abandon` to give up on it.");
    }
    RunOutcome::Submitted { test_path, url } => println!("submitted {test_path}: {url}"),
    RunOutcome::Exhausted { tried } => println!("none of {tried} candidate(s) led to a fix"),
  }

  if !state.outcomes().is_empty() {
    println!();
    for outcome in state.outcomes() {
      println!("  {}: {}", outcome.test_path, outcome.status);
    }
  }
  info!("run {} complete: {}", state.run_id(), state.summary());
  Ok(())
}

fn cmd_reproduce(
  workflow: &Workflow<'_, SystemRunner>,
  runner: &SystemRunner,
  config: &Config,
  test: Option<String>,
  count: Option<u32>,
  report_path: Option<&Path>,
) -> Result<()> {
  let test = match test {
    Some(test) => test,
    None => {
      let report = load_report(runner, config, report_path)?;
      let candidate = workflow
        .next_candidate(&report)?
        .ok_or_else(|| DeflakeError::NoCandidate(format!("no eligible candidate in {report}")))?;
      candidate.test_path.clone()
    }
  };
  let count = count.unwrap_or(config.runner.repeat_count);
  let result = workflow.reproducer().reproduce(&test, count)?;
  println!("{result}");
  Ok(())
}

fn cmd_candidates(
  workflow: &Workflow<'_, SystemRunner>,
  runner: &SystemRunner,
  config: &Config,
  report_path: Option<&Path>,
) -> Result<()> {
  let report = load_report(runner, config, report_path)?;
  let candidates = workflow.candidates(&report)?;

  println!("{report}");
  if candidates.is_empty() {
    println!("  no eligible candidates");
  }
  for (i, record) in candidates.iter().enumerate() {
    println!("  {}. {record}", i + 1);
  }
  Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
  let handoff = match Handoff::load(&config.state_dir()) {
    Ok(h) => h,
    Err(DeflakeError::NoCandidate(_)) => {
      println!("no fix in progress");
      return Ok(());
    }
    Err(e) => return Err(e),
  };

  println!("deflake status");
  println!("==============");
  println!("test:       {}", handoff.candidate.test_path);
  println!("file:       {}", handoff.test_file);
  println!("branch:     {}", handoff.branch);
  println!("report:     {}", handoff.report_reference);
  println!("reproduced: {}", handoff.reproduction);
  println!("since:      {}", handoff.created_at);
  Ok(())
}
