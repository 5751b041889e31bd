use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{RunnerConfig, RunnerMode};
use crate::error::{DeflakeError, Result};
use crate::exec::{CancelFlag, CommandRunner, Invocation};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReproductionResult {
  pub test_path: String,
  pub attempts: u32,
  pub failures: u32,
  pub reproduced: bool,
}

impl ReproductionResult {
  pub fn new(test_path: &str, attempts: u32, failures: u32) -> Self {
    Self {
      test_path: test_path.to_string(),
      attempts,
      failures,
      reproduced: failures > 0,
    }
  }
}

impl std::fmt::Display for ReproductionResult {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{}: {}/{} runs failed",
      self.test_path, self.failures, self.attempts
    )
  }
}

/// Runs one test repeatedly through the configured test command.
pub struct Reproducer<'a, R: CommandRunner> {
  runner: &'a R,
  config: &'a RunnerConfig,
  repo_path: PathBuf,
  cancel: CancelFlag,
}

impl<'a, R: CommandRunner> Reproducer<'a, R> {
  pub fn new(runner: &'a R, config: &'a RunnerConfig, repo_path: &Path, cancel: CancelFlag) -> Self {
    Self {
      runner,
      config,
      repo_path: repo_path.to_path_buf(),
      cancel,
    }
  }

  pub fn reproduce(&self, test_path: &str, repeat: u32) -> Result<ReproductionResult> {
    info!("running {test_path} {repeat} times");
    let result = match self.config.mode {
      RunnerMode::Loop => self.run_loop(test_path, repeat)?,
      RunnerMode::Batch => self.run_batch(test_path, repeat)?,
    };
    info!("{result}");
    Ok(result)
  }

  fn invocation(&self, test_path: &str, repeat: u32) -> Result<Invocation> {
    let argv: Vec<String> = self
      .config
      .command
      .iter()
      .map(|a| {
        a.replace("{test}", test_path)
          .replace("{repeat}", &repeat.to_string())
      })
      .collect();
    Invocation::from_argv(&argv, &self.repo_path)
  }

  /// Time left for one invocation: the per-run timeout capped by the budget.
  fn time_left(&self, started: Instant, per_run: Duration) -> Result<Duration> {
    let Some(budget) = self.config.budget_secs.map(Duration::from_secs) else {
      return Ok(per_run);
    };
    let remaining = budget.saturating_sub(started.elapsed());
    if remaining.is_zero() {
      return Err(DeflakeError::Timeout(format!(
        "reproduction budget of {}s exhausted",
        budget.as_secs()
      )));
    }
    Ok(per_run.min(remaining))
  }

  fn run_loop(&self, test_path: &str, repeat: u32) -> Result<ReproductionResult> {
    let started = Instant::now();
    let per_run = Duration::from_secs(self.config.timeout_secs);
    let mut failures = 0;

    for attempt in 1..=repeat {
      if self.cancel.is_cancelled() {
        return Err(DeflakeError::Cancelled);
      }
      let timeout = self.time_left(started, per_run)?;
      let output = self
        .runner
        .run(&self.invocation(test_path, 1)?.timeout(timeout))?;
      if !output.success() {
        failures += 1;
        debug!(
          "run {attempt}/{repeat} failed ({failures} so far): {}",
          output.combined().lines().last().unwrap_or_default()
        );
      }
    }

    Ok(ReproductionResult::new(test_path, repeat, failures))
  }

  fn run_batch(&self, test_path: &str, repeat: u32) -> Result<ReproductionResult> {
    let per_run = Duration::from_secs(self.config.timeout_secs.saturating_mul(repeat as u64));
    let timeout = self.time_left(Instant::now(), per_run)?;
    let invocation = self.invocation(test_path, repeat)?.timeout(timeout);
    let output = self.runner.run(&invocation)?;

    let counted = match &self.config.failure_pattern {
      Some(pattern) => count_failures(&Regex::new(pattern)?, &output.combined()),
      None => None,
    };

    let failures = match counted {
      Some(n) => n,
      None if output.success() => 0,
      None => {
        return Err(DeflakeError::ExternalTool {
          tool: invocation.tool(),
          command: invocation.display(),
          code: output.code,
          output: output.combined(),
        })
      }
    };

    Ok(ReproductionResult::new(test_path, repeat, failures))
  }
}

/// Failure count from the last match of the pattern's first capture group.
fn count_failures(pattern: &Regex, output: &str) -> Option<u32> {
  pattern
    .captures_iter(output)
    .last()
    .and_then(|c| c.get(1))
    .and_then(|m| m.as_str().trim().parse().ok())
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::rc::Rc;

  use super::*;
  use crate::exec::fake::{exit, ok, FakeRunner};

  fn loop_config() -> RunnerConfig {
    RunnerConfig {
      command: vec!["python3".into(), "tools/test.py".into(), "{test}".into()],
      mode: RunnerMode::Loop,
      failure_pattern: None,
      repeat_count: 100,
      verify_count: 1000,
      timeout_secs: 60,
      budget_secs: None,
    }
  }

  /// Runner whose `nth` invocations (1-based) fail.
  fn failing_on(nth: &'static [u32]) -> FakeRunner {
    let count = Rc::new(Cell::new(0u32));
    FakeRunner::new(move |_| {
      count.set(count.get() + 1);
      if nth.contains(&count.get()) {
        exit(1, "not ok 1 test-http-agent")
      } else {
        ok("ok 1 test-http-agent")
      }
    })
  }

  #[test]
  fn test_never_failing_is_not_reproduced() {
    let runner = failing_on(&[]);
    let config = loop_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    let result = r.reproduce("parallel/test-http-agent", 100).unwrap();
    assert_eq!(result, ReproductionResult::new("parallel/test-http-agent", 100, 0));
    assert!(!result.reproduced);
    assert_eq!(runner.calls().len(), 100);
  }

  #[test]
  fn test_single_failure_is_reproduced() {
    let runner = failing_on(&[37]);
    let config = loop_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    let result = r.reproduce("parallel/test-http-agent", 100).unwrap();
    assert!(result.reproduced);
    assert_eq!(result.failures, 1);
    assert_eq!(result.attempts, 100);
  }

  #[test]
  fn test_placeholders_are_substituted() {
    let runner = failing_on(&[]);
    let mut config = loop_config();
    config.command = vec!["run".into(), "--repeat={repeat}".into(), "{test}".into()];
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    r.reproduce("a/b", 2).unwrap();
    let calls = runner.calls();
    let call = &calls[0];
    assert_eq!(call.display(), "run --repeat=1 a/b");
    assert_eq!(call.timeout, Some(Duration::from_secs(60)));
    assert_eq!(call.cwd, PathBuf::from("/repo"));
  }

  #[test]
  fn test_timeout_aborts_the_stage() {
    let runner = FakeRunner::new(|_| Err(DeflakeError::Timeout("hung".into())));
    let config = loop_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    assert!(matches!(r.reproduce("a", 10), Err(DeflakeError::Timeout(_))));
    assert_eq!(runner.calls().len(), 1);
  }

  #[test]
  fn test_exhausted_budget_is_timeout() {
    let runner = failing_on(&[]);
    let mut config = loop_config();
    config.budget_secs = Some(0);
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    assert!(matches!(r.reproduce("a", 10), Err(DeflakeError::Timeout(_))));
    assert!(runner.calls().is_empty());
  }

  #[test]
  fn test_cancel_stops_loop() {
    let runner = failing_on(&[]);
    let config = loop_config();
    let cancel = CancelFlag::default();
    cancel.cancel();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), cancel);
    assert!(matches!(r.reproduce("a", 10), Err(DeflakeError::Cancelled)));
  }

  fn batch_config() -> RunnerConfig {
    RunnerConfig {
      command: vec![
        "python3".into(),
        "tools/test.py".into(),
        "--repeat".into(),
        "{repeat}".into(),
        "{test}".into(),
      ],
      mode: RunnerMode::Batch,
      failure_pattern: Some(r"\|-\s*(\d+)\]".into()),
      ..loop_config()
    }
  }

  #[test]
  fn test_batch_reads_failure_count() {
    let runner = FakeRunner::new(|_| {
      Ok(crate::exec::ToolOutput {
        code: Some(1),
        stdout: "[00:05|%  50|+  49|-   1]: running\n[00:10|% 100|+  97|-   3]: Done\n".into(),
        stderr: String::new(),
      })
    });
    let config = batch_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    let result = r.reproduce("parallel/test-a", 100).unwrap();
    assert_eq!(result.failures, 3);
    assert_eq!(result.attempts, 100);
    assert_eq!(
      runner.calls()[0].display(),
      "python3 tools/test.py --repeat 100 parallel/test-a"
    );
  }

  #[test]
  fn test_batch_unparsed_failure_is_external_tool_error() {
    let runner = FakeRunner::new(|_| exit(2, "usage: test.py"));
    let config = batch_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    assert!(matches!(
      r.reproduce("a", 100),
      Err(DeflakeError::ExternalTool { code: Some(2), .. })
    ));
  }

  #[test]
  fn test_batch_clean_exit_without_match_is_zero_failures() {
    let runner = FakeRunner::new(|_| ok("all good"));
    let config = batch_config();
    let r = Reproducer::new(&runner, &config, Path::new("/repo"), CancelFlag::default());
    assert!(!r.reproduce("a", 100).unwrap().reproduced);
  }
}
