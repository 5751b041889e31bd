use std::time::Duration;

use tracing::{info, warn};

use crate::agent::{Feedback, FixAgent};
use crate::config::AgentConfig;
use crate::error::{DeflakeError, Result};
use crate::exec::{CommandRunner, Invocation};
use crate::git;
use crate::pipeline::reproduce::ReproductionResult;
use crate::pipeline::Workflow;
use crate::state::handoff::Handoff;
use crate::state::workflow::{Stage, WorkflowState};

impl<R: CommandRunner> Workflow<'_, R> {
  /// Run the linter; a non-zero exit is `Lint` carrying its output.
  pub fn lint(&self, state: &mut WorkflowState) -> Result<()> {
    let Some(lint) = &self.config.lint else {
      return Ok(());
    };
    state.set_stage(Stage::Linting);

    let invocation = Invocation::from_argv(&lint.command, &self.config.repo_path)?
      .timeout(Duration::from_secs(lint.timeout_secs));
    let output = self.runner.run(&invocation)?;
    if !output.success() {
      warn!("lint failed: {}", invocation.display());
      return Err(DeflakeError::Lint {
        output: output.combined(),
      });
    }
    Ok(())
  }

  /// Re-run the test at the escalated count; any failure is `FixNotVerified`.
  pub fn verify(&self, state: &mut WorkflowState, test_path: &str) -> Result<ReproductionResult> {
    state.set_stage(Stage::Verifying);
    let result = self
      .reproducer()
      .reproduce(test_path, self.config.runner.verify_count)?;
    if result.reproduced {
      return Err(DeflakeError::FixNotVerified {
        test: result.test_path,
        failures: result.failures,
        attempts: result.attempts,
      });
    }
    Ok(result)
  }

  /// Lint, then verify. Returns the clean verification run.
  ///
  /// The fix may be uncommitted edits, commits on the branch, or both.
  pub fn check(&self, state: &mut WorkflowState, handoff: &Handoff) -> Result<ReproductionResult> {
    let repo_path = &self.config.repo_path;
    let git_config = &self.config.git;
    if git::branch::is_clean(self.runner, repo_path)?
      && git::branch::commit_count(
        self.runner,
        repo_path,
        &git_config.remote,
        &git_config.base_branch,
      )? == 0
    {
      return Err(DeflakeError::EmptyFix(format!(
        "no changes on {} for {}",
        handoff.branch, handoff.candidate.test_path
      )));
    }
    self.lint(state)?;
    self.verify(state, &handoff.candidate.test_path)
  }

  /// Let the agent fix the candidate, feeding lint and verification failures
  /// back for up to `max_attempts` rounds.
  pub fn agent_fix(
    &self,
    state: &mut WorkflowState,
    handoff: &Handoff,
    agent_config: &AgentConfig,
  ) -> Result<ReproductionResult> {
    let agent = FixAgent::new(agent_config);
    let mut feedback: Option<Feedback> = None;
    let mut attempt = 1;

    loop {
      state.set_stage(Stage::Fixing);
      state.record(format!(
        "{}: fix attempt {attempt}/{}",
        handoff.candidate.test_path, agent_config.max_attempts
      ));
      agent.fix(
        self.runner,
        &self.config.repo_path,
        &handoff.candidate,
        &handoff.test_file,
        &handoff.reproduction,
        feedback.as_ref(),
      )?;

      let err = match self.check(state, handoff) {
        Ok(verification) => return Ok(verification),
        Err(e) => e,
      };
      if attempt >= agent_config.max_attempts {
        return Err(err);
      }

      feedback = Some(match err {
        DeflakeError::Lint { output } => Feedback::Lint(output),
        DeflakeError::FixNotVerified {
          test,
          failures,
          attempts,
        } => Feedback::StillFlaky(ReproductionResult::new(&test, attempts, failures)),
        other => return Err(other),
      });
      info!("retrying fix for {}", handoff.candidate.test_path);
      attempt += 1;
    }
  }

  /// Drop the fix branch and return to where the run started.
  pub fn discard_branch(&self, handoff: &Handoff) -> Result<()> {
    let repo_path = &self.config.repo_path;
    git::branch::discard_changes(self.runner, repo_path)?;
    git::branch::checkout(self.runner, repo_path, &handoff.origin_branch)?;
    git::branch::delete(self.runner, repo_path, &handoff.branch)?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::cell::Cell;
  use std::rc::Rc;

  use super::*;
  use crate::config::LintConfig;
  use crate::exec::fake::{exit, ok, FakeRunner};
  use crate::exec::CancelFlag;
  use crate::pipeline::testing::{config, handoff, record};

  fn agent_config(max_attempts: u32) -> AgentConfig {
    AgentConfig {
      program: "claude".into(),
      model: "sonnet".into(),
      allowed_tools: vec!["Edit".into()],
      timeout_secs: 60,
      max_attempts,
    }
  }

  fn with_lint() -> crate::config::Config {
    let mut c = config();
    c.lint = Some(LintConfig {
      command: vec!["make".into(), "lint".into()],
      timeout_secs: 60,
    });
    c
  }

  #[test]
  fn test_lint_failure_is_lint_error() {
    let runner = FakeRunner::new(|_| exit(2, "test/a.js:3 no-unused-vars"));
    let config = with_lint();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let mut state = WorkflowState::new();
    match wf.lint(&mut state) {
      Err(DeflakeError::Lint { output }) => assert!(output.contains("no-unused-vars")),
      other => panic!("expected lint error, got {other:?}"),
    }
    assert_eq!(state.stage(), Stage::Linting);
  }

  #[test]
  fn test_no_lint_configured_passes() {
    let runner = FakeRunner::new(|_| exit(1, ""));
    let config = config();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    wf.lint(&mut WorkflowState::new()).unwrap();
    assert!(runner.calls().is_empty());
  }

  #[test]
  fn test_verify_failure_is_fix_not_verified() {
    let runs = Rc::new(Cell::new(0));
    let seen = runs.clone();
    let runner = FakeRunner::new(move |_| {
      seen.set(seen.get() + 1);
      if seen.get() == 500 {
        exit(1, "not ok")
      } else {
        ok("")
      }
    });
    let config = config();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let err = wf.verify(&mut WorkflowState::new(), "parallel/test-a").unwrap_err();
    assert!(matches!(
      err,
      DeflakeError::FixNotVerified {
        failures: 1,
        attempts: 1000,
        ..
      }
    ));
    assert_eq!(runs.get(), 1000);
  }

  /// Clean working tree with `ahead` commits over the base branch.
  fn committed(ahead: &'static str) -> FakeRunner {
    FakeRunner::new(move |inv| match inv.args.first().map(String::as_str) {
      Some("rev-list") => ok(ahead),
      _ => ok(""),
    })
  }

  #[test]
  fn test_check_rejects_empty_fix() {
    let runner = committed("0\n");
    let config = config();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let h = handoff(record("parallel/test-a", 3));
    assert!(matches!(
      wf.check(&mut WorkflowState::new(), &h),
      Err(DeflakeError::EmptyFix(_))
    ));
    assert!(runner
      .commands()
      .contains(&"git rev-list --count origin/main..HEAD".to_string()));
  }

  #[test]
  fn test_check_accepts_committed_fix() {
    let runner = committed("1\n");
    let config = config();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let h = handoff(record("parallel/test-a", 3));
    let verification = wf.check(&mut WorkflowState::new(), &h).unwrap();
    assert!(!verification.reproduced);
    assert_eq!(verification.attempts, 1000);
  }

  #[test]
  fn test_agent_retries_with_lint_feedback() {
    let lint_runs = Rc::new(Cell::new(0));
    let seen = lint_runs.clone();
    let runner = FakeRunner::new(move |inv| match inv.program.as_str() {
      "git" => ok(" M test/parallel/test-a.js\n"),
      "make" => {
        seen.set(seen.get() + 1);
        if seen.get() == 1 {
          exit(2, "E: trailing whitespace")
        } else {
          ok("")
        }
      }
      _ => ok(""),
    });
    let config = with_lint();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let h = handoff(record("parallel/test-a", 3));

    let verification = wf
      .agent_fix(&mut WorkflowState::new(), &h, &agent_config(2))
      .unwrap();
    assert!(!verification.reproduced);
    assert_eq!(verification.attempts, 1000);

    let prompts: Vec<String> = runner
      .calls()
      .into_iter()
      .filter(|c| c.program == "claude")
      .filter_map(|c| c.stdin)
      .collect();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("failed lint"));
    assert!(prompts[1].contains("E: trailing whitespace"));
  }

  #[test]
  fn test_agent_gives_up_after_max_attempts() {
    let runner = FakeRunner::new(|inv| match inv.program.as_str() {
      "git" => ok(" M a.js\n"),
      "make" => exit(2, "still broken"),
      _ => ok(""),
    });
    let config = with_lint();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    let h = handoff(record("parallel/test-a", 3));
    let err = wf
      .agent_fix(&mut WorkflowState::new(), &h, &agent_config(2))
      .unwrap_err();
    assert!(matches!(err, DeflakeError::Lint { .. }));
    let agent_calls = runner.calls().iter().filter(|c| c.program == "claude").count();
    assert_eq!(agent_calls, 2);
  }

  #[test]
  fn test_discard_branch() {
    let runner = FakeRunner::new(|_| ok(""));
    let config = config();
    let wf = Workflow::new(&config, &runner, CancelFlag::default());
    wf.discard_branch(&handoff(record("parallel/test-a", 3)))
      .unwrap();
    assert_eq!(
      runner.commands(),
      vec![
        "git reset --hard HEAD",
        "git clean -fd",
        "git checkout main",
        "git branch -D deflake/parallel-test-a",
      ]
    );
  }
}
