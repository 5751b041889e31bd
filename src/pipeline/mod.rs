pub mod change;
pub mod fetch;
pub mod reproduce;
pub mod select;
pub mod submit;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeflakeError, Result};
use crate::exec::{CancelFlag, CommandRunner};
use crate::git;
use crate::git::history::GitHistory;
use crate::pipeline::reproduce::{ReproductionResult, Reproducer};
use crate::pipeline::select::Selector;
use crate::report::record::FlakyTestRecord;
use crate::report::Report;
use crate::state::handoff::Handoff;
use crate::state::workflow::{CandidateStatus, Stage, WorkflowState};

pub const STATE_DIR_PATTERN: &str = ".deflake/";

#[derive(Debug)]
pub enum RunOutcome {
  /// Every record was excluded; nothing to do.
  NoCandidate,
  /// Dry run stopped at the first reproduced candidate.
  Reproduced(ReproductionResult),
  /// Branch is ready for a human fix; resume with `deflake finish`.
  AwaitingFix(Box<Handoff>),
  Submitted { test_path: String, url: String },
  /// Candidates ran out without a submission.
  Exhausted { tried: usize },
}

/// Result of taking one reproduced candidate through the fix stage.
enum ChangeOutcome {
  Ready(Handoff, ReproductionResult),
  AwaitingFix(Handoff),
  Abandoned,
}

/// Sequential fetch → select → reproduce → fix → lint → verify → submit.
pub struct Workflow<'a, R: CommandRunner> {
  config: &'a Config,
  runner: &'a R,
  cancel: CancelFlag,
}

impl<'a, R: CommandRunner> Workflow<'a, R> {
  pub fn new(config: &'a Config, runner: &'a R, cancel: CancelFlag) -> Self {
    Self {
      config,
      runner,
      cancel,
    }
  }

  pub fn reproducer(&self) -> Reproducer<'a, R> {
    Reproducer::new(
      self.runner,
      &self.config.runner,
      &self.config.repo_path,
      self.cancel.clone(),
    )
  }

  /// Eligible records, best first, capped at `selector.max_candidates`.
  pub fn candidates<'r>(&self, report: &'r Report) -> Result<Vec<&'r FlakyTestRecord>> {
    let selector = Selector::new(&self.config.selector)?;
    let history = GitHistory::new(self.runner, &self.config.repo_path);
    let mut ranked = selector.rank(&report.records, report.created_at, &history);
    ranked.truncate(self.config.selector.max_candidates);
    Ok(ranked)
  }

  /// The single best candidate, or `None` when every record is excluded.
  pub fn next_candidate<'r>(&self, report: &'r Report) -> Result<Option<&'r FlakyTestRecord>> {
    let selector = Selector::new(&self.config.selector)?;
    let history = GitHistory::new(self.runner, &self.config.repo_path);
    Ok(selector.select(&report.records, report.created_at, &history))
  }

  pub fn run(
    &self,
    state: &mut WorkflowState,
    report: &Report,
    dry_run: bool,
  ) -> Result<RunOutcome> {
    let repo_path = &self.config.repo_path;

    if let Some(pending) = Handoff::pending(&self.config.state_dir())? {
      return Err(DeflakeError::FixInProgress {
        test: pending.candidate.test_path,
        branch: pending.branch,
      });
    }

    state.set_stage(Stage::Selecting);
    let candidates = self.candidates(report)?;
    if candidates.is_empty() {
      state.record(format!("no candidate in {report}"));
      return Ok(RunOutcome::NoCandidate);
    }

    let origin_branch = if dry_run {
      String::new()
    } else {
      git::branch::ensure_excluded(self.runner, repo_path, STATE_DIR_PATTERN)?;
      if !git::branch::is_clean(self.runner, repo_path)? {
        return Err(DeflakeError::Config(format!(
          "working tree at {} has uncommitted changes",
          repo_path.display()
        )));
      }
      git::branch::current(self.runner, repo_path)?
    };

    let selector = Selector::new(&self.config.selector)?;
    let mut tried = 0;

    for candidate in candidates {
      tried += 1;
      state.select(candidate);
      state.set_stage(Stage::Reproducing);

      let reproduction = match self
        .reproducer()
        .reproduce(&candidate.test_path, self.config.runner.repeat_count)
      {
        Ok(r) => r,
        Err(DeflakeError::Cancelled) => return Err(DeflakeError::Cancelled),
        Err(e) => {
          warn!("reproduction of {} failed: {e}", candidate.test_path);
          state.finish_candidate(CandidateStatus::Abandoned(e.to_string()));
          continue;
        }
      };

      if !reproduction.reproduced {
        let e = DeflakeError::NonReproducible {
          test: candidate.test_path.clone(),
          attempts: reproduction.attempts,
        };
        state.record(e.to_string());
        state.finish_candidate(CandidateStatus::NonReproducible);
        continue;
      }

      if dry_run {
        state.record(format!("dry run, stopping at {reproduction}"));
        return Ok(RunOutcome::Reproduced(reproduction));
      }

      let handoff = Handoff {
        candidate: candidate.clone(),
        test_file: selector.test_file(candidate),
        branch: format!("{}{}", self.config.git.branch_prefix, candidate.slug()),
        origin_branch: origin_branch.clone(),
        report_reference: report.reference(),
        reproduction,
        created_at: Utc::now(),
      };

      match self.change(state, handoff)? {
        ChangeOutcome::Ready(handoff, verification) => {
          let url = self.submit(state, &handoff, &verification, None)?;
          return Ok(RunOutcome::Submitted {
            test_path: handoff.candidate.test_path,
            url,
          });
        }
        ChangeOutcome::AwaitingFix(handoff) => {
          return Ok(RunOutcome::AwaitingFix(Box::new(handoff)));
        }
        ChangeOutcome::Abandoned => continue,
      }
    }

    Ok(RunOutcome::Exhausted { tried })
  }

  /// Branch and fix one reproduced candidate.
  ///
  /// Failures up to verification abandon only this candidate. Lint errors
  /// the agent could not resolve are handed to a human instead.
  fn change(&self, state: &mut WorkflowState, handoff: Handoff) -> Result<ChangeOutcome> {
    let repo_path = &self.config.repo_path;
    let git_config = &self.config.git;

    state.set_stage(Stage::Branching);
    if let Err(e) = git::branch::create(
      self.runner,
      repo_path,
      &git_config.remote,
      &handoff.branch,
      &git_config.base_branch,
    ) {
      if matches!(e, DeflakeError::Cancelled) {
        return Err(e);
      }
      warn!("could not create {}: {e}", handoff.branch);
      state.finish_candidate(CandidateStatus::Abandoned(e.to_string()));
      return Ok(ChangeOutcome::Abandoned);
    }
    state.set_branch(&handoff.branch);

    let Some(agent_config) = &self.config.agent else {
      return self.hand_off(state, handoff);
    };

    match self.agent_fix(state, &handoff, agent_config) {
      Ok(verification) => Ok(ChangeOutcome::Ready(handoff, verification)),
      Err(DeflakeError::Cancelled) => Err(DeflakeError::Cancelled),
      Err(DeflakeError::Lint { output }) => {
        state.record(format!("lint still failing, handing off:\n{output}"));
        self.hand_off(state, handoff)
      }
      Err(e) => {
        warn!("fix for {} failed: {e}", handoff.candidate.test_path);
        self.discard_branch(&handoff)?;
        state.finish_candidate(CandidateStatus::Abandoned(e.to_string()));
        Ok(ChangeOutcome::Abandoned)
      }
    }
  }

  fn hand_off(&self, state: &mut WorkflowState, handoff: Handoff) -> Result<ChangeOutcome> {
    state.set_stage(Stage::Fixing);
    handoff.save(&self.config.state_dir())?;
    state.finish_candidate(CandidateStatus::AwaitingFix);
    Ok(ChangeOutcome::AwaitingFix(handoff))
  }

  /// Complete a human fix: lint, verify, commit and submit.
  ///
  /// Lint and verification failures leave the handoff in place so the fix
  /// can be corrected and `finish` retried.
  pub fn finish(
    &self,
    state: &mut WorkflowState,
    handoff: &Handoff,
    summary: Option<&str>,
  ) -> Result<String> {
    let current = git::branch::current(self.runner, &self.config.repo_path)?;
    if current != handoff.branch {
      return Err(DeflakeError::Config(format!(
        "on branch {current}, expected {}",
        handoff.branch
      )));
    }

    state.select(&handoff.candidate);
    state.set_branch(&handoff.branch);

    let verification = self.check(state, handoff)?;
    let url = self.submit(state, handoff, &verification, summary)?;
    Handoff::remove(&self.config.state_dir())?;
    Ok(url)
  }

  /// Give up on a handed-off candidate and delete its branch.
  pub fn abandon(&self, handoff: &Handoff) -> Result<()> {
    info!("abandoning {}", handoff.candidate.test_path);
    self.discard_branch(handoff)?;
    Handoff::remove(&self.config.state_dir())
  }
}
