use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::report::record::FlakyTestRecord;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Fetching,
  Selecting,
  Reproducing,
  Branching,
  Fixing,
  Linting,
  Verifying,
  Committing,
  Submitting,
  Done,
}

/// How a candidate left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateStatus {
  NonReproducible,
  Abandoned(String),
  AwaitingFix,
  Submitted(String),
}

impl std::fmt::Display for CandidateStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CandidateStatus::NonReproducible => f.write_str("not reproduced"),
      CandidateStatus::Abandoned(reason) => write!(f, "abandoned: {reason}"),
      CandidateStatus::AwaitingFix => f.write_str("awaiting fix"),
      CandidateStatus::Submitted(url) => write!(f, "submitted {url}"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct CandidateOutcome {
  pub test_path: String,
  pub status: CandidateStatus,
}

/// Process-scoped record of one workflow run.
pub struct WorkflowState {
  run_id: Uuid,
  stage: Stage,
  candidate: Option<FlakyTestRecord>,
  branch: Option<String>,
  outcomes: Vec<CandidateOutcome>,
  log: Vec<String>,
}

impl Default for WorkflowState {
  fn default() -> Self {
    Self::new()
  }
}

impl WorkflowState {
  pub fn new() -> Self {
    let run_id = Uuid::new_v4();
    info!("run {run_id} started");
    Self {
      run_id,
      stage: Stage::Fetching,
      candidate: None,
      branch: None,
      outcomes: Vec::new(),
      log: Vec::new(),
    }
  }

  pub fn run_id(&self) -> Uuid {
    self.run_id
  }

  pub fn stage(&self) -> Stage {
    self.stage
  }

  pub fn candidate(&self) -> Option<&FlakyTestRecord> {
    self.candidate.as_ref()
  }

  pub fn branch(&self) -> Option<&str> {
    self.branch.as_deref()
  }

  pub fn outcomes(&self) -> &[CandidateOutcome] {
    &self.outcomes
  }

  pub fn log(&self) -> &[String] {
    &self.log
  }

  pub fn set_stage(&mut self, stage: Stage) {
    if self.stage != stage {
      let subject = self
        .candidate
        .as_ref()
        .map(|c| c.test_path.as_str())
        .unwrap_or("-");
      self.record(format!("{subject}: {:?} -> {stage:?}", self.stage));
      self.stage = stage;
    }
  }

  pub fn select(&mut self, candidate: &FlakyTestRecord) {
    self.record(format!("selected {candidate}"));
    self.candidate = Some(candidate.clone());
    self.branch = None;
  }

  pub fn set_branch(&mut self, branch: &str) {
    self.branch = Some(branch.to_string());
  }

  /// Close out the current candidate.
  pub fn finish_candidate(&mut self, status: CandidateStatus) {
    let Some(candidate) = self.candidate.take() else {
      return;
    };
    self.record(format!("{}: {status:?}", candidate.test_path));
    self.outcomes.push(CandidateOutcome {
      test_path: candidate.test_path,
      status,
    });
    self.branch = None;
  }

  /// Log a line and keep it for the run summary.
  pub fn record(&mut self, line: impl Into<String>) {
    let line = line.into();
    info!("{line}");
    self.log.push(line);
  }

  pub fn summary(&self) -> RunSummary {
    let mut summary = RunSummary::default();
    for outcome in &self.outcomes {
      match outcome.status {
        CandidateStatus::NonReproducible => summary.non_reproducible += 1,
        CandidateStatus::Abandoned(_) => summary.abandoned += 1,
        CandidateStatus::AwaitingFix => summary.awaiting_fix += 1,
        CandidateStatus::Submitted(_) => summary.submitted += 1,
      }
    }
    summary
  }
}

#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
  pub non_reproducible: usize,
  pub abandoned: usize,
  pub awaiting_fix: usize,
  pub submitted: usize,
}

impl std::fmt::Display for RunSummary {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "non_reproducible={}, abandoned={}, awaiting_fix={}, submitted={}",
      self.non_reproducible, self.abandoned, self.awaiting_fix, self.submitted
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::testing::record;

  #[test]
  fn test_candidate_lifecycle() {
    let mut state = WorkflowState::new();
    state.set_stage(Stage::Selecting);
    state.select(&record("parallel/test-a", 4));
    state.set_stage(Stage::Reproducing);
    state.set_branch("deflake/parallel-test-a");
    assert_eq!(state.branch(), Some("deflake/parallel-test-a"));

    state.finish_candidate(CandidateStatus::NonReproducible);
    assert!(state.candidate().is_none());
    assert!(state.branch().is_none());

    state.select(&record("parallel/test-b", 2));
    state.finish_candidate(CandidateStatus::Submitted("https://x/pull/1".into()));

    assert_eq!(
      state.summary(),
      RunSummary {
        non_reproducible: 1,
        submitted: 1,
        ..RunSummary::default()
      }
    );
    assert!(state
      .log()
      .iter()
      .any(|l| l == "parallel/test-a: Selecting -> Reproducing"));
  }

  #[test]
  fn test_outcomes_name_each_candidate() {
    let mut state = WorkflowState::new();
    state.select(&record("parallel/test-a", 4));
    state.finish_candidate(CandidateStatus::Abandoned("timed out".into()));
    state.select(&record("parallel/test-b", 2));
    state.finish_candidate(CandidateStatus::AwaitingFix);

    let lines: Vec<String> = state
      .outcomes()
      .iter()
      .map(|o| format!("{}: {}", o.test_path, o.status))
      .collect();
    assert_eq!(
      lines,
      vec![
        "parallel/test-a: abandoned: timed out",
        "parallel/test-b: awaiting fix"
      ]
    );
  }

  #[test]
  fn test_finish_without_candidate_is_noop() {
    let mut state = WorkflowState::new();
    state.finish_candidate(CandidateStatus::AwaitingFix);
    assert!(state.outcomes().is_empty());
  }
}
