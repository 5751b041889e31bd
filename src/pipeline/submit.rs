use tracing::info;

use crate::error::Result;
use crate::exec::CommandRunner;
use crate::git;
use crate::github::cli::GhClient;
use crate::pipeline::reproduce::ReproductionResult;
use crate::pipeline::Workflow;
use crate::state::handoff::Handoff;
use crate::state::workflow::{CandidateStatus, Stage, WorkflowState};

const WRAP_AT: usize = 72;

/// `<subsystem>: <summary>`, a wrapped body and a `Refs:` trailer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitMessage {
  pub subsystem: String,
  pub summary: String,
  pub body: String,
  pub reference: String,
}

impl CommitMessage {
  pub fn subject(&self) -> String {
    format!("{}: {}", self.subsystem, self.summary)
  }
}

impl std::fmt::Display for CommitMessage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "{}", self.subject())?;
    writeln!(f)?;
    writeln!(f, "{}", wrap(&self.body, WRAP_AT))?;
    writeln!(f)?;
    writeln!(f, "Refs: {}", self.reference)
  }
}

fn wrap(text: &str, width: usize) -> String {
  let mut lines: Vec<String> = Vec::new();
  let mut line = String::new();
  for word in text.split_whitespace() {
    if !line.is_empty() && line.len() + 1 + word.len() > width {
      lines.push(std::mem::take(&mut line));
    }
    if !line.is_empty() {
      line.push(' ');
    }
    line.push_str(word);
  }
  if !line.is_empty() {
    lines.push(line);
  }
  lines.join("\n")
}

pub fn commit_message(
  subsystem: &str,
  summary: Option<&str>,
  handoff: &Handoff,
  verification: &ReproductionResult,
) -> CommitMessage {
  let summary = summary
    .map(str::to_string)
    .unwrap_or_else(|| format!("deflake {}", handoff.candidate.short_name()));
  let body = format!(
    "{test} failed {failures} of {attempts} local runs before this change and \
     {after} of {verified} runs after it.",
    test = handoff.candidate.test_path,
    failures = handoff.reproduction.failures,
    attempts = handoff.reproduction.attempts,
    after = verification.failures,
    verified = verification.attempts,
  );
  CommitMessage {
    subsystem: subsystem.to_string(),
    summary,
    body,
    reference: handoff.report_reference.clone(),
  }
}

fn pr_body(
  handoff: &Handoff,
  verification: &ReproductionResult,
  state: &WorkflowState,
) -> String {
  let candidate = &handoff.candidate;
  let mut body = format!(
    "Fixes flakiness of `{test}` reported in {reference}.\n\n\
     - Report: {count} failures ({platform})\n\
     - Before: {before_f}/{before_n} local runs failed\n\
     - After: {after_f}/{after_n} local runs failed\n",
    test = candidate.test_path,
    reference = handoff.report_reference,
    count = candidate.failure_count,
    platform = candidate.platform,
    before_f = handoff.reproduction.failures,
    before_n = handoff.reproduction.attempts,
    after_f = verification.failures,
    after_n = verification.attempts,
  );
  if !candidate.triggering_references.is_empty() {
    body.push_str(&format!(
      "- Seen in: {}\n",
      candidate.triggering_references.join(", ")
    ));
  }
  body.push_str(&format!("\ndeflake run {}\n", state.run_id()));
  body
}

impl<R: CommandRunner> Workflow<'_, R> {
  /// `git.upstream`, or the GitHub repository behind `git.remote`.
  pub fn upstream_repo(&self) -> Result<String> {
    let git_config = &self.config.git;
    match &git_config.upstream {
      Some(repo) => Ok(repo.clone()),
      None => git::branch::remote_repo(self.runner, &self.config.repo_path, &git_config.remote),
    }
  }

  /// Commit, push and open the pull request.
  ///
  /// Uncommitted changes are committed first; a fix already committed on the
  /// branch is pushed as is. Errors here abort the run and leave the branch
  /// in place for inspection.
  pub fn submit(
    &self,
    state: &mut WorkflowState,
    handoff: &Handoff,
    verification: &ReproductionResult,
    summary: Option<&str>,
  ) -> Result<String> {
    let repo_path = &self.config.repo_path;
    let git_config = &self.config.git;

    let upstream = self.upstream_repo()?;

    state.set_stage(Stage::Committing);
    let message = commit_message(&self.config.commit.subsystem, summary, handoff, verification);
    if git::branch::is_clean(self.runner, repo_path)? {
      info!("{} already committed on {}", handoff.candidate.test_path, handoff.branch);
    } else {
      git::branch::commit_all(self.runner, repo_path, &message.to_string())?;
    }

    state.set_stage(Stage::Submitting);
    git::branch::push(self.runner, repo_path, &git_config.remote, &handoff.branch)?;

    let head = match &git_config.fork_owner {
      Some(owner) => format!("{owner}:{}", handoff.branch),
      None => handoff.branch.clone(),
    };
    let url = GhClient::new(self.runner, repo_path).create_pr(
      &upstream,
      &git_config.base_branch,
      &head,
      &message.subject(),
      &pr_body(handoff, verification, state),
    )?;

    info!("submitted {} as {url}", handoff.candidate.test_path);
    state.finish_candidate(CandidateStatus::Submitted(url.clone()));
    state.set_stage(Stage::Done);
    Ok(url)
  }
}
