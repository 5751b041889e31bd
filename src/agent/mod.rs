pub mod model;

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::exec::{CommandRunner, Invocation};
use crate::pipeline::reproduce::ReproductionResult;
use crate::report::record::FlakyTestRecord;

const SYSTEM_PROMPT: &str = r#"You fix flaky tests.

Rules:
- Find the source of nondeterminism (timing, ports, ordering, shared state, resource limits) and remove it.
- Prefer fixing the test over the code under test unless the code is clearly at fault.
- Do not mark the test as skipped or flaky, and do not raise timeouts as the only change.
- Keep the change minimal and in the style of the surrounding code.
- Do not commit; leave the changes in the working tree."#;

/// What went wrong with the previous attempt, fed back to the agent.
#[derive(Debug, Clone)]
pub enum Feedback {
  Lint(String),
  StillFlaky(ReproductionResult),
}

/// Drives a `claude -p` session that edits the checkout in place.
pub struct FixAgent<'a> {
  config: &'a AgentConfig,
}

impl<'a> FixAgent<'a> {
  pub fn new(config: &'a AgentConfig) -> Self {
    Self { config }
  }

  pub fn fix(
    &self,
    runner: &impl CommandRunner,
    repo_path: &Path,
    candidate: &FlakyTestRecord,
    test_file: &str,
    reproduction: &ReproductionResult,
    feedback: Option<&Feedback>,
  ) -> Result<()> {
    let prompt = build_prompt(candidate, test_file, reproduction, feedback);
    let model = model::resolve(&self.config.model);
    let tools = self.config.allowed_tools.join(",");

    info!("running {} with model={model} for {}", self.config.program, candidate.test_path);
    debug!("prompt: {prompt}");

    let invocation = Invocation::new(
      &self.config.program,
      [
        "-p",
        "--model",
        model,
        "--allowedTools",
        tools.as_str(),
        "--append-system-prompt",
        SYSTEM_PROMPT,
      ],
      repo_path,
    )
    .stdin(prompt)
    .timeout(Duration::from_secs(self.config.timeout_secs))
    // Nested sessions refuse to start while these are set
    .env_remove("CLAUDECODE")
    .env_remove("CLAUDE_CODE_ENTRYPOINT");

    let output = runner.run_checked(&invocation)?;
    debug!("agent output length: {} bytes", output.stdout.len());
    Ok(())
  }
}

fn build_prompt(
  candidate: &FlakyTestRecord,
  test_file: &str,
  reproduction: &ReproductionResult,
  feedback: Option<&Feedback>,
) -> String {
  let references = if candidate.triggering_references.is_empty() {
    "none".to_string()
  } else {
    candidate.triggering_references.join(", ")
  };
  let reason = candidate.reason.as_deref().unwrap_or("unknown");

  let mut prompt = format!(
    r#"## Flaky test: {path}

File: {test_file}
Platform: {platform}
Failures in the reliability report: {count}
Reported reason: {reason}
Seen in: {references}

Locally it failed {failures} of {attempts} runs.

Find why it is nondeterministic and fix it."#,
    path = candidate.test_path,
    platform = candidate.platform,
    count = candidate.failure_count,
    failures = reproduction.failures,
    attempts = reproduction.attempts,
  );

  match feedback {
    Some(Feedback::Lint(output)) => {
      prompt.push_str(&format!(
        "\n\n## Previous attempt failed lint\n\n```\n{output}\n```\n\nFix the lint errors without undoing the fix."
      ));
    }
    Some(Feedback::StillFlaky(result)) => {
      prompt.push_str(&format!(
        "\n\n## Previous attempt did not fix it\n\nAfter your change the test still failed {} of {} runs. Look for another source of nondeterminism.",
        result.failures, result.attempts
      ));
    }
    None => {}
  }

  prompt
}
