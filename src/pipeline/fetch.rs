use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{DeflakeError, Result};
use crate::exec::CommandRunner;
use crate::github::cli::{GhClient, GhIssue, IssueQuery};
use crate::report::Report;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Fetch the newest report issue and parse its failure tables.
///
/// The tracker is queried up to `tracker.retries` times with exponential
/// backoff; the last failure is returned as `Fetch`.
pub fn fetch_report(runner: &impl CommandRunner, config: &Config) -> Result<Report> {
  let issue = fetch_latest_issue(runner, config)?;
  let report = Report::from_body(
    Some(issue.number),
    &issue.title,
    Some(issue.url.clone()),
    issue.created_at,
    &issue.body,
    &config.report,
  );
  info!("report {report}: {} records", report.records.len());
  Ok(report)
}

/// Load a report saved locally instead of asking the tracker.
pub fn load_report(path: &Path, config: &Config) -> Result<Report> {
  let report = Report::from_file(path, &config.report)?;
  info!("report {report}: {} records", report.records.len());
  Ok(report)
}

fn fetch_latest_issue(runner: &impl CommandRunner, config: &Config) -> Result<GhIssue> {
  let tracker = &config.tracker;
  let gh = GhClient::new(runner, &config.repo_path);
  let query = IssueQuery {
    repo: &tracker.repo,
    label: tracker.label.as_deref(),
    search: tracker.search.as_deref(),
    limit: tracker.limit,
  };

  let mut attempt = 0;
  let issues = loop {
    attempt += 1;
    match gh.list_issues(&query) {
      Ok(issues) => break issues,
      Err(DeflakeError::Cancelled) => return Err(DeflakeError::Cancelled),
      Err(e) if attempt < tracker.retries => {
        let delay = backoff(tracker.backoff_ms, attempt);
        warn!(
          "fetch attempt {attempt}/{} failed: {e}; retrying in {}ms",
          tracker.retries,
          delay.as_millis()
        );
        std::thread::sleep(delay);
      }
      Err(e) => {
        return Err(DeflakeError::Fetch(format!(
          "{} unreachable after {attempt} attempts: {e}",
          tracker.repo
        )))
      }
    }
  };

  issues
    .into_iter()
    .max_by_key(|i| i.created_at)
    .ok_or_else(|| DeflakeError::Fetch(format!("no report issues found in {}", tracker.repo)))
}

/// Delay before retry `attempt + 1`: doubling from `base_ms`, capped.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
  let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
  Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}
