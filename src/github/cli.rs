use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::error::{DeflakeError, Result};
use crate::exec::{CommandRunner, Invocation};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhIssue {
  pub number: u64,
  pub title: String,
  #[serde(default)]
  pub body: String,
  pub url: String,
  pub created_at: DateTime<Utc>,
}

pub struct IssueQuery<'a> {
  pub repo: &'a str,
  pub label: Option<&'a str>,
  pub search: Option<&'a str>,
  pub limit: u32,
}

/// Thin wrapper over the `gh` CLI.
pub struct GhClient<'a, R: CommandRunner> {
  runner: &'a R,
  cwd: PathBuf,
}

impl<'a, R: CommandRunner> GhClient<'a, R> {
  pub fn new(runner: &'a R, cwd: &Path) -> Self {
    Self {
      runner,
      cwd: cwd.to_path_buf(),
    }
  }

  pub fn list_issues(&self, query: &IssueQuery) -> Result<Vec<GhIssue>> {
    info!("fetching issues for {}", query.repo);

    let mut args = vec![
      "issue".to_string(),
      "list".into(),
      "--repo".into(),
      query.repo.into(),
      "--state".into(),
      "all".into(),
      "--limit".into(),
      query.limit.to_string(),
      "--json".into(),
      "number,title,body,url,createdAt".into(),
    ];
    if let Some(label) = query.label {
      args.extend(["--label".to_string(), label.to_string()]);
    }
    if let Some(search) = query.search {
      args.extend(["--search".to_string(), search.to_string()]);
    }

    let output = self
      .runner
      .run_checked(&Invocation::new("gh", args, &self.cwd))?;
    let issues: Vec<GhIssue> = serde_json::from_str(&output.stdout)?;

    info!("found {} issues", issues.len());
    Ok(issues)
  }

  /// Open a pull request and return its URL.
  pub fn create_pr(
    &self,
    repo: &str,
    base: &str,
    head: &str,
    title: &str,
    body: &str,
  ) -> Result<String> {
    info!("creating PR: {title} ({head} -> {base})");

    let output = self.runner.run_checked(&Invocation::new(
      "gh",
      [
        "pr", "create", "--repo", repo, "--base", base, "--head", head, "--title", title,
        "--body", body,
      ],
      &self.cwd,
    ))?;

    let url = output
      .stdout
      .lines()
      .rev()
      .map(str::trim)
      .find(|l| !l.is_empty())
      .ok_or_else(|| DeflakeError::ExternalTool {
        tool: "gh".into(),
        command: "gh pr create".into(),
        code: output.code,
        output: "no pull request URL in output".into(),
      })?
      .to_string();

    info!("created PR {url}");
    Ok(url)
  }
}
