use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{DeflakeError, Result};
use crate::exec::{CommandRunner, Invocation};

/// Source of "when was this file last changed" answers.
pub trait ModificationLog {
  fn last_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>>;
}

pub struct GitHistory<'a, R: CommandRunner> {
  runner: &'a R,
  repo_path: PathBuf,
}

impl<'a, R: CommandRunner> GitHistory<'a, R> {
  pub fn new(runner: &'a R, repo_path: &Path) -> Self {
    Self {
      runner,
      repo_path: repo_path.to_path_buf(),
    }
  }
}

impl<R: CommandRunner> ModificationLog for GitHistory<'_, R> {
  /// Committer date of the newest commit touching `path`; `None` if untracked.
  fn last_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
    let output = self.runner.run_checked(&Invocation::new(
      "git",
      ["log", "-1", "--format=%cI", "--", path],
      &self.repo_path,
    ))?;

    let stamp = output.stdout.trim();
    if stamp.is_empty() {
      return Ok(None);
    }

    DateTime::parse_from_rfc3339(stamp)
      .map(|d| Some(d.with_timezone(&Utc)))
      .map_err(|e| DeflakeError::ExternalTool {
        tool: "git".into(),
        command: format!("git log -1 --format=%cI -- {path}"),
        code: output.code,
        output: format!("unexpected date {stamp:?}: {e}"),
      })
  }
}
