use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{DeflakeError, Result};
use crate::exec::{CommandRunner, Invocation};

fn git<I, S>(repo_path: &Path, args: I) -> Invocation
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  Invocation::new("git", args, repo_path)
}

/// True when `git status --porcelain` reports nothing.
pub fn is_clean(runner: &impl CommandRunner, repo_path: &Path) -> Result<bool> {
  let output = runner.run_checked(&git(repo_path, ["status", "--porcelain"]))?;
  Ok(output.stdout.trim().is_empty())
}

pub fn current(runner: &impl CommandRunner, repo_path: &Path) -> Result<String> {
  let output = runner.run_checked(&git(repo_path, ["rev-parse", "--abbrev-ref", "HEAD"]))?;
  Ok(output.stdout.trim().to_string())
}

/// Create `branch` from the latest `remote/base` and check it out.
///
/// A branch left over from an earlier run is reset to `remote/base`; callers
/// must not pass a branch that a pending handoff still refers to.
pub fn create(
  runner: &impl CommandRunner,
  repo_path: &Path,
  remote: &str,
  branch: &str,
  base_branch: &str,
) -> Result<()> {
  debug!("fetching latest {remote}/{base_branch}");
  let fetch = runner.run(&git(repo_path, ["fetch", remote, base_branch]))?;
  if !fetch.success() {
    debug!("fetch warning (non-fatal): {}", fetch.stderr.trim());
  }

  info!("creating branch {branch} from {remote}/{base_branch}");
  let start = format!("{remote}/{base_branch}");
  let output = runner.run(&git(repo_path, ["checkout", "-b", branch, start.as_str()]))?;

  if !output.success() {
    if output.stderr.contains("already exists") {
      warn!("branch {branch} already exists, resetting it to {start}");
      runner.run_checked(&git(repo_path, ["checkout", "-B", branch, start.as_str()]))?;
      return Ok(());
    }
    return Err(DeflakeError::ExternalTool {
      tool: "git".into(),
      command: format!("git checkout -b {branch} {start}"),
      code: output.code,
      output: output.combined(),
    });
  }

  Ok(())
}

/// Commits on HEAD that are not on `remote/base`.
pub fn commit_count(
  runner: &impl CommandRunner,
  repo_path: &Path,
  remote: &str,
  base_branch: &str,
) -> Result<u32> {
  let range = format!("{remote}/{base_branch}..HEAD");
  let output = runner.run_checked(&git(repo_path, ["rev-list", "--count", range.as_str()]))?;
  let count = output.stdout.trim();
  count.parse().map_err(|_| DeflakeError::ExternalTool {
    tool: "git".into(),
    command: format!("git rev-list --count {range}"),
    code: output.code,
    output: format!("unexpected count {count:?}"),
  })
}

/// `owner/repo` of a GitHub remote, read from `git remote get-url`.
pub fn remote_repo(runner: &impl CommandRunner, repo_path: &Path, remote: &str) -> Result<String> {
  let output = runner.run_checked(&git(repo_path, ["remote", "get-url", remote]))?;
  let url = output.stdout.trim();
  repo_slug(url).ok_or_else(|| {
    DeflakeError::Config(format!(
      "cannot tell owner/repo from {remote} url {url:?}; set git.upstream"
    ))
  })
}

/// `https://host/owner/repo.git`, `ssh://git@host/owner/repo` and
/// `git@host:owner/repo.git` all give `owner/repo`.
fn repo_slug(url: &str) -> Option<String> {
  let url = url.trim_end_matches('/');
  let url = url.strip_suffix(".git").unwrap_or(url);
  let path = match url.split_once("://") {
    Some((_, rest)) => rest.split_once('/')?.1,
    None => url.split_once(':')?.1,
  };
  let mut parts = path.rsplitn(3, '/');
  let repo = parts.next()?;
  let owner = parts.next()?;
  if owner.is_empty() || repo.is_empty() {
    return None;
  }
  Some(format!("{owner}/{repo}"))
}

pub fn checkout(runner: &impl CommandRunner, repo_path: &Path, branch: &str) -> Result<()> {
  runner.run_checked(&git(repo_path, ["checkout", branch]))?;
  Ok(())
}

pub fn delete(runner: &impl CommandRunner, repo_path: &Path, branch: &str) -> Result<()> {
  info!("deleting branch {branch}");
  runner.run_checked(&git(repo_path, ["branch", "-D", branch]))?;
  Ok(())
}

/// Throw away uncommitted edits, e.g. a rejected agent fix.
pub fn discard_changes(runner: &impl CommandRunner, repo_path: &Path) -> Result<()> {
  runner.run_checked(&git(repo_path, ["reset", "--hard", "HEAD"]))?;
  runner.run_checked(&git(repo_path, ["clean", "-fd"]))?;
  Ok(())
}

/// Stage everything and commit with `message` passed on stdin.
pub fn commit_all(runner: &impl CommandRunner, repo_path: &Path, message: &str) -> Result<()> {
  runner.run_checked(&git(repo_path, ["add", "--all"]))?;
  runner.run_checked(&git(repo_path, ["commit", "-F", "-"]).stdin(message))?;
  info!("committed: {}", message.lines().next().unwrap_or_default());
  Ok(())
}

pub fn push(runner: &impl CommandRunner, repo_path: &Path, remote: &str, branch: &str) -> Result<()> {
  info!("pushing branch {branch} to {remote}");
  runner.run_checked(&git(repo_path, ["push", "-u", remote, branch]))?;
  Ok(())
}

fn exclude_path(runner: &impl CommandRunner, repo_path: &Path) -> Result<PathBuf> {
  let output = runner.run_checked(&git(repo_path, ["rev-parse", "--git-path", "info/exclude"]))?;
  let path = PathBuf::from(output.stdout.trim());
  Ok(if path.is_absolute() {
    path
  } else {
    repo_path.join(path)
  })
}

/// Add `pattern` to `.git/info/exclude` so workflow files never get committed.
pub fn ensure_excluded(
  runner: &impl CommandRunner,
  repo_path: &Path,
  pattern: &str,
) -> Result<()> {
  let exclude = exclude_path(runner, repo_path)?;
  if exclude.exists() {
    let content = std::fs::read_to_string(&exclude)?;
    if content.lines().any(|line| line.trim() == pattern) {
      return Ok(());
    }
    let suffix = if content.is_empty() || content.ends_with('\n') {
      ""
    } else {
      "\n"
    };
    std::fs::write(&exclude, format!("{content}{suffix}{pattern}\n"))?;
  } else {
    if let Some(parent) = exclude.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&exclude, format!("{pattern}\n"))?;
  }
  Ok(())
}
