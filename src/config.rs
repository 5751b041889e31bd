use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DeflakeError, Result};
use crate::report::record::Platform;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
  /// Checkout the workflow operates on
  #[serde(default = "default_repo_path")]
  pub repo_path: PathBuf,
  pub tracker: TrackerConfig,
  #[serde(default)]
  pub report: ReportConfig,
  #[serde(default)]
  pub selector: SelectorConfig,
  pub runner: RunnerConfig,
  #[serde(default)]
  pub lint: Option<LintConfig>,
  #[serde(default)]
  pub agent: Option<AgentConfig>,
  #[serde(default)]
  pub git: GitConfig,
  #[serde(default)]
  pub commit: CommitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
  /// owner/repo holding the reliability reports
  pub repo: String,
  #[serde(default)]
  pub label: Option<String>,
  #[serde(default)]
  pub search: Option<String>,
  #[serde(default = "default_issue_limit")]
  pub limit: u32,
  #[serde(default = "default_retries")]
  pub retries: u32,
  #[serde(default = "default_backoff_ms")]
  pub backoff_ms: u64,
}

/// Header synonyms used to locate report table columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
  #[serde(default = "default_test_columns")]
  pub test_columns: Vec<String>,
  #[serde(default = "default_count_columns")]
  pub count_columns: Vec<String>,
  #[serde(default = "default_platform_columns")]
  pub platform_columns: Vec<String>,
  #[serde(default = "default_reference_columns")]
  pub reference_columns: Vec<String>,
  #[serde(default = "default_reason_columns")]
  pub reason_columns: Vec<String>,
  /// Keys of per-failure key/value tables, e.g. `|Reason| parallel/test-x |`
  #[serde(default)]
  pub keys: KeyValueConfig,
}

/// Row keys of the two-column tables `ncu-ci` writes for each failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueConfig {
  #[serde(default = "default_test_keys")]
  pub test: Vec<String>,
  #[serde(default = "default_count_keys")]
  pub count: Vec<String>,
  #[serde(default = "default_platform_keys")]
  pub platform: Vec<String>,
  #[serde(default = "default_kind_keys")]
  pub kind: Vec<String>,
  /// Failure kinds read as test records; empty accepts every kind
  #[serde(default = "default_test_kinds")]
  pub test_kinds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
  #[serde(default)]
  pub deny_list: Vec<DenyEntry>,
  #[serde(default)]
  pub skip_platforms: Vec<Platform>,
  /// Maps a test path to the file whose history is checked, e.g. `test/{test}.js`
  #[serde(default = "default_test_file")]
  pub test_file: String,
  #[serde(default = "default_max_candidates")]
  pub max_candidates: usize,
}

/// A known infrastructure-failure signature. A bare string matches exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DenyEntry {
  Exact(String),
  Regex { regex: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
  #[default]
  Loop,
  Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
  /// argv template with `{test}` and `{repeat}` placeholders
  pub command: Vec<String>,
  #[serde(default)]
  pub mode: RunnerMode,
  #[serde(default)]
  pub failure_pattern: Option<String>,
  #[serde(default = "default_repeat_count")]
  pub repeat_count: u32,
  #[serde(default = "default_verify_count")]
  pub verify_count: u32,
  #[serde(default = "default_test_timeout")]
  pub timeout_secs: u64,
  #[serde(default)]
  pub budget_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintConfig {
  pub command: Vec<String>,
  #[serde(default = "default_lint_timeout")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
  #[serde(default = "default_agent_program")]
  pub program: String,
  #[serde(default = "default_agent_model")]
  pub model: String,
  #[serde(default = "default_agent_tools")]
  pub allowed_tools: Vec<String>,
  #[serde(default = "default_agent_timeout")]
  pub timeout_secs: u64,
  #[serde(default = "default_agent_attempts")]
  pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
  #[serde(default = "default_remote")]
  pub remote: String,
  #[serde(default = "default_base_branch")]
  pub base_branch: String,
  #[serde(default = "default_branch_prefix")]
  pub branch_prefix: String,
  /// Fork owner for `owner:branch` pull request heads
  #[serde(default)]
  pub fork_owner: Option<String>,
  /// owner/repo pull requests are opened against; derived from `remote` when unset
  #[serde(default)]
  pub upstream: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
  #[serde(default = "default_subsystem")]
  pub subsystem: String,
}

impl Default for ReportConfig {
  fn default() -> Self {
    Self {
      test_columns: default_test_columns(),
      count_columns: default_count_columns(),
      platform_columns: default_platform_columns(),
      reference_columns: default_reference_columns(),
      reason_columns: default_reason_columns(),
      keys: KeyValueConfig::default(),
    }
  }
}

impl Default for KeyValueConfig {
  fn default() -> Self {
    Self {
      test: default_test_keys(),
      count: default_count_keys(),
      platform: default_platform_keys(),
      kind: default_kind_keys(),
      test_kinds: default_test_kinds(),
    }
  }
}

impl Default for SelectorConfig {
  fn default() -> Self {
    Self {
      deny_list: Vec::new(),
      skip_platforms: Vec::new(),
      test_file: default_test_file(),
      max_candidates: default_max_candidates(),
    }
  }
}

impl Default for GitConfig {
  fn default() -> Self {
    Self {
      remote: default_remote(),
      base_branch: default_base_branch(),
      branch_prefix: default_branch_prefix(),
      fork_owner: None,
      upstream: None,
    }
  }
}

impl Default for CommitConfig {
  fn default() -> Self {
    Self {
      subsystem: default_subsystem(),
    }
  }
}

fn default_repo_path() -> PathBuf {
  PathBuf::from(".")
}
fn default_issue_limit() -> u32 {
  5
}
fn default_retries() -> u32 {
  3
}
fn default_backoff_ms() -> u64 {
  500
}
fn default_test_columns() -> Vec<String> {
  vec!["test".into(), "test path".into(), "name".into()]
}
fn default_count_columns() -> Vec<String> {
  vec![
    "failures".into(),
    "failure count".into(),
    "count".into(),
    "failed".into(),
  ]
}
fn default_platform_columns() -> Vec<String> {
  vec!["platform".into(), "platforms".into()]
}
fn default_reference_columns() -> Vec<String> {
  vec![
    "references".into(),
    "refs".into(),
    "prs".into(),
    "failed prs".into(),
    "jobs".into(),
  ]
}
fn default_reason_columns() -> Vec<String> {
  vec!["reason".into(), "error".into()]
}
fn default_test_keys() -> Vec<String> {
  vec!["reason".into()]
}
fn default_count_keys() -> Vec<String> {
  vec!["failed pr".into(), "failed prs".into()]
}
fn default_platform_keys() -> Vec<String> {
  vec!["appeared".into()]
}
fn default_kind_keys() -> Vec<String> {
  vec!["type".into()]
}
fn default_test_kinds() -> Vec<String> {
  vec!["jstest failure".into(), "cctest failure".into()]
}
fn default_test_file() -> String {
  "{test}".to_string()
}
fn default_max_candidates() -> usize {
  5
}
fn default_repeat_count() -> u32 {
  100
}
fn default_verify_count() -> u32 {
  1000
}
fn default_test_timeout() -> u64 {
  120
}
fn default_lint_timeout() -> u64 {
  600
}
fn default_agent_program() -> String {
  "claude".to_string()
}
fn default_agent_model() -> String {
  "sonnet".to_string()
}
fn default_agent_tools() -> Vec<String> {
  vec![
    "Bash".into(),
    "Read".into(),
    "Write".into(),
    "Edit".into(),
    "Glob".into(),
    "Grep".into(),
  ]
}
fn default_agent_timeout() -> u64 {
  1800
}
fn default_agent_attempts() -> u32 {
  2
}
fn default_remote() -> String {
  "origin".to_string()
}
fn default_base_branch() -> String {
  "main".to_string()
}
fn default_branch_prefix() -> String {
  "deflake/".to_string()
}
fn default_subsystem() -> String {
  "test".to_string()
}

impl Config {
  pub fn load(path: &Path) -> Result<Self> {
    if !path.exists() {
      return Err(DeflakeError::ConfigNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if !self.tracker.repo.contains('/') {
      return Err(DeflakeError::Config(format!(
        "tracker.repo must be in owner/repo format: {}",
        self.tracker.repo
      )));
    }
    if self.tracker.retries == 0 {
      return Err(DeflakeError::Config("tracker.retries must be at least 1".into()));
    }
    if self.runner.command.is_empty() {
      return Err(DeflakeError::Config("runner.command is empty".into()));
    }
    if !self.runner.command.iter().any(|a| a.contains("{test}")) {
      return Err(DeflakeError::Config(
        "runner.command must contain a {test} placeholder".into(),
      ));
    }
    if self.runner.repeat_count == 0 || self.runner.verify_count == 0 {
      return Err(DeflakeError::Config(
        "runner.repeat_count and runner.verify_count must be positive".into(),
      ));
    }
    if self.runner.mode == RunnerMode::Batch
      && !self.runner.command.iter().any(|a| a.contains("{repeat}"))
    {
      return Err(DeflakeError::Config(
        "batch mode needs a {repeat} placeholder in runner.command".into(),
      ));
    }
    if let Some(lint) = &self.lint {
      if lint.command.is_empty() {
        return Err(DeflakeError::Config("lint.command is empty".into()));
      }
    }
    if let Some(agent) = &self.agent {
      if agent.max_attempts == 0 {
        return Err(DeflakeError::Config("agent.max_attempts must be at least 1".into()));
      }
    }
    if let Some(upstream) = &self.git.upstream {
      if !upstream.contains('/') {
        return Err(DeflakeError::Config(format!(
          "git.upstream must be in owner/repo format: {upstream}"
        )));
      }
    }
    Ok(())
  }

  pub fn state_dir(&self) -> PathBuf {
    self.repo_path.join(".deflake")
  }
}
