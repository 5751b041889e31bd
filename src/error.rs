use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DeflakeError {
  #[error("config error: {0}")]
  Config(String),

  #[error("config file not found: {0}")]
  ConfigNotFound(PathBuf),

  #[error("fetch error: {0}")]
  Fetch(String),

  #[error("no candidate: {0}")]
  NoCandidate(String),

  #[error("{test} did not fail in {attempts} runs")]
  NonReproducible { test: String, attempts: u32 },

  #[error("{tool} exited with {}: `{command}`\n{output}", exit_label(.code))]
  ExternalTool {
    tool: String,
    command: String,
    code: Option<i32>,
    output: String,
  },

  #[error("lint failed:\n{output}")]
  Lint { output: String },

  #[error("fix not verified: {test} failed {failures}/{attempts} runs")]
  FixNotVerified {
    test: String,
    failures: u32,
    attempts: u32,
  },

  #[error("fix for {test} is in progress on {branch}; run `deflake finish` or `deflake abandon` first")]
  FixInProgress { test: String, branch: String },

  #[error("no changes to submit: {0}")]
  EmptyFix(String),

  #[error("timeout: {0}")]
  Timeout(String),

  #[error("cancelled")]
  Cancelled,

  #[error("another deflake run holds {0}")]
  Locked(PathBuf),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("yaml error: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("regex error: {0}")]
  Regex(#[from] regex::Error),
}

fn exit_label(code: &Option<i32>) -> String {
  match code {
    Some(c) => format!("exit code {c}"),
    None => "no exit code (signal)".to_string(),
  }
}

pub type Result<T> = std::result::Result<T, DeflakeError>;
