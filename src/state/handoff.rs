use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DeflakeError, Result};
use crate::pipeline::reproduce::ReproductionResult;
use crate::report::record::FlakyTestRecord;

/// Everything `deflake finish` needs to complete a human fix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handoff {
  pub candidate: FlakyTestRecord,
  pub test_file: String,
  pub branch: String,
  /// Branch checked out before the fix branch was created
  pub origin_branch: String,
  pub report_reference: String,
  pub reproduction: ReproductionResult,
  pub created_at: DateTime<Utc>,
}

pub fn handoff_path(state_dir: &Path) -> PathBuf {
  state_dir.join("handoff.yaml")
}

impl Handoff {
  pub fn save(&self, state_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(state_dir)?;
    let path = handoff_path(state_dir);
    std::fs::write(&path, serde_yaml::to_string(self)?)?;
    info!("wrote handoff: {}", path.display());
    Ok(path)
  }

  /// The fix in progress, if any.
  pub fn pending(state_dir: &Path) -> Result<Option<Self>> {
    let path = handoff_path(state_dir);
    if !path.exists() {
      return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(serde_yaml::from_str(&content)?))
  }

  /// `NoCandidate` when no fix is in progress.
  pub fn load(state_dir: &Path) -> Result<Self> {
    Self::pending(state_dir)?.ok_or_else(|| {
      DeflakeError::NoCandidate("no fix in progress; run `deflake run` first".into())
    })
  }

  pub fn remove(state_dir: &Path) -> Result<()> {
    let path = handoff_path(state_dir);
    if path.exists() {
      std::fs::remove_file(&path)?;
      info!("removed handoff: {}", path.display());
    }
    Ok(())
  }
}
