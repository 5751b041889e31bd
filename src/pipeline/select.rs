use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{DenyEntry, SelectorConfig};
use crate::error::Result;
use crate::git::history::ModificationLog;
use crate::report::record::{FlakyTestRecord, Platform};

/// A compiled deny-list entry.
#[derive(Debug)]
pub enum Signature {
  Exact(String),
  Pattern(Regex),
}

impl Signature {
  pub fn compile(entry: &DenyEntry) -> Result<Self> {
    Ok(match entry {
      DenyEntry::Exact(s) => Signature::Exact(s.clone()),
      DenyEntry::Regex { regex } => Signature::Pattern(Regex::new(regex)?),
    })
  }

  fn matches_text(&self, text: &str) -> bool {
    match self {
      Signature::Exact(s) => text.trim() == s,
      Signature::Pattern(re) => re.is_match(text),
    }
  }

  /// Matches the test path or the failure reason.
  pub fn matches(&self, record: &FlakyTestRecord) -> bool {
    self.matches_text(&record.test_path)
      || record.reason.as_deref().is_some_and(|r| self.matches_text(r))
  }
}

impl std::fmt::Display for Signature {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Signature::Exact(s) => write!(f, "{s:?}"),
      Signature::Pattern(re) => write!(f, "/{}/", re.as_str()),
    }
  }
}

pub struct Selector {
  signatures: Vec<Signature>,
  skip_platforms: Vec<Platform>,
  test_file: String,
}

impl Selector {
  pub fn new(config: &SelectorConfig) -> Result<Self> {
    let signatures = config
      .deny_list
      .iter()
      .map(Signature::compile)
      .collect::<Result<Vec<_>>>()?;
    Ok(Self {
      signatures,
      skip_platforms: config.skip_platforms.clone(),
      test_file: config.test_file.clone(),
    })
  }

  /// Repository path of the file a record's test lives in.
  pub fn test_file(&self, record: &FlakyTestRecord) -> String {
    self.test_file.replace("{test}", record.file_part())
  }

  /// Eligible records, best first.
  ///
  /// Exclusions run in order: deny-list signatures, skipped platforms, then
  /// test files changed after `window_end`. The rest is ordered by failure
  /// count descending with ties kept in input order.
  pub fn rank<'r>(
    &self,
    records: &'r [FlakyTestRecord],
    window_end: DateTime<Utc>,
    history: &impl ModificationLog,
  ) -> Vec<&'r FlakyTestRecord> {
    let mut eligible: Vec<&FlakyTestRecord> = records
      .iter()
      .filter(|r| match self.signatures.iter().find(|s| s.matches(r)) {
        Some(sig) => {
          info!("excluding {}: infrastructure signature {sig}", r.test_path);
          false
        }
        None => true,
      })
      .filter(|r| {
        let skip = self.skip_platforms.contains(&r.platform);
        if skip {
          info!("excluding {}: {}-only failure", r.test_path, r.platform);
        }
        !skip
      })
      .filter(|r| !self.modified_after(r, window_end, history))
      .collect();

    eligible.sort_by(|a, b| b.failure_count.cmp(&a.failure_count));
    debug!("{} of {} records eligible", eligible.len(), records.len());
    eligible
  }

  /// Highest-ranked record, or `None` when every record was excluded.
  pub fn select<'r>(
    &self,
    records: &'r [FlakyTestRecord],
    window_end: DateTime<Utc>,
    history: &impl ModificationLog,
  ) -> Option<&'r FlakyTestRecord> {
    self.rank(records, window_end, history).into_iter().next()
  }

  fn modified_after(
    &self,
    record: &FlakyTestRecord,
    window_end: DateTime<Utc>,
    history: &impl ModificationLog,
  ) -> bool {
    let file = self.test_file(record);
    match history.last_modified(&file) {
      Ok(Some(changed)) if changed > window_end => {
        info!(
          "excluding {}: {file} changed at {changed}, after the report window",
          record.test_path
        );
        true
      }
      Ok(_) => false,
      Err(e) => {
        warn!("could not read history of {file}: {e}");
        false
      }
    }
  }
}
