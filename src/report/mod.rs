pub mod record;
pub mod table;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReportConfig;
use crate::error::Result;
use crate::report::record::FlakyTestRecord;

/// A fetched reliability report. `created_at` closes the observation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
  pub number: Option<u64>,
  pub title: String,
  pub url: Option<String>,
  pub created_at: DateTime<Utc>,
  pub records: Vec<FlakyTestRecord>,
}

impl Report {
  pub fn from_body(
    number: Option<u64>,
    title: &str,
    url: Option<String>,
    created_at: DateTime<Utc>,
    body: &str,
    config: &ReportConfig,
  ) -> Self {
    Self {
      number,
      title: title.to_string(),
      url,
      created_at,
      records: table::parse(body, config),
    }
  }

  /// Read a report saved as a markdown file.
  pub fn from_file(path: &Path, config: &ReportConfig) -> Result<Self> {
    let body = std::fs::read_to_string(path)?;
    let created_at: DateTime<Utc> = std::fs::metadata(path)?.modified()?.into();
    let title = path
      .file_stem()
      .map(|s| s.to_string_lossy().to_string())
      .unwrap_or_default();
    Ok(Self::from_body(None, &title, None, created_at, &body, config))
  }

  /// How the report is cited in commit messages and pull requests.
  pub fn reference(&self) -> String {
    match (&self.url, self.number) {
      (Some(url), _) => url.clone(),
      (None, Some(n)) => format!("#{n}"),
      (None, None) => self.title.clone(),
    }
  }
}

impl std::fmt::Display for Report {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.number {
      Some(n) => write!(f, "#{n}: {}", self.title),
      None => f.write_str(&self.title),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_from_file() {
    let mut file = tempfile::Builder::new()
      .prefix("flakes-")
      .suffix(".md")
      .tempfile()
      .unwrap();
    file
      .write_all(b"| Test | Failures |\n|---|---|\n| parallel/test-a | 4 |\n")
      .unwrap();

    let report = Report::from_file(file.path(), &ReportConfig::default()).unwrap();
    assert_eq!(report.records.len(), 1);
    assert!(report.title.starts_with("flakes-"));
    assert_eq!(report.reference(), report.title);
  }

  #[test]
  fn test_reference_prefers_url() {
    let report = Report::from_body(
      Some(812),
      "Flakes",
      Some("https://github.com/o/r/issues/812".into()),
      Utc::now(),
      "",
      &ReportConfig::default(),
    );
    assert_eq!(report.reference(), "https://github.com/o/r/issues/812");
    assert_eq!(report.to_string(), "#812: Flakes");
  }
}
