use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
  Linux,
  Macos,
  Windows,
  Arm64,
  Other,
}

impl Platform {
  /// Classify a single platform name as it appears in CI job names.
  pub fn from_name(name: &str) -> Self {
    let name = name.trim().to_lowercase();
    if name.contains("arm64") || name.contains("aarch64") {
      Platform::Arm64
    } else if name.starts_with("win") || name.contains("-win") || name.contains("_win") {
      Platform::Windows
    } else if ["mac", "osx", "darwin"].iter().any(|p| name.contains(p)) {
      Platform::Macos
    } else if ["linux", "ubuntu", "debian", "fedora", "rhel", "centos", "alpine"]
      .iter()
      .any(|p| name.contains(p))
    {
      Platform::Linux
    } else {
      Platform::Other
    }
  }

  /// Classify a report cell; more than one distinct platform is `Other`.
  pub fn from_cell(cell: &str) -> Self {
    let mut found: Option<Platform> = None;
    for name in cell
      .split(|c: char| c == ',' || c.is_whitespace())
      .filter(|s| !s.is_empty())
    {
      let platform = Platform::from_name(name);
      match found {
        None => found = Some(platform),
        Some(p) if p == platform => {}
        Some(_) => return Platform::Other,
      }
    }
    found.unwrap_or(Platform::Other)
  }
}

impl std::fmt::Display for Platform {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Platform::Linux => "linux",
      Platform::Macos => "macos",
      Platform::Windows => "windows",
      Platform::Arm64 => "arm64",
      Platform::Other => "other",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlakyTestRecord {
  pub test_path: String,
  pub failure_count: u32,
  pub platform: Platform,
  #[serde(default)]
  pub triggering_references: Vec<String>,
  #[serde(default)]
  pub reason: Option<String>,
}

impl FlakyTestRecord {
  /// Test path without a `::case` suffix, used to locate the test file.
  pub fn file_part(&self) -> &str {
    self
      .test_path
      .split_once("::")
      .map(|(file, _)| file)
      .unwrap_or(&self.test_path)
  }

  /// Branch-safe slug, e.g. `parallel-test-http-agent`.
  pub fn slug(&self) -> String {
    let mut slug = String::with_capacity(self.test_path.len());
    for c in self.test_path.chars() {
      if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
        slug.push(c.to_ascii_lowercase());
      } else if !slug.ends_with('-') {
        slug.push('-');
      }
    }
    slug.trim_matches(|c| c == '-' || c == '.').to_string()
  }

  /// Last path segment, used in commit subjects.
  pub fn short_name(&self) -> &str {
    let file = self.file_part();
    let base = file.rsplit('/').next().unwrap_or(file);
    match self.test_path.split_once("::") {
      Some(_) => self.test_path.rsplit("::").next().unwrap_or(base),
      None => base,
    }
  }
}

impl std::fmt::Display for FlakyTestRecord {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{} ({} failures, {})",
      self.test_path, self.failure_count, self.platform
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(path: &str) -> FlakyTestRecord {
    FlakyTestRecord {
      test_path: path.into(),
      failure_count: 1,
      platform: Platform::Linux,
      triggering_references: vec![],
      reason: None,
    }
  }

  #[test]
  fn test_platform_from_name() {
    assert_eq!(Platform::from_name("linux-arm64"), Platform::Arm64);
    assert_eq!(Platform::from_name("ubuntu2204-x64"), Platform::Linux);
    assert_eq!(Platform::from_name("win2019-vs2022"), Platform::Windows);
    assert_eq!(
      Platform::from_name("test-azure_msft-win10_vs2019-x64"),
      Platform::Windows
    );
    assert_eq!(Platform::from_name("test-orka-macos11-x64"), Platform::Macos);
    assert_eq!(Platform::from_name("darwin"), Platform::Macos);
    assert_eq!(Platform::from_name("osx13"), Platform::Macos);
    assert_eq!(Platform::from_name("aix72"), Platform::Other);
  }

  #[test]
  fn test_platform_from_cell() {
    assert_eq!(Platform::from_cell("win10, win2019"), Platform::Windows);
    assert_eq!(Platform::from_cell("osx13, ubuntu2204"), Platform::Other);
    assert_eq!(Platform::from_cell(""), Platform::Other);
  }

  #[test]
  fn test_slug_and_names() {
    let r = record("parallel/test-http-agent");
    assert_eq!(r.slug(), "parallel-test-http-agent");
    assert_eq!(r.short_name(), "test-http-agent");
    assert_eq!(r.file_part(), "parallel/test-http-agent");

    let r = record("tests/net.rs::connect_retries");
    assert_eq!(r.file_part(), "tests/net.rs");
    assert_eq!(r.short_name(), "connect_retries");
    assert_eq!(r.slug(), "tests-net.rs-connect_retries");
  }
}
