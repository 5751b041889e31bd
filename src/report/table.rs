use tracing::{debug, warn};

use crate::config::{KeyValueConfig, ReportConfig};
use crate::report::record::{FlakyTestRecord, Platform};

/// Column positions of one recognised table.
struct Columns {
  test: usize,
  count: usize,
  platform: Option<usize>,
  references: Option<usize>,
  reason: Option<usize>,
}

impl Columns {
  fn locate(header: &[String], config: &ReportConfig) -> Option<Self> {
    let find = |names: &[String]| header.iter().position(|cell| matches_any(cell, names));
    Some(Self {
      test: find(&config.test_columns)?,
      count: find(&config.count_columns)?,
      platform: find(&config.platform_columns),
      references: find(&config.reference_columns),
      reason: find(&config.reason_columns),
    })
  }
}

fn matches_any(cell: &str, names: &[String]) -> bool {
  let cell = unwrap_cell(cell).to_lowercase();
  names.iter().any(|n| n.to_lowercase() == cell)
}

/// Parse every failure table in a markdown body.
///
/// Two layouts are read: row-per-failure tables with a test and a count
/// column, and two-column key/value tables holding one failure each. Rows
/// that cannot be read are skipped. The result is ordered by failure count
/// descending; equal counts keep their order of appearance.
pub fn parse(body: &str, config: &ReportConfig) -> Vec<FlakyTestRecord> {
  let mut records = Vec::new();
  let lines: Vec<&str> = body.lines().collect();
  let mut i = 0;

  while i < lines.len() {
    let is_table_start = is_row(lines[i]) && lines.get(i + 1).is_some_and(|l| is_separator(l));
    if !is_table_start {
      i += 1;
      continue;
    }

    let header_line = i + 1;
    let header = split_row(lines[i]);
    i += 2;
    let mut rows = Vec::new();
    while i < lines.len() && is_row(lines[i]) {
      rows.push((i + 1, split_row(lines[i])));
      i += 1;
    }

    if let Some(columns) = Columns::locate(&header, config) {
      for (line, cells) in &rows {
        match parse_row(cells, header.len(), &columns) {
          Ok(record) => records.push(record),
          Err(reason) => warn!("skipping report row {line}: {reason}"),
        }
      }
    } else if header.len() == 2 && matches_any(&header[0], &config.keys.test) {
      let pairs = std::iter::once(&header).chain(rows.iter().map(|(_, cells)| cells));
      match parse_entry(pairs, &config.keys) {
        Ok(Some(record)) => records.push(record),
        Ok(None) => {}
        Err(reason) => warn!("skipping report entry at line {header_line}: {reason}"),
      }
    } else {
      debug!("ignoring table with header {header:?}");
    }
  }

  records.sort_by(|a, b| b.failure_count.cmp(&a.failure_count));
  records
}

fn parse_row(
  cells: &[String],
  width: usize,
  columns: &Columns,
) -> Result<FlakyTestRecord, String> {
  if cells.len() != width {
    return Err(format!("expected {width} cells, found {}", cells.len()));
  }

  let test_path = unwrap_cell(&cells[columns.test]);
  if test_path.is_empty() {
    return Err("empty test path".into());
  }

  let count_cell = unwrap_cell(&cells[columns.count]);
  let failure_count =
    leading_count(&count_cell).ok_or_else(|| format!("bad failure count {count_cell:?}"))?;

  let platform = columns
    .platform
    .map(|c| Platform::from_cell(&unwrap_cell(&cells[c])))
    .unwrap_or(Platform::Other);

  let triggering_references = columns
    .references
    .map(|c| split_references(&cells[c]))
    .unwrap_or_default();

  let reason = columns
    .reason
    .map(|c| unwrap_cell(&cells[c]))
    .filter(|r| !r.is_empty());

  Ok(FlakyTestRecord {
    test_path,
    failure_count,
    platform,
    triggering_references,
    reason,
  })
}

/// One key/value table, e.g.
///
/// ```text
/// |Reason| `parallel/test-x` |
/// |-|:-|
/// |Type|JSTest Failure|
/// |Failed PR| 5 (https://github.com/nodejs/node/pull/1, ...)|
/// |Appeared| test-ibm-rhel8-x64|
/// ```
///
/// `Ok(None)` when the failure kind is not a test failure.
fn parse_entry<'a>(
  pairs: impl Iterator<Item = &'a Vec<String>>,
  keys: &KeyValueConfig,
) -> Result<Option<FlakyTestRecord>, String> {
  let mut test_path = None;
  let mut count = None;
  let mut triggering_references = Vec::new();
  let mut platform = Platform::Other;
  let mut kind = None;

  for pair in pairs {
    let [key, value] = pair.as_slice() else {
      debug!("ignoring entry row {pair:?}");
      continue;
    };
    if matches_any(key, &keys.test) {
      test_path = Some(unwrap_cell(value));
    } else if matches_any(key, &keys.count) {
      let cell = unwrap_cell(value);
      count = Some(leading_count(&cell).ok_or_else(|| format!("bad failure count {cell:?}"))?);
      triggering_references = parenthesised(&link_text(value))
        .map(split_references)
        .unwrap_or_default();
    } else if matches_any(key, &keys.platform) {
      platform = Platform::from_cell(&unwrap_cell(value));
    } else if matches_any(key, &keys.kind) {
      kind = Some(unwrap_cell(value)).filter(|k| !k.is_empty());
    }
  }

  if let Some(kind) = &kind {
    if !keys.test_kinds.is_empty() && !matches_any(kind, &keys.test_kinds) {
      debug!("ignoring {kind} entry");
      return Ok(None);
    }
  }

  let test_path = test_path.filter(|t| !t.is_empty()).ok_or("empty test path")?;
  let failure_count = count.ok_or("no failure count")?;
  Ok(Some(FlakyTestRecord {
    test_path,
    failure_count,
    platform,
    triggering_references,
    reason: kind,
  }))
}

/// Leading integer of cells like `12` or `5 (#1, #2)`.
fn leading_count(cell: &str) -> Option<u32> {
  let cell = cell.trim();
  let end = cell.find(|c: char| !c.is_ascii_digit()).unwrap_or(cell.len());
  let (digits, rest) = cell.split_at(end);
  if !rest.is_empty() && !rest.starts_with(|c: char| c.is_whitespace() || c == '(') {
    return None;
  }
  digits.parse().ok()
}

fn parenthesised(cell: &str) -> Option<&str> {
  let open = cell.find('(')?;
  let close = cell.rfind(')')?;
  (close > open).then(|| &cell[open + 1..close])
}

fn is_row(line: &str) -> bool {
  let line = line.trim();
  line.starts_with('|') && line.len() > 1
}

fn is_separator(line: &str) -> bool {
  let cells = split_row(line);
  !cells.is_empty()
    && cells.iter().all(|c| {
      let c = c.trim();
      c.contains('-') && c.chars().all(|ch| ch == '-' || ch == ':')
    })
}

fn split_row(line: &str) -> Vec<String> {
  let line = line.trim();
  let line = line.strip_prefix('|').unwrap_or(line);
  let line = line.strip_suffix('|').unwrap_or(line);
  line.split('|').map(|c| c.trim().to_string()).collect()
}

/// Strip backticks, `<code>` tags, bold markers and markdown links down to
/// the visible text.
fn unwrap_cell(cell: &str) -> String {
  let text = link_text(cell.trim());
  let text = text.trim_matches(|c| c == '`' || c == '*').trim();
  let text = text.strip_prefix("<code>").unwrap_or(text);
  let text = text.strip_suffix("</code>").unwrap_or(text);
  text.trim().to_string()
}

fn link_text(cell: &str) -> String {
  let mut out = String::with_capacity(cell.len());
  let mut rest = cell;
  while let Some(open) = rest.find('[') {
    let Some(close) = rest[open..].find("](") else {
      break;
    };
    let close = open + close;
    let Some(end) = rest[close..].find(')') else {
      break;
    };
    out.push_str(&rest[..open]);
    out.push_str(&rest[open + 1..close]);
    rest = &rest[close + end + 1..];
  }
  out.push_str(rest);
  out
}

fn split_references(cell: &str) -> Vec<String> {
  link_text(cell)
    .split(|c: char| c == ',' || c.is_whitespace())
    .map(|s| s.trim_matches('`').trim())
    .filter(|s| !s.is_empty())
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  const REPORT: &str = r#"
# Flakes 2026-10-12

Some prose before the table.

| Test | Reason | Failures | Platform | References |
|------|--------|---------:|----------|------------|
| `parallel/test-http-agent` | `ECONNRESET` | 12 | ubuntu2204-x64 | [#5012](https://ci/5012), #5013 |
| [parallel/test-fs-watch](https://github.com/x) | timeout | 30 | osx13 | #4999 |
| | missing test | 3 | linux | |
| sequential/test-net-bind | EADDRINUSE | many | linux | #1 |
| parallel/test-worker | crash | 12 | win2019, win10 | 77 78 |
| short | row |

## Other table

| Job | Status |
|-----|--------|
| node-test-commit | red |
"#;

  #[test]
  fn test_parse_report_table() {
    let records = parse(REPORT, &ReportConfig::default());
    let paths: Vec<&str> = records.iter().map(|r| r.test_path.as_str()).collect();
    assert_eq!(
      paths,
      vec![
        "parallel/test-fs-watch",
        "parallel/test-http-agent",
        "parallel/test-worker",
      ]
    );

    let agent = &records[1];
    assert_eq!(agent.failure_count, 12);
    assert_eq!(agent.platform, Platform::Linux);
    assert_eq!(agent.reason.as_deref(), Some("ECONNRESET"));
    assert_eq!(agent.triggering_references, vec!["#5012", "#5013"]);

    assert_eq!(records[0].platform, Platform::Macos);
    assert_eq!(records[2].platform, Platform::Windows);
    assert_eq!(records[2].triggering_references, vec!["77", "78"]);
  }

  #[test]
  fn test_every_record_has_test_path() {
    let records = parse(REPORT, &ReportConfig::default());
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| !r.test_path.is_empty()));
  }

  #[test]
  fn test_negative_count_is_skipped() {
    let body = "| Test | Failures |\n|---|---|\n| a | -4 |\n| b | 2 |\n";
    let records = parse(body, &ReportConfig::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].test_path, "b");
  }

  #[test]
  fn test_ties_keep_appearance_order() {
    let body = "| Test | Failures |\n|---|---|\n| a | 50 |\n| c | 120 |\n| b | 120 |\n";
    let records = parse(body, &ReportConfig::default());
    let paths: Vec<&str> = records.iter().map(|r| r.test_path.as_str()).collect();
    assert_eq!(paths, vec!["c", "b", "a"]);
  }

  #[test]
  fn test_multiple_tables_are_merged() {
    let body = "| Test | Count |\n|---|---|\n| a | 1 |\n\ntext\n\n| Test | Count |\n|:--|--:|\n| b | 9 |\n";
    let records = parse(body, &ReportConfig::default());
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].test_path, "b");
  }

  const NCU_CI_REPORT: &str = r#"
# Failures in node-test-pull-request/62450 to node-test-pull-request/62530 that failed more than 2 PRs

## JSTest Failure

|Reason| `parallel/test-http2-large-file` |
|-|:-|
|Type|JSTest Failure|
|Failed PR| 5 (https://github.com/nodejs/node/pull/55101, https://github.com/nodejs/node/pull/55102, https://github.com/nodejs/node/pull/55108, https://github.com/nodejs/node/pull/55110, https://github.com/nodejs/node/pull/55117)|
|Appeared| test-ibm-rhel8-x64, test-digitalocean-ubuntu2204-x64|
|First CI| https://ci.nodejs.org/job/node-test-pull-request/62451/|
|Last CI| https://ci.nodejs.org/job/node-test-pull-request/62522/|

<details>
<summary>Example</summary>

```
not ok 1871 parallel/test-http2-large-file
  ---
  duration_ms: 120.51
  severity: fail
  exitcode: 1
  ...
```
</details>

|Reason| <code>sequential/test-watch-mode</code> |
|-|:-|
|Type|JSTest Failure|
|Failed PR| 3 (https://github.com/nodejs/node/pull/55090, https://github.com/nodejs/node/pull/55112, https://github.com/nodejs/node/pull/55120)|
|Appeared| test-orka-macos11-x64, test-orka-macos13-x64|
|First CI| https://ci.nodejs.org/job/node-test-pull-request/62460/|
|Last CI| https://ci.nodejs.org/job/node-test-pull-request/62519/|

|Reason| `parallel/test-fs-cp` |
|-|:-|
|Type|JSTest Failure|
|Failed PR| 3 (https://github.com/nodejs/node/pull/55095, https://github.com/nodejs/node/pull/55099, https://github.com/nodejs/node/pull/55111)|
|Appeared| test-azure_msft-win10_vs2019-x64|

## Jenkins Failure

|Reason| `Backing channel 'JNLP4-connect connection from 10.0.0.5/10.0.0.5:4321' is disconnected.` |
|-|:-|
|Type|Jenkins Failure|
|Failed PR| 12 (https://github.com/nodejs/node/pull/55000, https://github.com/nodejs/node/pull/55001)|
|Appeared| test-equinix-ubuntu2004_container-armv7l|
"#;

  #[test]
  fn test_parse_ncu_ci_report() {
    let records = parse(NCU_CI_REPORT, &ReportConfig::default());
    let paths: Vec<&str> = records.iter().map(|r| r.test_path.as_str()).collect();
    assert_eq!(
      paths,
      vec![
        "parallel/test-http2-large-file",
        "sequential/test-watch-mode",
        "parallel/test-fs-cp",
      ]
    );

    let http2 = &records[0];
    assert_eq!(http2.failure_count, 5);
    assert_eq!(http2.platform, Platform::Linux);
    assert_eq!(http2.reason.as_deref(), Some("JSTest Failure"));
    assert_eq!(http2.triggering_references.len(), 5);
    assert_eq!(
      http2.triggering_references[0],
      "https://github.com/nodejs/node/pull/55101"
    );

    assert_eq!(records[1].platform, Platform::Macos);
    assert_eq!(records[2].platform, Platform::Windows);
  }

  #[test]
  fn test_every_failure_kind_when_unfiltered() {
    let mut config = ReportConfig::default();
    config.keys.test_kinds.clear();
    let records = parse(NCU_CI_REPORT, &config);
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].failure_count, 12);
    assert_eq!(records[0].reason.as_deref(), Some("Jenkins Failure"));
  }

  #[test]
  fn test_entry_without_count_is_skipped() {
    let body = "|Reason| `parallel/test-a` |\n|-|:-|\n|Type|JSTest Failure|\n|Appeared| test-ibm-rhel8-x64|\n";
    assert!(parse(body, &ReportConfig::default()).is_empty());
  }

  #[test]
  fn test_count_cell_with_references() {
    let body = "| Test | Failures |\n|---|---|\n| a | 7 (#1, #2) |\n| b | 7x |\n";
    let records = parse(body, &ReportConfig::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].failure_count, 7);
  }

  #[test]
  fn test_leading_count() {
    assert_eq!(leading_count("12"), Some(12));
    assert_eq!(leading_count("5 (https://x/1, https://x/2)"), Some(5));
    assert_eq!(leading_count("5(#1)"), Some(5));
    assert_eq!(leading_count("-4"), None);
    assert_eq!(leading_count("many"), None);
    assert_eq!(leading_count(""), None);
  }

  #[test]
  fn test_no_table() {
    assert!(parse("nothing flaky this week", &ReportConfig::default()).is_empty());
  }

  #[test]
  fn test_link_text() {
    assert_eq!(link_text("[a](x) and [b](y)"), "a and b");
    assert_eq!(link_text("no links"), "no links");
    assert_eq!(link_text("[broken"), "[broken");
  }
}
