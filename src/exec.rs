use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{DeflakeError, Result};

/// Shared flag flipped by Ctrl-C; running children are killed when it is set.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  pub stdin: Option<String>,
  pub timeout: Option<Duration>,
  pub env_remove: Vec<String>,
}

impl Invocation {
  pub fn new<I, S>(program: &str, args: I, cwd: &Path) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      program: program.to_string(),
      args: args.into_iter().map(Into::into).collect(),
      cwd: cwd.to_path_buf(),
      stdin: None,
      timeout: None,
      env_remove: Vec::new(),
    }
  }

  /// Build from an argv vector such as a configured command template.
  pub fn from_argv(argv: &[String], cwd: &Path) -> Result<Self> {
    let (program, args) = argv
      .split_first()
      .ok_or_else(|| DeflakeError::Config("empty command".into()))?;
    Ok(Self::new(program, args.iter().cloned(), cwd))
  }

  pub fn stdin(mut self, input: impl Into<String>) -> Self {
    self.stdin = Some(input.into());
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn env_remove(mut self, key: &str) -> Self {
    self.env_remove.push(key.to_string());
    self
  }

  /// Tool name used in error reports, e.g. `git` for `/usr/bin/git`.
  pub fn tool(&self) -> String {
    Path::new(&self.program)
      .file_name()
      .map(|n| n.to_string_lossy().to_string())
      .unwrap_or_else(|| self.program.clone())
  }

  pub fn display(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl ToolOutput {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }

  /// stdout and stderr joined for error reports.
  pub fn combined(&self) -> String {
    match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
      (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
      (false, true) => self.stdout.trim_end().to_string(),
      _ => self.stderr.trim_end().to_string(),
    }
  }
}

pub trait CommandRunner {
  /// Run to completion. A non-zero exit is not an error here.
  fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;

  /// Run and turn a non-zero exit into `ExternalTool`.
  fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput> {
    let output = self.run(invocation)?;
    if !output.success() {
      return Err(DeflakeError::ExternalTool {
        tool: invocation.tool(),
        command: invocation.display(),
        code: output.code,
        output: output.combined(),
      });
    }
    Ok(output)
  }
}

#[derive(Clone, Default)]
pub struct SystemRunner {
  cancel: CancelFlag,
}

impl SystemRunner {
  pub fn new(cancel: CancelFlag) -> Self {
    Self { cancel }
  }
}

impl CommandRunner for SystemRunner {
  fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
    if self.cancel.is_cancelled() {
      return Err(DeflakeError::Cancelled);
    }

    debug!("exec: {} (in {})", invocation.display(), invocation.cwd.display());

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args).current_dir(&invocation.cwd);
    for key in &invocation.env_remove {
      cmd.env_remove(key);
    }

    let stdin = if invocation.stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    };

    let mut child = cmd
      .stdin(stdin)
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|e| DeflakeError::ExternalTool {
        tool: invocation.tool(),
        command: invocation.display(),
        code: None,
        output: format!("failed to start: {e}"),
      })?;

    if let (Some(input), Some(mut pipe)) = (&invocation.stdin, child.stdin.take()) {
      if let Err(e) = pipe.write_all(input.as_bytes()) {
        // Exiting without reading stdin is not a failure in itself
        if e.kind() != std::io::ErrorKind::BrokenPipe {
          let _ = child.kill();
          let _ = child.wait();
          return Err(e.into());
        }
        debug!("{} closed stdin early", invocation.tool());
      }
    }

    wait_with_timeout(child, invocation, &self.cancel)
  }
}

fn wait_with_timeout(
  mut child: std::process::Child,
  invocation: &Invocation,
  cancel: &CancelFlag,
) -> Result<ToolOutput> {
  let stdout_pipe = child.stdout.take();
  let stderr_pipe = child.stderr.take();

  let stdout_handle = std::thread::spawn(move || {
    let mut buf = Vec::new();
    if let Some(mut pipe) = stdout_pipe {
      let _ = pipe.read_to_end(&mut buf);
    }
    buf
  });

  let stderr_handle = std::thread::spawn(move || {
    let mut buf = Vec::new();
    if let Some(mut pipe) = stderr_pipe {
      let _ = pipe.read_to_end(&mut buf);
    }
    buf
  });

  let start = Instant::now();
  let poll_interval = Duration::from_millis(20);

  loop {
    match child.try_wait()? {
      Some(status) => {
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        return Ok(ToolOutput {
          code: status.code(),
          stdout: String::from_utf8_lossy(&stdout).to_string(),
          stderr: String::from_utf8_lossy(&stderr).to_string(),
        });
      }
      None if cancel.is_cancelled() => {
        warn!("cancelled, killing {}", invocation.tool());
        let _ = child.kill();
        let _ = child.wait();
        return Err(DeflakeError::Cancelled);
      }
      None if invocation.timeout.is_some_and(|t| start.elapsed() >= t) => {
        let secs = invocation.timeout.map(|t| t.as_secs()).unwrap_or_default();
        warn!("{} timed out after {secs}s, killing", invocation.tool());
        let _ = child.kill();
        let _ = child.wait();
        return Err(DeflakeError::Timeout(format!(
          "`{}` timed out after {secs}s",
          invocation.display()
        )));
      }
      None => std::thread::sleep(poll_interval),
    }
  }
}
