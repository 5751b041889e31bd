use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{DeflakeError, Result};

/// Exclusive per-checkout lock, released on drop.
pub struct RunLock {
  file: File,
  path: PathBuf,
}

impl RunLock {
  pub fn acquire(state_dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(state_dir)?;
    let path = state_dir.join("lock");
    let file = OpenOptions::new()
      .create(true)
      .truncate(false)
      .write(true)
      .open(&path)?;

    file
      .try_lock_exclusive()
      .map_err(|_| DeflakeError::Locked(path.clone()))?;

    debug!("acquired {}", path.display());
    Ok(Self { file, path })
  }
}

impl Drop for RunLock {
  fn drop(&mut self) {
    let _ = self.file.unlock();
    debug!("released {}", self.path.display());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_second_lock_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let first = RunLock::acquire(dir.path()).unwrap();
    assert!(matches!(
      RunLock::acquire(dir.path()),
      Err(DeflakeError::Locked(_))
    ));
    drop(first);
    assert!(RunLock::acquire(dir.path()).is_ok());
  }
}
