//! Scoped working directory with bounded retry on removal

use crate::types::{RoiError, RoiResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bounded retry: at most `max_attempts` tries with a fixed pause in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::cleanup()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Directory removal: 5 attempts, 1 s apart
    pub fn cleanup() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// File downloads: 3 attempts, 2 s apart
    pub fn download() -> Self {
        Self::new(3, Duration::from_secs(2))
    }

    /// Run `op` until it succeeds or attempts run out.
    ///
    /// Returns the number of attempts made together with the last result.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> (usize, Result<T, E>)
    where
        E: Display,
        F: FnMut(usize) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            log::debug!("{}: attempt {} of {}", what, attempt, max_attempts);
            match op(attempt) {
                Ok(value) => return (attempt, Ok(value)),
                Err(e) if attempt < max_attempts => {
                    log::warn!("{} attempt {} failed ({}), retrying...", what, attempt, e);
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
                Err(e) => return (attempt, Err(e)),
            }
        }
    }
}

/// Result of removing a working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed { attempts: usize },
    Failed { attempts: usize, error: String },
}

impl CleanupOutcome {
    pub fn is_removed(&self) -> bool {
        matches!(self, CleanupOutcome::Removed { .. })
    }

    /// Escalate a failed cleanup for callers that want it to be fatal
    pub fn into_result(self) -> RoiResult<()> {
        match self {
            CleanupOutcome::Removed { .. } => Ok(()),
            CleanupOutcome::Failed { attempts, error } => Err(RoiError::Cleanup {
                attempts,
                message: error,
            }),
        }
    }
}

/// Uniquely named directory owned by one export operation.
///
/// The name combines a UTC timestamp with a random suffix so that two
/// operations started within the same second never share a directory.
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
    removed: bool,
}

impl WorkingDir {
    /// Create under the system temporary directory
    pub fn create(label: &str) -> RoiResult<Self> {
        Self::create_in(std::env::temp_dir(), label)
    }

    pub fn create_in<P: AsRef<Path>>(parent: P, label: &str) -> RoiResult<Self> {
        std::fs::create_dir_all(parent.as_ref())?;
        let prefix = format!("{}_{}_", label, Utc::now().format("%Y%m%dT%H%M%S"));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(parent.as_ref())?;

        // Removal is handled here, with retries, rather than by TempDir's drop
        let path = dir.into_path();
        log::debug!("Created working directory {}", path.display());

        Ok(Self { path, removed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the directory
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory tree, retrying on failure
    pub fn cleanup(self, policy: &RetryPolicy) -> CleanupOutcome {
        self.cleanup_with(policy, |path| std::fs::remove_dir_all(path))
    }

    /// Remove with a caller-supplied remover; failures end as a warning
    pub fn cleanup_with<F>(mut self, policy: &RetryPolicy, mut remover: F) -> CleanupOutcome
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        let path = self.path.clone();
        let (attempts, result) = policy.run("Working directory cleanup", |_| {
            if path.exists() {
                remover(&path)
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                self.removed = true;
                log::debug!("Removed working directory {} after {} attempt(s)", path.display(), attempts);
                CleanupOutcome::Removed { attempts }
            }
            Err(e) => {
                log::warn!(
                    "Could not remove working directory {} after {} attempts: {}",
                    path.display(),
                    attempts,
                    e
                );
                CleanupOutcome::Failed {
                    attempts,
                    error: e.to_string(),
                }
            }
        }
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if !self.removed && self.path.exists() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
