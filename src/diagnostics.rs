//! External diagnostic commands (uptime, interface dumps, ...) whose text
//! output is folded into bootup and long checkup snapshots.

use crate::config::MAX_LONG_CHECKS_PER_CALL;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// Value reported in place of a failed diagnostic.
pub const DIAGNOSTIC_SENTINEL: &str = "--";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticCheck {
    pub name: String,
    pub command: String,
}

#[derive(Debug, Error)]
pub enum DiagnosticError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with {status}")]
    Failed { command: String, status: std::process::ExitStatus },
    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// Indices of the checks to run this time, and the cursor for next time.
pub type Rotation = (BoundedVec<usize, MAX_LONG_CHECKS_PER_CALL>, usize);

#[derive(Debug, Clone)]
pub struct Diagnostics {
    checks: Vec<DiagnosticCheck>,
    timeout: Duration,
}

impl Diagnostics {
    pub fn new(checks: Vec<DiagnosticCheck>, timeout: Duration) -> Self {
        Self { checks, timeout }
    }

    pub fn checks(&self) -> &[DiagnosticCheck] {
        &self.checks
    }

    /// Pick up to `count` checks round-robin starting at `cursor`.
    pub fn rotation(&self, cursor: usize, count: usize) -> Rotation {
        let mut picked = BoundedVec::new();
        if self.checks.is_empty() {
            return (picked, 0);
        }
        let count = count.min(self.checks.len()).min(MAX_LONG_CHECKS_PER_CALL);
        let start = cursor % self.checks.len();
        for offset in 0..count {
            // count is capped at capacity above
            let _ = picked.push((start + offset) % self.checks.len());
        }
        (picked, (start + count) % self.checks.len())
    }

    /// Run one check through `sh -c`, capturing stdout.
    pub async fn run(&self, check: &DiagnosticCheck) -> Result<String, DiagnosticError> {
        debug!("Running diagnostic '{}': {}", check.name, check.command);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&check.command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| DiagnosticError::Timeout {
                command: check.command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| DiagnosticError::Spawn {
                command: check.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DiagnosticError::Failed {
                command: check.command.clone(),
                status: output.status,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run the given checks in order, substituting the sentinel on failure.
    pub async fn collect(&self, indices: &[usize]) -> Vec<(String, String)> {
        let mut results = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(check) = self.checks.get(index) else {
                continue;
            };
            let value = match self.run(check).await {
                Ok(output) => output,
                Err(e) => {
                    error!("Diagnostic '{}' failed: {}", check.name, e);
                    DIAGNOSTIC_SENTINEL.to_string()
                }
            };
            results.push((check.name.clone(), value));
        }
        results
    }

    pub async fn collect_all(&self) -> Vec<(String, String)> {
        let all: Vec<usize> = (0..self.checks.len()).collect();
        self.collect(&all).await
    }
}
