//! Run reports.
//!
//! A [`RunReport`] records how one bundle run ended, with the output tails,
//! for consumers that do not watch the live output.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::CommandOutput;

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// The entry point exited with status 0.
    Success,
    /// The bundle or the entry point failed.
    Error,
}

/// Outcome of one bundle run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Bundle ID.
    pub id: String,
    /// Final state.
    pub state: RunState,
    /// Standard output tail, lossily decoded.
    pub stdout: String,
    /// Standard error tail, lossily decoded.
    pub stderr: String,
    /// Error message when the run failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Report for a run that produced `output`, or failed with `error`.
    ///
    /// A run with output but an error (entry point exited non-zero) keeps the
    /// output tails.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        started_at: DateTime<Utc>,
        output: Option<&CommandOutput>,
        error: Option<String>,
    ) -> Self {
        let (stdout, stderr) = output
            .map(|o| {
                (
                    String::from_utf8_lossy(&o.stdout).into_owned(),
                    String::from_utf8_lossy(&o.stderr).into_owned(),
                )
            })
            .unwrap_or_default();

        Self {
            id: id.into(),
            state: if error.is_none() {
                RunState::Success
            } else {
                RunState::Error
            },
            stdout,
            stderr,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Writes the report to `path` as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be written.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json + "\n")
    }
}
