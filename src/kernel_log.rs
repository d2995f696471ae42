use crate::error::{HarnessError, Result};
use crate::failures::FailureList;

use std::fmt;
use std::str::FromStr;

/// Kernel log levels, as accepted by `dmesg --level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// system is unusable
    Emerg,
    /// action must be taken immediately
    Alert,
    /// critical conditions
    Crit,
    /// error conditions
    Err,
    /// warning conditions
    Warn,
    /// normal but significant condition
    Notice,
    /// informational
    Info,
    /// debug-level messages
    Debug,
}

impl Severity {
    pub const ALL: [Severity; 8] = [
        Severity::Emerg,
        Severity::Alert,
        Severity::Crit,
        Severity::Err,
        Severity::Warn,
        Severity::Notice,
        Severity::Info,
        Severity::Debug,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Emerg => "emerg",
            Severity::Alert => "alert",
            Severity::Crit => "crit",
            Severity::Err => "err",
            Severity::Warn => "warn",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Severity::ALL
            .into_iter()
            .find(|level| level.as_str() == wanted)
            .ok_or_else(|| HarnessError::UnsupportedSeverity(s.to_string()))
    }
}

/// Entries that must appear in the kernel log, optionally at one level only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    required_entries: Vec<String>,
    severity: Option<Severity>,
}

impl LogQuery {
    /// Builds a query; an empty entry list is a configuration error.
    pub fn new<I, S>(entries: I, severity: Option<Severity>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required_entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        if required_entries.is_empty() {
            return Err(HarnessError::command(
                "log query",
                "at least one log entry is required",
            ));
        }
        Ok(Self {
            required_entries,
            severity,
        })
    }

    pub fn entries(&self) -> &[String] {
        &self.required_entries
    }

    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    /// Appends one failure per required entry missing from `snapshot`.
    pub fn check(&self, snapshot: &str, failures: &mut FailureList) {
        for entry in &self.required_entries {
            if !snapshot.contains(entry.as_str()) {
                let scope = match self.severity {
                    Some(level) => format!(" at level {level}"),
                    None => String::new(),
                };
                failures.push(format!(
                    "Unable to locate {entry} in the kernel log{scope}: {}",
                    snapshot.trim_end()
                ));
            }
        }
    }
}
