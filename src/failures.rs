//! Per-test-case accumulation of assertion-level mismatches.

use crate::error::{HarnessError, Result};

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

/// Ordered, append-only list of independent mismatches for one test case.
///
/// The first entry is the most causally relevant one. The list is presented
/// exactly once; presenting it again is an error of its own. Dropping a list
/// that still holds unpresented failures panics.
#[derive(Debug, Default)]
pub struct FailureList {
    entries: Vec<String>,
    presented: bool,
}

impl FailureList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: impl Into<String>) {
        let failure = failure.into();
        debug!("recorded test failure: {}", failure);
        self.entries.push(failure);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn was_presented(&self) -> bool {
        self.presented
    }

    /// Discards everything and re-arms presentation for a new test case.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.presented = false;
    }

    /// Presents the accumulated failures.
    ///
    /// Returns `Ok(())` when nothing was recorded,
    /// [`HarnessError::Assertions`] with every entry otherwise, and
    /// [`HarnessError::FailuresAlreadyPresented`] on any later call.
    pub fn present(&mut self) -> Result<()> {
        if self.presented {
            error!("test failures presented twice");
            return Err(HarnessError::FailuresAlreadyPresented);
        }
        self.presented = true;
        if self.entries.is_empty() {
            return Ok(());
        }
        Err(HarnessError::Assertions(FailureReport {
            failures: std::mem::take(&mut self.entries),
            presented_at: Utc::now(),
        }))
    }
}

impl Drop for FailureList {
    fn drop(&mut self) {
        if self.presented || self.entries.is_empty() {
            return;
        }
        let summary = format!(
            "{} test failure(s) were never presented: {:?}",
            self.entries.len(),
            self.entries
        );
        error!("{}", summary);
        // A second panic while unwinding would abort the test binary
        if std::thread::panicking() {
            eprintln!("{}", summary);
        } else {
            panic!("{}", summary);
        }
    }
}

/// The presented failures of one test case
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub failures: Vec<String>,
    pub presented_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.failures.iter().any(|f| f.contains(needle))
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} test failure(s)", self.failures.len())?;
        for (index, failure) in self.failures.iter().enumerate() {
            write!(f, "\n  {}. {}", index + 1, failure)?;
        }
        Ok(())
    }
}
