use crate::failures::FailureList;
use crate::outcome::{ExecutionOutcome, Termination};

/// What a test declares about one output stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamExpectation {
    /// The stream is not checked
    #[default]
    Ignore,
    /// The stream must be empty
    Empty,
    /// Each substring must appear somewhere in the stream
    Contains(Vec<String>),
}

impl StreamExpectation {
    pub fn contains<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Contains(entries.into_iter().map(Into::into).collect())
    }

    fn check(&self, stream_name: &str, captured: &str, failures: &mut FailureList) {
        match self {
            StreamExpectation::Ignore => {}
            StreamExpectation::Empty => {
                if !captured.is_empty() {
                    failures.push(format!("{stream_name} was not empty: {captured}"));
                }
            }
            StreamExpectation::Contains(entries) => {
                for entry in entries {
                    if !captured.contains(entry.as_str()) {
                        failures.push(format!("Unable to locate {entry} in {stream_name}"));
                    }
                }
            }
        }
    }
}

/// Declared expectations for a process outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expectations {
    pub stdout: StreamExpectation,
    pub stderr: StreamExpectation,
    /// `None` skips the comparison entirely
    pub termination: Option<Termination>,
}

impl Expectations {
    pub fn ignore() -> Self {
        Self::default()
    }

    /// Appends one failure per mismatch; never stops at the first.
    pub fn validate(&self, outcome: &ExecutionOutcome, failures: &mut FailureList) {
        self.stdout.check("Stdout", &outcome.stdout_lossy(), failures);
        self.stderr.check("Stderr", &outcome.stderr_lossy(), failures);

        if let Some(expected) = self.termination {
            if outcome.termination != Some(expected) {
                let actual = outcome
                    .termination
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "none".to_string());
                failures.push(format!(
                    "Expected exit ({expected}) does not match actual exit ({actual})"
                ));
            }
        }
    }
}
