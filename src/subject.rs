//! The capability interface shared by user-mode processes and kernel modules.

use crate::error::Result;
use crate::failures::FailureList;
use crate::outcome::ExecutionOutcome;
use crate::script::Action;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Observable lifecycle state of a subject
pub trait SubjectState: Copy + PartialEq + fmt::Debug + fmt::Display + Send + Sync {
    /// True once the subject can accept no further steps.
    fn is_terminal(&self) -> bool;

    /// True when this state is what `action` settles into without a
    /// waitable transition (a paused process after SIGSTOP, for instance).
    fn reflects(&self, action: Action) -> bool;
}

/// Result of one bounded wait for a state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<S> {
    /// The subject reached a new state
    Changed(S),
    /// The wait budget elapsed with no observable transition
    Unchanged,
    /// Waiting itself failed
    Error(String),
}

impl<S> WaitOutcome<S> {
    pub fn is_changed(&self) -> bool {
        matches!(self, WaitOutcome::Changed(_))
    }
}

/// Something the delivery loop can drive.
///
/// A test case owns exactly one subject; the variant is chosen when the
/// subject is constructed.
#[async_trait]
pub trait Subject: Send {
    type State: SubjectState;

    /// Name used in failure messages and in the leak detector.
    fn name(&self) -> &str;

    /// Brings the subject up (spawn, or verify privilege for modules).
    async fn start(&mut self) -> Result<()>;

    /// Current state, without blocking.
    async fn poll(&mut self) -> Result<Self::State>;

    /// Applies one control action.
    async fn deliver(&mut self, action: Action) -> Result<()>;

    /// Waits up to `quantum` for a waitable transition away from `before`.
    async fn wait_with_timeout(
        &mut self,
        before: Self::State,
        quantum: Duration,
    ) -> WaitOutcome<Self::State>;

    /// Drives the subject to its terminal state if it has one, within `budget`.
    async fn finalize(&mut self, budget: Duration) -> Result<Self::State>;

    /// Collects buffered output. Called once, after finalization.
    async fn drain(&mut self, timeout: Duration) -> Result<ExecutionOutcome>;

    /// Releases anything still held and records leaks in `failures`.
    async fn teardown(&mut self, failures: &mut FailureList);
}
