//! Drives a [`Script`] against a [`Subject`] one step at a time.

use crate::config::HarnessConfig;
use crate::error::Result;
use crate::failures::FailureList;
use crate::outcome::ExecutionOutcome;
use crate::script::{Action, Script, Step};
use crate::subject::{Subject, SubjectState, WaitOutcome};

use std::fmt;
use tracing::{debug, info, warn};

/// Why the loop stopped delivering steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every step ran and matched its expectation
    Completed,
    /// The subject was already terminal before step `index`
    AlreadyTerminal { index: usize },
    /// Step `index` expected a transition that never came
    MissingTransition { index: usize },
    /// Step `index` caused a transition it should not have
    UnexpectedTransition { index: usize },
    /// Waiting after step `index` failed
    WaitFailed { index: usize },
}

impl StopReason {
    pub fn is_completed(&self) -> bool {
        matches!(self, StopReason::Completed)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => f.write_str("completed"),
            StopReason::AlreadyTerminal { index } => write!(f, "subject already terminal before step {}", index + 1),
            StopReason::MissingTransition { index } => write!(f, "step {} did not cause its transition", index + 1),
            StopReason::UnexpectedTransition { index } => write!(f, "step {} caused an unexpected transition", index + 1),
            StopReason::WaitFailed { index } => write!(f, "waiting after step {} failed", index + 1),
        }
    }
}

/// What happened during one run of the loop
#[derive(Debug)]
pub struct DeliveryReport<S> {
    /// Steps whose action was actually delivered
    pub steps_delivered: usize,
    pub stop: StopReason,
    /// State after the finalizer
    pub final_state: S,
    pub outcome: ExecutionOutcome,
}

/// The sequential step driver.
///
/// Classification failures go to the [`FailureList`]; only infrastructure
/// errors are returned. The finalizer and the drain run on every path,
/// including the fail-fast break.
pub struct DeliveryLoop<'a> {
    config: &'a HarnessConfig,
}

impl<'a> DeliveryLoop<'a> {
    pub fn new(config: &'a HarnessConfig) -> Self {
        Self { config }
    }

    pub async fn run<S: Subject>(
        &self,
        subject: &mut S,
        script: &Script,
        failures: &mut FailureList,
    ) -> Result<DeliveryReport<S::State>> {
        let mut delivered = 0;
        let scripted = self.deliver_all(subject, script, failures, &mut delivered).await;
        let final_state = self.finalize(subject, failures).await;

        let stop = scripted?;
        let final_state = final_state?;
        let outcome = subject.drain(self.config.drain_timeout).await?;
        info!(
            "{}: delivered {}/{} step(s), {}, final state {}",
            subject.name(),
            delivered,
            script.len(),
            stop,
            final_state
        );

        Ok(DeliveryReport {
            steps_delivered: delivered,
            stop,
            final_state,
            outcome,
        })
    }

    async fn deliver_all<S: Subject>(
        &self,
        subject: &mut S,
        script: &Script,
        failures: &mut FailureList,
        delivered: &mut usize,
    ) -> Result<StopReason> {
        for (index, step) in script.iter().enumerate() {
            let before = subject.poll().await?;
            if before.is_terminal() {
                warn!("{} is {} with {} step(s) left", subject.name(), before, script.len() - index);
                failures.push(format!(
                    "{} is not running ({}) before {}",
                    subject.name(),
                    before,
                    step.action
                ));
                return Ok(StopReason::AlreadyTerminal { index });
            }

            info!("step {}: {} to {} ({})", index + 1, step.action, subject.name(), before);
            subject.deliver(step.action).await?;
            *delivered += 1;

            let observed = self.wait(subject, step.action, before).await;
            if let Some(stop) = classify(subject.name(), index, step, observed, failures) {
                return Ok(stop);
            }
        }
        Ok(StopReason::Completed)
    }

    /// Waits one quantum, or up to `1 + non_waitable_retries` quanta for
    /// pause/resume-class signals that never produce a waitable event.
    async fn wait<S: Subject>(
        &self,
        subject: &mut S,
        action: Action,
        before: S::State,
    ) -> WaitOutcome<S::State> {
        let attempts = if action.is_non_waitable() {
            1 + self.config.non_waitable_retries
        } else {
            1
        };

        for attempt in 1..=attempts {
            match subject.wait_with_timeout(before, self.config.wait_quantum).await {
                WaitOutcome::Unchanged if attempt < attempts => {
                    match subject.poll().await {
                        Ok(state) if state.reflects(action) => {
                            debug!("{} settled into {} after {}", subject.name(), state, action);
                            return WaitOutcome::Unchanged;
                        }
                        Ok(state) => debug!("attempt {}: {} still {}", attempt, subject.name(), state),
                        Err(e) => return WaitOutcome::Error(e.to_string()),
                    }
                }
                other => return other,
            }
        }
        WaitOutcome::Unchanged
    }

    async fn finalize<S: Subject>(&self, subject: &mut S, failures: &mut FailureList) -> Result<S::State> {
        match subject.finalize(self.config.finalize_budget).await {
            Ok(state) => {
                debug!("{} finalized: {}", subject.name(), state);
                Ok(state)
            }
            Err(e) => {
                warn!("finalizing {} failed: {}", subject.name(), e);
                failures.push(format!("Unable to finalize {}: {}", subject.name(), e));
                subject.poll().await
            }
        }
    }
}

/// Compares what a step expected with what was observed; returns the stop
/// reason when the script must not continue.
fn classify<St: SubjectState>(
    name: &str,
    index: usize,
    step: &Step,
    observed: WaitOutcome<St>,
    failures: &mut FailureList,
) -> Option<StopReason> {
    match (step.expect_transition, observed) {
        (_, WaitOutcome::Error(reason)) => {
            failures.push(format!("Waiting on {name} after {} failed: {reason}", step.action));
            Some(StopReason::WaitFailed { index })
        }
        (true, WaitOutcome::Unchanged) => {
            failures.push(missing_transition(name, step.action));
            Some(StopReason::MissingTransition { index })
        }
        (false, WaitOutcome::Changed(state)) => {
            debug!("{} moved to {} after {}", name, state, step.action);
            failures.push(unexpected_transition(name, step.action));
            Some(StopReason::UnexpectedTransition { index })
        }
        _ => None,
    }
}

fn missing_transition(name: &str, action: Action) -> String {
    match action {
        Action::Signal(signal) => format!("{name} did not exit on signal {}", signal.raw()),
        Action::Load => format!("{name} did not load"),
        Action::Unload => format!("{name} is still loaded after unload"),
    }
}

fn unexpected_transition(name: &str, action: Action) -> String {
    match action {
        Action::Signal(signal) => format!("{name} prematurely exited on signal {}", signal.raw()),
        Action::Load => format!("{name} loaded although it was expected not to"),
        Action::Unload => format!("{name} unloaded although it was expected to stay loaded"),
    }
}
