use crate::error::{HarnessError, Result};
use crate::signals::SignalNumber;

use std::fmt;
use std::str::FromStr;

/// A control action the delivery loop can apply to a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Deliver a signal to a user-mode process
    Signal(SignalNumber),
    /// Insert a kernel module
    Load,
    /// Remove a kernel module
    Unload,
}

impl Action {
    pub fn is_non_waitable(&self) -> bool {
        match self {
            Action::Signal(signal) => signal.is_non_waitable(),
            Action::Load | Action::Unload => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Signal(signal) => write!(f, "signal {}", signal.raw()),
            Action::Load => f.write_str("load"),
            Action::Unload => f.write_str("unload"),
        }
    }
}

/// One scripted action and whether it must cause a transition.
///
/// For a process the transition is termination; for a module it is the
/// loaded/unloaded flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub action: Action,
    pub expect_transition: bool,
}

impl Step {
    pub fn new(action: Action, expect_transition: bool) -> Self {
        Self {
            action,
            expect_transition,
        }
    }

    /// A signal the subject must survive.
    pub fn survives(signal: SignalNumber) -> Self {
        Self::new(Action::Signal(signal), false)
    }

    /// A signal the subject must exit on.
    pub fn exits(signal: SignalNumber) -> Self {
        Self::new(Action::Signal(signal), true)
    }

    pub fn load() -> Self {
        Self::new(Action::Load, true)
    }

    pub fn unload() -> Self {
        Self::new(Action::Unload, true)
    }
}

impl FromStr for Step {
    type Err = HarnessError;

    /// Parses `<signal>:<exit|stay>` or `<load|unload>[:<change|stay>]`,
    /// e.g. `3:stay`, `SIGKILL:exit`, `load`.
    fn from_str(s: &str) -> Result<Self> {
        let (head, tail) = match s.split_once(':') {
            Some((head, tail)) => (head.trim(), Some(tail.trim())),
            None => (s.trim(), None),
        };
        let action = match head.to_ascii_lowercase().as_str() {
            "load" => Action::Load,
            "unload" => Action::Unload,
            _ => Action::Signal(head.parse()?),
        };
        let expect_transition = match tail.map(str::to_ascii_lowercase).as_deref() {
            Some("exit") | Some("change") | Some("yes") => true,
            Some("stay") | Some("none") | Some("no") => false,
            None => !matches!(action, Action::Signal(_)),
            Some(_) => return Err(HarnessError::command("step", format!("unrecognized step `{s}`"))),
        };
        Ok(Self::new(action, expect_transition))
    }
}

/// A validated, non-empty, immutable sequence of steps.
///
/// The lethal finalizer is not part of a script; the delivery loop owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(HarnessError::EmptyScript);
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }
}

impl<'a> IntoIterator for &'a Script {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
