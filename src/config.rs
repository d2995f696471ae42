use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Timing knobs for the delivery loop and the lifecycle safety net
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Upper bound on a single wait for a state change
    pub wait_quantum: Duration,
    /// How many extra quanta a pause/resume-style signal may take to settle
    pub non_waitable_retries: u32,
    /// Budget for the lethal finalizer to drive the subject to its terminal state
    pub finalize_budget: Duration,
    /// Time given to a kernel module after insmod/rmmod before the registry is consulted
    pub settle_delay: Duration,
    /// Upper bound on draining buffered stdout/stderr after finalization
    pub drain_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            wait_quantum: Duration::from_secs(1),
            non_waitable_retries: 3,
            finalize_budget: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl HarnessConfig {
    pub fn with_wait_quantum(mut self, quantum: Duration) -> Self {
        self.wait_quantum = quantum;
        self
    }

    pub fn with_non_waitable_retries(mut self, retries: u32) -> Self {
        self.non_waitable_retries = retries;
        self
    }

    pub fn with_finalize_budget(mut self, budget: Duration) -> Self {
        self.finalize_budget = budget;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// How a user-mode subject is spawned
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments for the command
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_directory: Option<PathBuf>,
    /// Environment variables to set on top of the inherited environment
    pub environment: HashMap<String, String>,
    /// Time the subject gets to install its signal handlers before the first step
    pub startup_grace: Duration,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// The file name of the command, used to identify the subject in reports
    /// and in the process table.
    pub fn display_name(&self) -> String {
        std::path::Path::new(&self.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.command.clone())
    }
}
