use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// How a subject ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl Termination {
    pub fn from_status(status: ExitStatus) -> Option<Self> {
        if let Some(code) = status.code() {
            Some(Termination::Exited(code))
        } else {
            status.signal().map(Termination::Signaled)
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {code}"),
            Termination::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Everything captured from a subject, exactly once, after its script ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub termination: Option<Termination>,
}

impl ExecutionOutcome {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Exit code of a normal exit, `None` if the subject was signaled or never ended.
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Some(Termination::Exited(code)) => Some(code),
            _ => None,
        }
    }

    pub fn termination_signal(&self) -> Option<i32> {
        match self.termination {
            Some(Termination::Signaled(signal)) => Some(signal),
            _ => None,
        }
    }
}
