use crate::error::{HarnessError, Result};

use std::fmt;
use std::str::FromStr;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// A raw signal number in `1..=SIGRTMAX`.
///
/// `nix::sys::signal::Signal` has no variants for the realtime range, so
/// scripts carry the number itself and only borrow nix for naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalNumber(i32);

impl SignalNumber {
    pub const HUP: Self = Self(libc::SIGHUP);
    pub const INT: Self = Self(libc::SIGINT);
    pub const QUIT: Self = Self(libc::SIGQUIT);
    pub const KILL: Self = Self(libc::SIGKILL);
    pub const TERM: Self = Self(libc::SIGTERM);
    pub const STOP: Self = Self(libc::SIGSTOP);
    pub const CONT: Self = Self(libc::SIGCONT);

    pub fn new(raw: i32) -> Result<Self> {
        if (1..=max_signal()).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(HarnessError::InvalidSignal(raw))
        }
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    /// Signals whose effect is not reported through the same blocking wait as
    /// termination: the process is paused or resumed, never reaped.
    pub fn is_non_waitable(self) -> bool {
        self.pauses() || self.resumes()
    }

    pub fn pauses(self) -> bool {
        matches!(
            self.0,
            libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
        )
    }

    pub fn resumes(self) -> bool {
        self.0 == libc::SIGCONT
    }

    pub fn name(self) -> String {
        if let Ok(signal) = Signal::try_from(self.0) {
            return signal.as_str().to_string();
        }
        realtime_name(self.0).unwrap_or_else(|| format!("signal {}", self.0))
    }
}

impl fmt::Display for SignalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

impl FromStr for SignalNumber {
    type Err = HarnessError;

    /// Accepts `9`, `KILL` or `SIGKILL`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(raw) = trimmed.parse::<i32>() {
            return Self::new(raw);
        }
        let upper = trimmed.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&name)
            .map(|signal| Self(signal as i32))
            .map_err(|_| HarnessError::UnknownSignal(trimmed.to_string()))
    }
}

impl From<Signal> for SignalNumber {
    fn from(signal: Signal) -> Self {
        Self(signal as i32)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn max_signal() -> i32 {
    libc::SIGRTMAX()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn max_signal() -> i32 {
    31
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn realtime_name(raw: i32) -> Option<String> {
    let (min, max) = (libc::SIGRTMIN(), libc::SIGRTMAX());
    if raw == max {
        Some("SIGRTMAX".to_string())
    } else if raw == min {
        Some("SIGRTMIN".to_string())
    } else if raw > min && raw < max {
        Some(format!("SIGRTMIN+{}", raw - min))
    } else {
        None
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn realtime_name(_raw: i32) -> Option<String> {
    None
}

/// Sends a raw signal number to a single process.
pub fn send(pid: Pid, signal: SignalNumber) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid.as_raw(), signal.raw()) };
    if rc == -1 {
        return Err(nix::Error::last().into());
    }
    Ok(())
}

/// Sends a raw signal number to every member of a process group.
pub fn send_to_group(pgid: Pid, signal: SignalNumber) -> Result<()> {
    send(Pid::from_raw(-pgid.as_raw()), signal)
}
