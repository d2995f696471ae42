use anyhow::{Context, Result};
use sigwright::{HarnessConfig, ProcessConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Time a shell subject gets to install its traps before the first step
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// Writes small shell programs that behave like the subjects under test.
///
/// File names stay under 15 bytes so they match `comm` in `/proc`.
pub struct SubjectFixtures {
    temp_dir: TempDir,
}

impl SubjectFixtures {
    pub fn new() -> Result<Self> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        Ok(Self { temp_dir })
    }

    pub fn temp_path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Writes an executable `/bin/sh` script and returns its path.
    pub fn script(&self, name: &str, body: &str) -> Result<PathBuf> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    fn config(&self, path: PathBuf) -> ProcessConfig {
        ProcessConfig::new(path.to_string_lossy()).startup_grace(STARTUP_GRACE)
    }

    /// Prints `Ignoring signal: N` for each of `signals` and keeps running.
    pub fn ignoring(&self, name: &str, signals: &[i32]) -> Result<ProcessConfig> {
        let traps: String = signals
            .iter()
            .map(|n| format!("trap 'printf \"Ignoring signal: {n}\\n\"' {n}\n"))
            .collect();
        let path = self.script(name, &format!("{traps}while :; do sleep 0.05; done"))?;
        Ok(self.config(path))
    }

    /// Exits with `code` when it receives `signal`.
    pub fn exiting_on(&self, name: &str, signal: i32, code: i32) -> Result<ProcessConfig> {
        let path = self.script(
            name,
            &format!("trap 'exit {code}' {signal}\nwhile :; do sleep 0.05; done"),
        )?;
        Ok(self.config(path))
    }

    /// Runs until killed, with no handlers installed.
    pub fn idle(&self, name: &str) -> Result<ProcessConfig> {
        let path = self.script(name, "while :; do sleep 0.05; done")?;
        Ok(self.config(path))
    }

    /// Writes `stdout` and `stderr` once, then idles.
    pub fn chatty(&self, name: &str, stdout: &str, stderr: &str) -> Result<ProcessConfig> {
        let path = self.script(
            name,
            &format!("printf '%s\\n' '{stdout}'\nprintf '%s\\n' '{stderr}' >&2\nwhile :; do sleep 0.05; done"),
        )?;
        Ok(self.config(path))
    }

    /// Exits on its own with `code` right away.
    pub fn short_lived(&self, name: &str, code: i32) -> Result<ProcessConfig> {
        let path = self.script(name, &format!("exit {code}"))?;
        Ok(self.config(path))
    }

    /// Starts a background helper (named `helper_name`) in its process group, then idles.
    pub fn forking(&self, name: &str, helper_name: &str) -> Result<ProcessConfig> {
        let helper = self.script(helper_name, "while :; do sleep 0.05; done")?;
        let path = self.script(
            name,
            &format!("{} &\nwhile :; do sleep 0.05; done", helper.display()),
        )?;
        Ok(self.config(path))
    }

    /// Re-runs itself in a new session (as a daemon would), then idles.
    ///
    /// The copy escapes the process group, so only a name lookup finds it.
    pub fn daemonizing(&self, name: &str) -> Result<ProcessConfig> {
        let path = self.script(
            name,
            "if [ \"$1\" = detached ]; then\n  while :; do sleep 0.05; done\nfi\nsetsid \"$0\" detached &\nwhile :; do sleep 0.05; done",
        )?;
        Ok(self.config(path))
    }
}

/// Harness timings short enough for a test suite.
pub fn fast_config() -> HarnessConfig {
    HarnessConfig::default()
        .with_wait_quantum(Duration::from_millis(400))
        .with_non_waitable_retries(2)
        .with_finalize_budget(Duration::from_secs(3))
        .with_settle_delay(Duration::ZERO)
        .with_drain_timeout(Duration::from_secs(2))
}
