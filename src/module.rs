use crate::error::{HarnessError, Result};
use crate::failures::FailureList;
use crate::kernel_log::{LogQuery, Severity};
use crate::outcome::ExecutionOutcome;
use crate::script::Action;
use crate::subject::{Subject, SubjectState, WaitOutcome};

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// How often the registry is re-read while waiting for a load/unload to show up
const REGISTRY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State of a kernel-module subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unloaded,
    Loaded,
}

impl SubjectState for ModuleState {
    fn is_terminal(&self) -> bool {
        false
    }

    fn reflects(&self, action: Action) -> bool {
        match action {
            Action::Load => *self == ModuleState::Loaded,
            Action::Unload => *self == ModuleState::Unloaded,
            Action::Signal(_) => false,
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Unloaded => f.write_str("unloaded"),
            ModuleState::Loaded => f.write_str("loaded"),
        }
    }
}

/// Captured result of one privileged command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl CommandOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_string()
    }
}

/// Privileged operations on the kernel module registry and the kernel log.
///
/// An `Err` means the operation could not be attempted at all; a command
/// that ran and failed is reported through [`CommandOutput::success`].
#[async_trait]
pub trait ModuleControl: Send + Sync {
    async fn check_privilege(&self) -> Result<()>;

    async fn load(&self, artifact: &Path) -> Result<CommandOutput>;

    async fn unload(&self, name: &str) -> Result<CommandOutput>;

    /// Raw registry listing, `lsmod` format.
    async fn list_loaded(&self) -> Result<String>;

    async fn clear_log(&self) -> Result<()>;

    async fn read_log(&self, severity: Option<Severity>) -> Result<String>;

    /// Last-ditch unload from a destructor, where nothing can be awaited.
    fn unload_blocking(&self, name: &str);
}

/// `insmod`/`rmmod`/`lsmod`/`dmesg`, prefixed with `sudo -n` unless already root
#[derive(Debug, Clone)]
pub struct SudoModuleControl {
    use_sudo: bool,
}

impl SudoModuleControl {
    pub fn new() -> Self {
        Self {
            use_sudo: !nix::unistd::geteuid().is_root(),
        }
    }

    fn command(&self, program: &str, privileged: bool) -> Command {
        if privileged && self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(program);
            command
        } else {
            Command::new(program)
        }
    }

    async fn run(&self, program: &str, args: &[&str], privileged: bool) -> Result<CommandOutput> {
        let mut command = self.command(program, privileged);
        command.args(args);
        debug!("running {} {:?}", program, args);
        let output = command
            .output()
            .await
            .map_err(|e| HarnessError::command(format!("{program} {}", args.join(" ")), e))?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
        })
    }

    async fn run_checked(&self, program: &str, args: &[&str], privileged: bool) -> Result<String> {
        let output = self.run(program, args, privileged).await?;
        if !output.success || !output.stderr.is_empty() {
            return Err(HarnessError::command(
                format!("{program} {}", args.join(" ")),
                output.stderr_lossy(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for SudoModuleControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleControl for SudoModuleControl {
    async fn check_privilege(&self) -> Result<()> {
        if !self.use_sudo {
            return Ok(());
        }
        let sudo_check = self.run("true", &[], true).await.map_err(|e| {
            HarnessError::PrivilegeUnavailable(format!("unable to run sudo: {e}"))
        })?;
        if sudo_check.success {
            Ok(())
        } else {
            Err(HarnessError::PrivilegeUnavailable(format!(
                "run the tests with elevated privileges ({})",
                sudo_check.stderr_lossy()
            )))
        }
    }

    async fn load(&self, artifact: &Path) -> Result<CommandOutput> {
        let path = artifact.to_string_lossy();
        self.run("insmod", &[path.as_ref()], true).await
    }

    async fn unload(&self, name: &str) -> Result<CommandOutput> {
        self.run("rmmod", &[name], true).await
    }

    async fn list_loaded(&self) -> Result<String> {
        match self.run_checked("lsmod", &[], false).await {
            Ok(listing) => Ok(listing),
            Err(e) => {
                debug!("lsmod unavailable ({}), reading /proc/modules", e);
                Ok(tokio::fs::read_to_string("/proc/modules").await?)
            }
        }
    }

    async fn clear_log(&self) -> Result<()> {
        self.run_checked("dmesg", &["--clear"], true).await.map(|_| ())
    }

    async fn read_log(&self, severity: Option<Severity>) -> Result<String> {
        let level = severity.map(|s| format!("--level={s}"));
        let mut args = vec!["-k"];
        if let Some(ref level) = level {
            args.push(level);
        }
        self.run_checked("dmesg", &args, true).await
    }

    fn unload_blocking(&self, name: &str) {
        let mut command = if self.use_sudo {
            let mut command = std::process::Command::new("sudo");
            command.args(["-n", "rmmod"]);
            command
        } else {
            std::process::Command::new("rmmod")
        };
        match command.arg(name).status() {
            Ok(status) if status.success() => eprintln!("Unloaded {} during emergency cleanup", name),
            Ok(status) => eprintln!("rmmod {} failed during emergency cleanup: {}", name, status),
            Err(e) => eprintln!("Failed to run rmmod {} during emergency cleanup: {}", name, e),
        }
    }
}

/// Whether `name` appears in an `lsmod` or `/proc/modules` listing.
pub fn module_registered(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|module| module == name)
}

/// Kernel registry name for an artifact: file stem with `-` folded to `_`.
pub fn module_name_for(artifact: &Path) -> String {
    artifact
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace('-', "_"))
        .unwrap_or_default()
}

/// A loadable kernel module under test.
///
/// Tracks the `Unloaded -> Loaded -> Unloaded` lifecycle itself so that
/// double loads and stray unloads are refused before any privileged command
/// runs.
pub struct ModuleSubject<C: ModuleControl> {
    control: C,
    artifact: PathBuf,
    name: String,
    state: ModuleState,
    privilege_checked: bool,
    settle_delay: Duration,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    drained: bool,
}

impl ModuleSubject<SudoModuleControl> {
    pub fn with_sudo(artifact: impl Into<PathBuf>) -> Self {
        Self::new(SudoModuleControl::new(), artifact)
    }
}

impl<C: ModuleControl> ModuleSubject<C> {
    pub fn new(control: C, artifact: impl Into<PathBuf>) -> Self {
        let artifact = artifact.into();
        let name = module_name_for(&artifact);
        Self {
            control,
            artifact,
            name,
            state: ModuleState::Unloaded,
            privilege_checked: false,
            settle_delay: Duration::from_secs(1),
            stdout: Vec::new(),
            stderr: Vec::new(),
            drained: false,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ModuleState::Loaded
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    async fn ensure_privilege(&mut self) -> Result<()> {
        if !self.privilege_checked {
            self.control.check_privilege().await?;
            self.privilege_checked = true;
        }
        Ok(())
    }

    fn capture(&mut self, output: &CommandOutput) {
        self.stdout.extend_from_slice(&output.stdout);
        self.stderr.extend_from_slice(&output.stderr);
    }

    /// Inserts the module after clearing the kernel log.
    ///
    /// A failing `insmod` is tolerated when the artifact exists: the log and
    /// registry checks that follow decide whether it really loaded.
    pub async fn load(&mut self) -> Result<()> {
        if self.state == ModuleState::Loaded {
            return Err(HarnessError::DoubleLoad(self.name.clone()));
        }
        self.ensure_privilege().await?;
        if !self.artifact.exists() {
            return Err(HarnessError::ArtifactMissing(self.artifact.clone()));
        }

        self.control.clear_log().await?;
        info!("Loading kernel module {} from {:?}", self.name, self.artifact);
        let output = self
            .control
            .load(&self.artifact)
            .await
            .map_err(|e| HarnessError::LoadFailed {
                module: self.name.clone(),
                reason: e.to_string(),
            })?;
        self.capture(&output);
        if !output.success {
            warn!(
                "insmod {} reported an error but the artifact exists, continuing: {}",
                self.name,
                output.stderr_lossy()
            );
        }
        self.state = ModuleState::Loaded;

        sleep(self.settle_delay).await;
        Ok(())
    }

    /// Removes the module.
    pub async fn unload(&mut self) -> Result<()> {
        if self.state != ModuleState::Loaded {
            return Err(HarnessError::NotLoaded(self.name.clone()));
        }
        info!("Unloading kernel module {}", self.name);
        let output = self.control.unload(&self.name).await?;
        self.capture(&output);
        if !output.success {
            return Err(HarnessError::UnloadFailed {
                module: self.name.clone(),
                reason: output.stderr_lossy(),
            });
        }
        self.state = ModuleState::Unloaded;

        sleep(self.settle_delay).await;
        Ok(())
    }

    /// Reads the kernel log, optionally restricted to one level.
    pub async fn read_log(&self, severity: Option<Severity>) -> Result<String> {
        self.control.read_log(severity).await
    }

    /// Appends a failure for every entry of `query` missing from the kernel log.
    pub async fn check_log(&self, query: &LogQuery, failures: &mut FailureList) -> Result<()> {
        let snapshot = self.read_log(query.severity()).await?;
        query.check(&snapshot, failures);
        Ok(())
    }

    async fn registered(&self) -> Result<bool> {
        let listing = self.control.list_loaded().await?;
        Ok(module_registered(&listing, &self.name))
    }
}

#[async_trait]
impl<C: ModuleControl> Subject for ModuleSubject<C> {
    type State = ModuleState;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        self.ensure_privilege().await
    }

    async fn poll(&mut self) -> Result<ModuleState> {
        if self.registered().await? {
            Ok(ModuleState::Loaded)
        } else {
            Ok(ModuleState::Unloaded)
        }
    }

    async fn deliver(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Load => self.load().await,
            Action::Unload => self.unload().await,
            Action::Signal(_) => Err(HarnessError::UnsupportedAction {
                action: action.to_string(),
                subject: self.name.clone(),
            }),
        }
    }

    async fn wait_with_timeout(&mut self, before: ModuleState, quantum: Duration) -> WaitOutcome<ModuleState> {
        let deadline = Instant::now() + quantum;
        loop {
            match self.poll().await {
                Ok(state) if state != before => return WaitOutcome::Changed(state),
                Ok(_) => {}
                Err(e) => return WaitOutcome::Error(e.to_string()),
            }
            if Instant::now() >= deadline {
                return WaitOutcome::Unchanged;
            }
            sleep(REGISTRY_POLL_INTERVAL).await;
        }
    }

    /// Modules have no lethal step; teardown releases them.
    async fn finalize(&mut self, _budget: Duration) -> Result<ModuleState> {
        self.poll().await
    }

    async fn drain(&mut self, _timeout: Duration) -> Result<ExecutionOutcome> {
        if self.drained {
            return Err(HarnessError::command(
                format!("drain {}", self.name),
                "output was already drained for this test case",
            ));
        }
        self.drained = true;
        Ok(ExecutionOutcome {
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            termination: None,
        })
    }

    async fn teardown(&mut self, failures: &mut FailureList) {
        if self.state == ModuleState::Loaded {
            warn!("{} still loaded at teardown, force unloading", self.name);
            match self.control.unload(&self.name).await {
                Ok(output) if output.success => {}
                Ok(output) => warn!("rmmod {} failed: {}", self.name, output.stderr_lossy()),
                Err(e) => warn!("unable to run rmmod {}: {}", self.name, e),
            }
            self.state = ModuleState::Unloaded;
            sleep(self.settle_delay).await;
        }

        match self.registered().await {
            Ok(false) => debug!("{} is not registered, teardown clean", self.name),
            Ok(true) => {
                error!("kernel module {} leaked past teardown", self.name);
                failures.push(format!(
                    "Kernel module {0} is still loaded after teardown; remove it manually with `sudo rmmod {0}`",
                    self.name
                ));
            }
            Err(e) => {
                error!("unable to query loaded modules: {}", e);
                failures.push(format!(
                    "Unable to verify {0} was unloaded ({e}); check `lsmod` and remove it with `sudo rmmod {0}`",
                    self.name
                ));
            }
        }
    }
}

impl<C: ModuleControl> Drop for ModuleSubject<C> {
    fn drop(&mut self) {
        if self.state == ModuleState::Loaded {
            eprintln!(
                "ModuleSubject dropped with {} loaded, emergency cleanup",
                self.name
            );
            self.control.unload_blocking(&self.name);
        }
    }
}
