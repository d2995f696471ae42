use clap::{Args, Parser, Subcommand};
use eyre::eyre;
use std::path::PathBuf;
use std::time::Duration;

use sigwright::{HarnessConfig, ProcessConfig, Severity, Step, Termination};

type Result<T> = color_eyre::eyre::Result<T>;

/// Drives a program or kernel module through scripted signals and checks what it did
#[derive(Parser)]
#[command(name = "sigwright")]
#[command(about = "Drives a program or kernel module through scripted signals and checks what it did")]
#[command(version)]
pub struct Cli {
    /// Per-attempt wait for a state change (ms)
    #[arg(long, global = true, default_value = "1000")]
    pub wait_ms: u64,

    /// Extra wait attempts for pause/resume signals
    #[arg(long, global = true, default_value = "3")]
    pub retries: u32,

    /// Budget for the final SIGKILL to take effect (ms)
    #[arg(long, global = true, default_value = "5000")]
    pub finalize_ms: u64,

    /// Delay after insmod/rmmod before the module registry is read (ms)
    #[arg(long, global = true, default_value = "1000")]
    pub settle_ms: u64,

    /// Directory to run `make clean` and `make <target>` in before the case
    #[arg(long, global = true)]
    pub make_dir: Option<PathBuf>,

    /// Make target to build
    #[arg(long, global = true, default_value = "all")]
    pub make_target: String,

    #[command(subcommand)]
    pub command: CaseCommand,
}

#[derive(Subcommand)]
pub enum CaseCommand {
    /// Run a user-mode program
    Process(ProcessArgs),
    /// Load and unload a kernel module
    Module(ModuleArgs),
}

#[derive(Args)]
pub struct ProcessArgs {
    /// Step as `<signal>:<exit|stay>`, e.g. `3:stay` or `SIGKILL:exit`
    #[arg(long = "step", required = true)]
    pub steps: Vec<Step>,

    /// Substring that must appear in stdout
    #[arg(long, conflicts_with = "stdout_empty")]
    pub expect_stdout: Vec<String>,

    /// Substring that must appear in stderr
    #[arg(long, conflicts_with = "stderr_empty")]
    pub expect_stderr: Vec<String>,

    /// Stdout must be empty
    #[arg(long)]
    pub stdout_empty: bool,

    /// Stderr must be empty
    #[arg(long)]
    pub stderr_empty: bool,

    /// Expected exit code
    #[arg(long, conflicts_with = "exit_signal")]
    pub exit_code: Option<i32>,

    /// Expected terminating signal number
    #[arg(long)]
    pub exit_signal: Option<i32>,

    /// Time the program gets to install its handlers before the first step (ms)
    #[arg(long, default_value = "0")]
    pub startup_ms: u64,

    /// Program to run
    pub program: String,

    /// Arguments for the program
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

#[derive(Args)]
pub struct ModuleArgs {
    /// Built module, e.g. `challenge_201.ko`
    #[arg(long)]
    pub artifact: PathBuf,

    /// Step as `load|unload[:change|stay]`
    #[arg(long = "step")]
    pub steps: Vec<Step>,

    /// Kernel log entry expected after loading
    #[arg(long)]
    pub load_msg: Vec<String>,

    /// Kernel log entry expected after unloading
    #[arg(long)]
    pub unload_msg: Vec<String>,

    /// Restrict log checks to one level (emerg, alert, crit, err, warn, notice, info, debug)
    #[arg(long)]
    pub level: Option<Severity>,
}

impl Cli {
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::default()
            .with_wait_quantum(Duration::from_millis(self.wait_ms))
            .with_non_waitable_retries(self.retries)
            .with_finalize_budget(Duration::from_millis(self.finalize_ms))
            .with_settle_delay(Duration::from_millis(self.settle_ms))
    }
}

impl ProcessArgs {
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig::new(&self.program)
            .args(self.args.iter().cloned())
            .startup_grace(Duration::from_millis(self.startup_ms))
    }

    pub fn termination(&self) -> Option<Termination> {
        match (self.exit_code, self.exit_signal) {
            (Some(code), _) => Some(Termination::Exited(code)),
            (None, Some(signal)) => Some(Termination::Signaled(signal)),
            (None, None) => None,
        }
    }
}

impl ModuleArgs {
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() && self.load_msg.is_empty() && self.unload_msg.is_empty() {
            return Err(eyre!(
                "nothing to check for {}: pass --step, --load-msg or --unload-msg",
                self.artifact.display()
            ));
        }
        if self.level.is_some() && self.load_msg.is_empty() && self.unload_msg.is_empty() {
            return Err(eyre!("--level only applies to --load-msg and --unload-msg"));
        }
        Ok(())
    }
}
