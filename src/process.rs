use crate::config::ProcessConfig;
use crate::error::{HarnessError, Result};
use crate::failures::FailureList;
use crate::outcome::{ExecutionOutcome, Termination};
use crate::script::Action;
use crate::signals::{self, SignalNumber};
use crate::subject::{Subject, SubjectState, WaitOutcome};

use async_trait::async_trait;
use nix::unistd::Pid;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Linux truncates `comm` to 15 bytes
const COMM_LEN: usize = 15;

/// Number of times teardown re-scans the process table before declaring a leak
const LEAK_SCAN_ATTEMPTS: usize = 5;

/// Environment variable carrying the lineage tag into every descendant
pub const LINEAGE_VAR: &str = "SIGWRIGHT_LINEAGE";

/// State of a user-mode subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running
    Running,
    /// Process is paused by a job-control signal
    Stopped,
    /// Process has exited and been reaped
    Exited,
}

impl SubjectState for ProcessState {
    fn is_terminal(&self) -> bool {
        *self == ProcessState::Exited
    }

    fn reflects(&self, action: Action) -> bool {
        match action {
            Action::Signal(signal) if signal.pauses() => *self == ProcessState::Stopped,
            Action::Signal(signal) if signal.resumes() => *self == ProcessState::Running,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessState::Running => "running",
            ProcessState::Stopped => "stopped",
            ProcessState::Exited => "exited",
        };
        f.write_str(label)
    }
}

type Reader = JoinHandle<std::io::Result<Vec<u8>>>;

/// A user-mode program under test.
///
/// The child runs in its own process group with stdout and stderr piped into
/// background readers, so a chatty subject never blocks on a full pipe while
/// the script is being delivered.
pub struct ProcessSubject {
    /// How to spawn the subject
    config: ProcessConfig,
    /// Executable file name, used in reports and the leak detector
    name: String,
    /// Tag exported to the subject's environment; survives `setsid` and daemonizing
    lineage: String,
    /// Child handle while the subject has not been reaped
    child: Option<Child>,
    /// Process ID (and process group ID) once spawned
    pid: Option<Pid>,
    /// Exit status once reaped
    exit_status: Option<ExitStatus>,
    stdout_reader: Option<Reader>,
    stderr_reader: Option<Reader>,
    /// Start time of the subject
    start_time: Option<Instant>,
    drained: bool,
}

impl ProcessSubject {
    pub fn new(config: ProcessConfig) -> Self {
        let name = config.display_name();
        Self {
            config,
            name,
            lineage: Uuid::new_v4().simple().to_string(),
            child: None,
            pid: None,
            exit_status: None,
            stdout_reader: None,
            stderr_reader: None,
            start_time: None,
            drained: false,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Value of [`LINEAGE_VAR`] in the subject's environment
    pub fn lineage(&self) -> &str {
        &self.lineage
    }

    /// Time since the subject was spawned
    pub fn runtime(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }

    fn require_pid(&self) -> Result<Pid> {
        self.pid.ok_or_else(|| HarnessError::NotStarted(self.name.clone()))
    }

    fn record_exit(&mut self, status: ExitStatus) {
        info!("{} exited with status: {:?}", self.name, status);
        self.exit_status = Some(status);
    }

    /// Sends SIGKILL to every member of the subject's process group.
    ///
    /// An empty group is not an error.
    fn kill_group(&self) {
        if let Some(pgid) = self.pid {
            match signals::send_to_group(pgid, SignalNumber::KILL) {
                Ok(()) => debug!("sent SIGKILL to process group {}", pgid),
                Err(HarnessError::Os(nix::Error::ESRCH)) => {}
                Err(e) => warn!("failed to SIGKILL process group {}: {}", pgid, e),
            }
        }
    }

    /// Group kill that is skipped once the leader is reaped and the group is empty.
    ///
    /// An empty group's ID may be reused by an unrelated group.
    async fn sweep_group(&self) {
        let Some(pgid) = self.pid else {
            return;
        };
        if self.exit_status.is_some() && !group_has_members(pgid).await {
            debug!("process group {} is empty, skipping sweep", pgid);
            return;
        }
        self.kill_group();
    }

    /// Same-name processes spawned by this subject, wherever they moved to.
    ///
    /// A process counts when it is still in the subject's group or carries
    /// the subject's lineage tag.
    async fn strays(&self, pgid: Pid) -> Vec<ProcEntry> {
        let mut strays = Vec::new();
        for entry in find_processes_by_name(&self.name).await {
            if entry.pgid == pgid.as_raw() || carries_lineage(entry.pid, &self.lineage).await {
                strays.push(entry);
            }
        }
        strays
    }

    async fn reap_within(&mut self, budget: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match timeout(budget, child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                Ok(Some(status))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn join_reader(&self, reader: Option<Reader>, stream: &str, limit: Duration) -> Result<Vec<u8>> {
        let Some(mut reader) = reader else {
            return Ok(Vec::new());
        };
        match timeout(limit, &mut reader).await {
            Ok(Ok(Ok(bytes))) => Ok(bytes),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(join_error)) => Err(HarnessError::command(format!("drain {stream}"), join_error)),
            Err(_) => {
                warn!("{} of {} still open after {:?}, abandoning it", stream, self.name, limit);
                reader.abort();
                Ok(Vec::new())
            }
        }
    }
}

fn spawn_reader<R>(mut stream: R) -> Reader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        Ok(buffer)
    })
}

#[async_trait]
impl Subject for ProcessSubject {
    type State = ProcessState;

    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        info!("Spawning process: {} {:?}", self.config.command, self.config.args);

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);

        // A fresh process group lets teardown sweep helpers the subject forks
        command.process_group(0);
        command.kill_on_drop(true);
        command.env(LINEAGE_VAR, &self.lineage);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        // The runtime's signal mask is inherited across exec; the subject must see every signal
        unsafe {
            command.pre_exec(|| {
                use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

                pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        if let Some(ref work_dir) = self.config.working_directory {
            command.current_dir(work_dir);
        }
        for (key, value) in &self.config.environment {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| HarnessError::SpawnFailed {
            command: self.config.command.clone(),
            source,
        })?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => {
                return Err(HarnessError::command(
                    self.config.command.clone(),
                    "exited before its PID could be read",
                ))
            }
        };

        self.stdout_reader = child.stdout.take().map(spawn_reader);
        self.stderr_reader = child.stderr.take().map(spawn_reader);
        self.pid = Some(pid);
        self.start_time = Some(Instant::now());
        self.child = Some(child);

        info!("Process spawned with PID: {}", pid);
        if !self.config.startup_grace.is_zero() {
            sleep(self.config.startup_grace).await;
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<ProcessState> {
        let pid = self.require_pid()?;
        if self.exit_status.is_some() {
            return Ok(ProcessState::Exited);
        }
        if let Some(child) = self.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                self.record_exit(status);
                return Ok(ProcessState::Exited);
            }
        }
        match read_stat(pid).await {
            Some(stat) if stat.is_stopped() => Ok(ProcessState::Stopped),
            _ => Ok(ProcessState::Running),
        }
    }

    async fn deliver(&mut self, action: Action) -> Result<()> {
        let pid = self.require_pid()?;
        match action {
            Action::Signal(signal) => {
                debug!("sending {} to {} ({})", signal, self.name, pid);
                signals::send(pid, signal)
            }
            Action::Load | Action::Unload => Err(HarnessError::UnsupportedAction {
                action: action.to_string(),
                subject: self.name.clone(),
            }),
        }
    }

    async fn wait_with_timeout(&mut self, before: ProcessState, quantum: Duration) -> WaitOutcome<ProcessState> {
        if before.is_terminal() {
            return WaitOutcome::Unchanged;
        }
        match self.reap_within(quantum).await {
            Ok(Some(_)) => WaitOutcome::Changed(ProcessState::Exited),
            Ok(None) if self.child.is_none() => {
                WaitOutcome::Error(format!("{} has not been started", self.name))
            }
            Ok(None) => WaitOutcome::Unchanged,
            Err(e) => WaitOutcome::Error(e.to_string()),
        }
    }

    async fn finalize(&mut self, budget: Duration) -> Result<ProcessState> {
        let pid = self.require_pid()?;
        if self.poll().await? != ProcessState::Exited {
            info!("Force killing process {}", pid);
            if let Err(e) = signals::send(pid, SignalNumber::KILL) {
                warn!("Failed to send SIGKILL: {}", e);
            }
        }
        self.sweep_group().await;

        match self.reap_within(budget).await? {
            Some(_) => Ok(ProcessState::Exited),
            None => self.poll().await,
        }
    }

    async fn drain(&mut self, limit: Duration) -> Result<ExecutionOutcome> {
        if self.drained {
            return Err(HarnessError::command(
                format!("drain {}", self.name),
                "output was already drained for this test case",
            ));
        }
        self.drained = true;

        let stdout_reader = self.stdout_reader.take();
        let stderr_reader = self.stderr_reader.take();
        let stdout = self.join_reader(stdout_reader, "stdout", limit).await?;
        let stderr = self.join_reader(stderr_reader, "stderr", limit).await?;

        Ok(ExecutionOutcome {
            stdout,
            stderr,
            termination: self.exit_status.and_then(Termination::from_status),
        })
    }

    async fn teardown(&mut self, failures: &mut FailureList) {
        let Some(pgid) = self.pid else {
            return;
        };

        if self.exit_status.is_none() {
            warn!("{} still running at teardown, killing it", self.name);
            self.kill_group();
            match self.reap_within(Duration::from_secs(1)).await {
                Ok(Some(_)) => {}
                Ok(None) => error!("{} did not exit after SIGKILL", self.name),
                Err(e) => error!("error reaping {}: {}", self.name, e),
            }
        }
        self.sweep_group().await;
        self.child = None;
        for reader in [self.stdout_reader.take(), self.stderr_reader.take()].into_iter().flatten() {
            reader.abort();
        }

        let mut leaked = Vec::new();
        for attempt in 0..LEAK_SCAN_ATTEMPTS {
            leaked = self.strays(pgid).await;
            if leaked.is_empty() {
                break;
            }
            debug!("leak scan {} found {} survivor(s)", attempt + 1, leaked.len());
            sleep(Duration::from_millis(100)).await;
        }

        if !leaked.is_empty() {
            let pids: Vec<String> = leaked.iter().map(|p| p.pid.to_string()).collect();
            error!("{} leaked past teardown: {:?}", self.name, pids);
            for stray in &leaked {
                match signals::send(Pid::from_raw(stray.pid), SignalNumber::KILL) {
                    Ok(()) | Err(HarnessError::Os(nix::Error::ESRCH)) => {}
                    Err(e) => warn!("failed to SIGKILL stray {}: {}", stray.pid, e),
                }
            }
            failures.push(format!(
                "{} is still running after teardown (PID {}); remove it manually with `kill -9 {}`",
                self.name,
                pids.join(", "),
                pids.join(" ")
            ));
        }
    }
}

impl Drop for ProcessSubject {
    fn drop(&mut self) {
        // Emergency cleanup when a test bails out before teardown
        if let Some(pid) = self.pid {
            if self.exit_status.is_none() && self.child.is_some() {
                eprintln!(
                    "ProcessSubject dropped with running child (PID: {}), emergency cleanup",
                    pid
                );
                self.kill_group();
            }
        }
    }
}

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    pub pgid: i32,
}

impl ProcEntry {
    /// Parses the contents of `/proc/<pid>/stat`.
    ///
    /// `comm` may itself contain spaces and parentheses, so it is bounded by
    /// the first `(` and the last `)`.
    pub fn parse(stat: &str) -> Option<Self> {
        let open = stat.find('(')?;
        let close = stat.rfind(')')?;
        let pid = stat[..open].trim().parse().ok()?;
        let comm = stat.get(open + 1..close)?.to_string();
        let mut rest = stat.get(close + 1..)?.split_whitespace();
        let state = rest.next()?.chars().next()?;
        let ppid = rest.next()?.parse().ok()?;
        let pgid = rest.next()?.parse().ok()?;
        Some(Self {
            pid,
            comm,
            state,
            ppid,
            pgid,
        })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, 'T' | 't')
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

async fn read_stat(pid: Pid) -> Option<ProcEntry> {
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await.ok()?;
    ProcEntry::parse(&stat)
}

/// Every readable row of `/proc`; empty where `/proc` is unavailable.
async fn process_table() -> Vec<ProcEntry> {
    let mut table = Vec::new();
    let mut entries = match tokio::fs::read_dir("/proc").await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("process table unavailable: {}", e);
            return table;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        if let Some(stat) = read_stat(Pid::from_raw(pid)).await {
            table.push(stat);
        }
    }
    table
}

/// Lists live (non-zombie) processes whose name matches `name`.
///
/// Returns an empty list where `/proc` is unavailable.
pub async fn find_processes_by_name(name: &str) -> Vec<ProcEntry> {
    let wanted: String = name.chars().take(COMM_LEN).collect();
    process_table()
        .await
        .into_iter()
        .filter(|stat| stat.comm == wanted && !stat.is_zombie())
        .collect()
}

/// True while any process, zombies included, still holds `pgid`.
pub async fn group_has_members(pgid: Pid) -> bool {
    process_table().await.iter().any(|stat| stat.pgid == pgid.as_raw())
}

/// Checks `/proc/<pid>/environ` for a subject's lineage tag.
pub async fn carries_lineage(pid: i32, lineage: &str) -> bool {
    let marker = format!("{LINEAGE_VAR}={lineage}");
    match tokio::fs::read(format!("/proc/{pid}/environ")).await {
        Ok(environ) => environ.split(|b| *b == 0).any(|var| var == marker.as_bytes()),
        Err(_) => false,
    }
}
