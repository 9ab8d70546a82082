//! Child process supervision shared by the usercode and update lifecycles.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::ipc::LogSource;

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStatus {
    #[serde(rename = "code_starting")]
    Starting,
    #[serde(rename = "code_running")]
    Running,
    #[serde(rename = "code_finished")]
    Finished,
    #[serde(rename = "code_killed")]
    Killed,
    #[serde(rename = "code_crashed")]
    Crashed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Starting => "starting",
            LifecycleStatus::Running => "running",
            LifecycleStatus::Finished => "finished",
            LifecycleStatus::Killed => "killed",
            LifecycleStatus::Crashed => "crashed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Finished | LifecycleStatus::Killed | LifecycleStatus::Crashed
        )
    }

    /// Negative codes mean the child was terminated by a signal.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => LifecycleStatus::Finished,
            c if c < 0 => LifecycleStatus::Killed,
            _ => LifecycleStatus::Crashed,
        }
    }

    pub fn from_exit_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::from_exit_code(code),
            None => LifecycleStatus::Killed,
        }
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called on every lifecycle status transition.
pub type StatusCallback = Arc<dyn Fn(LifecycleStatus) + Send + Sync>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ChildSpec {
    /// `command[0]` is the program, the rest plus `extra` are its arguments.
    pub fn from_command(
        command: &[String],
        extra: impl IntoIterator<Item = String>,
        cwd: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command")
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.iter().cloned().chain(extra).collect(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        })
    }

    pub fn env(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// A spawned child together with its merged output stream.
pub struct RunningChild {
    pub pid: u32,
    child: Child,
    lines: mpsc::UnboundedReceiver<(LogSource, String)>,
}

/// Runs at most one child at a time and knows how to stop it.
pub struct Supervisor {
    run_lock: Mutex<()>,
    pid: watch::Sender<Option<u32>>,
    /// Process group of the last child while anything in it still holds its output open
    group: Arc<std::sync::Mutex<Option<u32>>>,
    kill_grace: Duration,
}

impl Supervisor {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            run_lock: Mutex::new(()),
            pid: watch::Sender::new(None),
            group: Arc::new(std::sync::Mutex::new(None)),
            kill_grace,
        }
    }

    /// The run lock; `None` when a run is already in progress.
    pub fn try_begin(&self) -> Option<MutexGuard<'_, ()>> {
        self.run_lock.try_lock().ok()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.borrow()
    }

    /// Group of processes left behind by an exited child, e.g. backgrounded jobs.
    pub fn leftover_group(&self) -> Option<u32> {
        let group = *self.group.lock().unwrap_or_else(|e| e.into_inner());
        group.filter(|_| self.pid().is_none())
    }

    /// Spawn in a new process group with piped output.
    pub fn spawn(&self, spec: &ChildSpec) -> std::io::Result<RunningChild> {
        self.kill_leftovers();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or_default();
        self.pid.send_replace(Some(pid));
        *self.group.lock().unwrap_or_else(|e| e.into_inner()) = Some(pid);

        let (tx, lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, LogSource::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, LogSource::Stderr, tx);
        }

        debug!("Spawned {} with PID {}", spec.program, pid);
        Ok(RunningChild { pid, child, lines })
    }

    /// Wait for the child to exit, feeding its output to `on_line`.
    ///
    /// The status is returned once the child itself has exited. Output still held
    /// open by processes it left behind keeps draining in the background.
    pub async fn wait<F>(&self, running: RunningChild, on_line: F) -> std::io::Result<LifecycleStatus>
    where
        F: FnMut(LogSource, String) + Send + 'static,
    {
        let RunningChild {
            pid,
            mut child,
            lines,
        } = running;

        let mut drain = tokio::spawn(drain_output(lines, on_line, Arc::clone(&self.group), pid));

        let exit = child.wait().await;
        self.pid.send_replace(None);
        let exit = exit?;
        let status = LifecycleStatus::from_exit_status(exit);
        info!("Process {} exited with {} ({})", pid, exit, status);

        if tokio::time::timeout(OUTPUT_LINGER, &mut drain).await.is_err() {
            warn!(
                "Process group {} still holds its output open after exit",
                pid
            );
        }
        Ok(status)
    }

    /// SIGTERM, then SIGKILL once the grace period passes.
    ///
    /// Without a live child this only clears up processes an exited child left behind.
    pub async fn kill(&self) {
        let Some(pid) = self.pid() else {
            if !self.kill_leftovers() {
                debug!("Tried to kill process, but no process is running.");
            }
            return;
        };
        if self.run_lock.try_lock().is_ok() {
            debug!("Tried to kill process, but no run is active.");
            return;
        }

        let mut exited = self.pid.subscribe();
        info!("Sent SIGTERM to pid {}", pid);
        signal_group(pid, Signal::Terminate);

        let wait = exited.wait_for(|current| *current != Some(pid));
        if tokio::time::timeout(self.kill_grace, wait).await.is_err() && self.pid() == Some(pid) {
            info!("Sent SIGKILL to pid {}", pid);
            signal_group(pid, Signal::Kill);
        }
        self.kill_leftovers();
    }

    fn kill_leftovers(&self) -> bool {
        let Some(group) = self.leftover_group() else {
            return false;
        };
        info!("Sent SIGKILL to leftover process group {}", group);
        signal_group(group, Signal::Kill);
        true
    }
}

/// How long output may keep arriving after the child itself has exited.
const OUTPUT_LINGER: Duration = Duration::from_millis(500);

async fn drain_output<F>(
    mut lines: mpsc::UnboundedReceiver<(LogSource, String)>,
    mut on_line: F,
    group: Arc<std::sync::Mutex<Option<u32>>>,
    pid: u32,
) where
    F: FnMut(LogSource, String),
{
    while let Some((source, line)) = lines.recv().await {
        on_line(source, line);
    }

    let mut group = group.lock().unwrap_or_else(|e| e.into_inner());
    if *group == Some(pid) {
        *group = None;
    }
}

fn spawn_line_reader<R>(stream: R, source: LogSource, tx: mpsc::UnboundedSender<(LogSource, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send((source, decode_line(&buf))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Unable to read process output: {}", e);
                    break;
                }
            }
        }
    });
}

/// Strip the line ending; bytes that are not UTF-8 become U+FFFD.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    if pid == 0 {
        return;
    }
    // The child leads its own group, so this reaches anything it started too.
    let rc = unsafe { libc::kill(-(pid as i32), sig) };
    if rc != 0 {
        debug!(
            "Signal to process group {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    warn!("Cannot send {:?} to {} on this platform", signal, pid);
}

/// `H:MM:SS.ffffff`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        elapsed.subsec_micros()
    )
}

/// A log file on the disk where each line is prefixed with the time since it was opened.
///
/// Write failures are logged once and the file is abandoned; callers keep running.
pub struct TimestampedLog {
    path: PathBuf,
    file: Option<File>,
    started: Instant,
}

impl TimestampedLog {
    pub fn create(path: &Path) -> Self {
        let file = match File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Unable to create {}: {}", path.display(), e);
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
            started: Instant::now(),
        }
    }

    /// Write one line and return it as written.
    pub fn line(&mut self, content: &str) -> String {
        let line = format!("[{}] {}\n", format_elapsed(self.started.elapsed()), content);
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                warn!("Unable to write {}: {}", self.path.display(), e);
                self.file = None;
            }
        }
        line
    }
}

/// Overwrite `path` with a short error for the person who inserted the disk.
pub fn write_error_artifact(path: &Path, heading: &str, detail: &str) {
    let content = format!("{}\n{}.\n", heading, detail.trim_end_matches('.'));
    if let Err(e) = std::fs::write(path, content) {
        warn!("Unable to write {}: {}", path.display(), e);
    }
}
