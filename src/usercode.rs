//! Running the team's code from a usercode disk.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::disks::classifier::USERCODE_BUNDLE;
use crate::disks::DiskInfo;
use crate::ipc::LogSource;
use crate::process::{
    write_error_artifact, ChildSpec, LifecycleStatus, StatusCallback, Supervisor, TimestampedLog,
    DEFAULT_KILL_GRACE,
};

pub const LOG_FILENAME: &str = "log.txt";
pub const START_FAILED: &str = "Unable to start code.";
const LEGACY_FILES: [&str; 4] = ["info.yaml", "info.yml", "wifi.yaml", "wifi.yml"];

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Unable to find robot.zip file")]
    Missing,

    #[error("The provided robot.zip is not a valid ZIP archive")]
    InvalidArchive(#[source] zip::result::ZipError),

    #[error("The provided robot.zip did not contain a {0}")]
    MissingEntrypoint(String),

    #[error("This is an old robot code package and will not work with this version of the kit")]
    Legacy,

    #[error("Unable to prepare the code: {0}")]
    Io(#[from] std::io::Error),
}

/// One line of usercode output, ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub pid: Option<u32>,
    /// Strictly increasing within a run
    pub index: i64,
    pub content: String,
    pub source: LogSource,
}

pub type LogSink = Arc<dyn Fn(LogLine) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UsercodeSettings {
    pub interpreter: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub initial_log_lines: Vec<String>,
    pub kill_grace: Duration,
}

impl Default for UsercodeSettings {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-u".to_string()],
            env: BTreeMap::new(),
            initial_log_lines: Vec::new(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Extract `robot.zip` from the disk into `dir` and check it is runnable.
pub fn extract_bundle(mount_path: &Path, dir: &Path, entrypoint: &str) -> Result<(), BundleError> {
    let zip_path = mount_path.join(USERCODE_BUNDLE);
    if !zip_path.is_file() {
        return Err(BundleError::Missing);
    }

    let mut archive =
        zip::ZipArchive::new(File::open(&zip_path)?).map_err(BundleError::InvalidArchive)?;
    archive.extract(dir).map_err(BundleError::InvalidArchive)?;

    if !dir.join(entrypoint).exists() {
        return Err(BundleError::MissingEntrypoint(entrypoint.to_string()));
    }

    if LEGACY_FILES.iter().any(|name| dir.join(name).exists()) {
        return Err(BundleError::Legacy);
    }

    Ok(())
}

/// Tees output to `log.txt` on the disk and to the sink.
struct UsercodeLog {
    file: TimestampedLog,
    sink: LogSink,
    pid: Option<u32>,
    index: i64,
}

impl UsercodeLog {
    fn write(&mut self, content: &str, source: LogSource) {
        let line = self.file.line(content);
        (self.sink)(LogLine {
            pid: self.pid,
            index: self.index,
            content: line,
            source,
        });
        self.index += 1;
    }
}

fn write_log(log: &Mutex<UsercodeLog>, content: &str, source: LogSource) {
    log.lock().unwrap_or_else(|e| e.into_inner()).write(content, source);
}

/// Owns the code on one usercode disk and at most one running copy of it.
pub struct UsercodeLifecycle {
    disk_info: DiskInfo,
    entrypoint: String,
    settings: UsercodeSettings,
    supervisor: Supervisor,
    status: Mutex<LifecycleStatus>,
    inform: StatusCallback,
    log_sink: LogSink,
}

impl UsercodeLifecycle {
    pub fn new(
        disk_info: DiskInfo,
        entrypoint: impl Into<String>,
        settings: UsercodeSettings,
        inform: StatusCallback,
        log_sink: LogSink,
    ) -> Self {
        let lifecycle = Self {
            disk_info,
            entrypoint: entrypoint.into(),
            supervisor: Supervisor::new(settings.kill_grace),
            settings,
            status: Mutex::new(LifecycleStatus::Starting),
            inform,
            log_sink,
        };
        (lifecycle.inform)(LifecycleStatus::Starting);
        lifecycle
    }

    pub fn disk_info(&self) -> &DiskInfo {
        &self.disk_info
    }

    pub fn status(&self) -> LifecycleStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: LifecycleStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        (self.inform)(status);
    }

    fn log_path(&self) -> PathBuf {
        self.disk_info.mount_path.join(LOG_FILENAME)
    }

    /// Extract, run and wait for the code. Returns once it has exited.
    pub async fn run(&self) {
        let Some(_guard) = self.supervisor.try_begin() else {
            warn!("Tried to start process, but one is already running.");
            return;
        };

        let workdir = match self.prepare() {
            Ok(dir) => dir,
            Err(e) => {
                warn!("robot.zip was invalid. Unable to start code: {}", e);
                write_error_artifact(&self.log_path(), START_FAILED, &e.to_string());
                self.set_status(LifecycleStatus::Crashed);
                return;
            }
        };

        info!("Starting usercode execution with entrypoint {}", self.entrypoint);
        let spawned = ChildSpec::from_command(
            &self.settings.interpreter,
            [self.entrypoint.clone()],
            workdir.path(),
        )
        .map(|spec| spec.env(&self.settings.env))
        .and_then(|spec| self.supervisor.spawn(&spec));

        let running = match spawned {
            Ok(running) => running,
            Err(e) => {
                error!("Failed to start usercode: {}", e);
                write_error_artifact(&self.log_path(), START_FAILED, &e.to_string());
                self.set_status(LifecycleStatus::Crashed);
                return;
            }
        };

        let pid = running.pid;
        info!("Usercode pid {} started in {}", pid, workdir.path().display());
        self.set_status(LifecycleStatus::Running);

        // Shared with the output drain, which may outlive this run if the code left
        // processes behind.
        let log = Arc::new(Mutex::new(UsercodeLog {
            file: TimestampedLog::create(&self.log_path()),
            sink: self.log_sink.clone(),
            pid: Some(pid),
            index: 0,
        }));
        if !self.settings.initial_log_lines.is_empty() {
            write_log(&log, "---", LogSource::Astoria);
            for line in &self.settings.initial_log_lines {
                write_log(&log, line, LogSource::Astoria);
            }
            write_log(&log, "---", LogSource::Astoria);
        }
        write_log(&log, "=== LOG STARTED ===", LogSource::Astoria);

        let drain_log = Arc::clone(&log);
        let status = self
            .supervisor
            .wait(running, move |source, line| write_log(&drain_log, &line, source))
            .await;
        write_log(&log, "=== LOG FINISHED ===", LogSource::Astoria);

        match status {
            Ok(status) => {
                info!("Usercode process exited ({})", status);
                self.set_status(status);
            }
            Err(e) => {
                error!("Lost track of usercode pid {}: {}", pid, e);
                self.set_status(LifecycleStatus::Crashed);
            }
        }
    }

    fn prepare(&self) -> Result<TempDir, BundleError> {
        let dir = tempfile::Builder::new().prefix("astprocd-").tempdir()?;
        extract_bundle(&self.disk_info.mount_path, dir.path(), &self.entrypoint)?;
        Ok(dir)
    }

    pub async fn kill(&self) {
        self.supervisor.kill().await;
    }
}
