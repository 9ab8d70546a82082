//! Installing a system update bundle from an update disk.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::disks::classifier::UPDATE_BUNDLE;
use crate::disks::DiskInfo;
use crate::ipc::UpdateInfo;
use crate::process::{
    write_error_artifact, ChildSpec, LifecycleStatus, StatusCallback, Supervisor, TimestampedLog,
};

pub const UPDATE_LOG_FILENAME: &str = "update-log.txt";
pub const INSTALL_FAILED: &str = "Unable to install update.";

pub fn default_install_command() -> Vec<String> {
    vec!["rauc".to_string(), "install".to_string()]
}

/// Runs the install command against the bundle on one update disk.
pub struct UpdateLifecycle {
    disk_info: DiskInfo,
    install_command: Vec<String>,
    supervisor: Supervisor,
    status: Mutex<LifecycleStatus>,
    inform: StatusCallback,
}

impl UpdateLifecycle {
    pub fn new(
        disk_info: DiskInfo,
        install_command: Vec<String>,
        kill_grace: Duration,
        inform: StatusCallback,
    ) -> Self {
        let lifecycle = Self {
            disk_info,
            install_command,
            supervisor: Supervisor::new(kill_grace),
            status: Mutex::new(LifecycleStatus::Starting),
            inform,
        };
        (lifecycle.inform)(LifecycleStatus::Starting);
        lifecycle
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.disk_info.mount_path.join(UPDATE_BUNDLE)
    }

    pub fn status(&self) -> LifecycleStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> UpdateInfo {
        UpdateInfo {
            bundle_filename: UPDATE_BUNDLE.to_string(),
            status: self.status(),
            disk_info: self.disk_info.clone(),
        }
    }

    fn set_status(&self, status: LifecycleStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        (self.inform)(status);
    }

    fn log_path(&self) -> PathBuf {
        self.disk_info.mount_path.join(UPDATE_LOG_FILENAME)
    }

    pub async fn run(&self) {
        let Some(_guard) = self.supervisor.try_begin() else {
            warn!("Tried to start an update, but one is already running.");
            return;
        };

        let bundle = self.bundle_path();
        if !bundle.is_file() {
            let reason = format!("Unable to find {}", UPDATE_BUNDLE);
            warn!("{}", reason);
            write_error_artifact(&self.log_path(), INSTALL_FAILED, &reason);
            self.set_status(LifecycleStatus::Crashed);
            return;
        }

        let spawned = ChildSpec::from_command(
            &self.install_command,
            [bundle.display().to_string()],
            &self.disk_info.mount_path,
        )
        .and_then(|spec| self.supervisor.spawn(&spec));

        let running = match spawned {
            Ok(running) => running,
            Err(e) => {
                error!("Failed to start update install: {}", e);
                write_error_artifact(&self.log_path(), INSTALL_FAILED, &e.to_string());
                self.set_status(LifecycleStatus::Crashed);
                return;
            }
        };

        info!("Installing {} (pid {})", bundle.display(), running.pid);
        self.set_status(LifecycleStatus::Running);

        let mut log = TimestampedLog::create(&self.log_path());
        let status = self
            .supervisor
            .wait(running, move |_, line| {
                info!(target: "astoria::install", "{}", line);
                log.line(&line);
            })
            .await;

        match status {
            Ok(status) => {
                info!("Update install exited ({})", status);
                self.set_status(status);
            }
            Err(e) => {
                error!("Lost track of update install: {}", e);
                self.set_status(LifecycleStatus::Crashed);
            }
        }
    }

    pub async fn kill(&self) {
        self.supervisor.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::{DiskType, DiskUuid};
    use crate::process::DEFAULT_KILL_GRACE;
    use std::path::Path;
    use std::sync::Arc;

    fn lifecycle(mount: &Path, command: &[&str]) -> (UpdateLifecycle, Arc<Mutex<Vec<LifecycleStatus>>>) {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let inform: StatusCallback = {
            let statuses = statuses.clone();
            Arc::new(move |s| statuses.lock().unwrap().push(s))
        };
        let disk = DiskInfo {
            uuid: DiskUuid::new("update"),
            mount_path: mount.to_path_buf(),
            disk_type: DiskType::Update,
        };
        let command = command.iter().map(|s| s.to_string()).collect();
        (
            UpdateLifecycle::new(disk, command, DEFAULT_KILL_GRACE, inform),
            statuses,
        )
    }

    #[tokio::test]
    async fn test_install_runs_command_with_bundle() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join(UPDATE_BUNDLE), "bundle").unwrap();
        let (update, statuses) = lifecycle(mount.path(), &["sh", "-c", "echo installing $0"]);

        update.run().await;

        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                LifecycleStatus::Starting,
                LifecycleStatus::Running,
                LifecycleStatus::Finished
            ]
        );
        let log = std::fs::read_to_string(mount.path().join(UPDATE_LOG_FILENAME)).unwrap();
        assert!(log.contains("installing"));
        assert!(log.contains(UPDATE_BUNDLE));
        assert_eq!(update.info().status, LifecycleStatus::Finished);
    }

    #[tokio::test]
    async fn test_failed_install_crashes() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join(UPDATE_BUNDLE), "bundle").unwrap();
        let (update, _) = lifecycle(mount.path(), &["sh", "-c", "exit 1"]);

        update.run().await;
        assert_eq!(update.status(), LifecycleStatus::Crashed);
    }

    #[tokio::test]
    async fn test_missing_bundle() {
        let mount = tempfile::tempdir().unwrap();
        let (update, _) = lifecycle(mount.path(), &["true"]);

        update.run().await;
        assert_eq!(update.status(), LifecycleStatus::Crashed);
        let log = std::fs::read_to_string(mount.path().join(UPDATE_LOG_FILENAME)).unwrap();
        assert_eq!(log, "Unable to install update.\nUnable to find update.raucb.\n");
    }
}
