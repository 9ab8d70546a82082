//! Update manager: installs the bundle from an inserted update disk.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bus::{BusConfig, Transport};
use crate::disks::{DiskHandler, DiskInfo, DiskTracker, DiskType, DiskTypeCalculator};
use crate::error::BusError;
use crate::ipc::{ManagerMessage, UpdateManagerMessage};
use crate::manager::{ManagerState, StateManager};
use crate::process::{write_error_artifact, StatusCallback};
use crate::update::{UpdateLifecycle, INSTALL_FAILED, UPDATE_LOG_FILENAME};

pub const NAME: &str = "astupdated";
pub const UPDATE_IN_PROGRESS: &str = "Another update is already in progress";

pub struct UpdateManager {
    state: ManagerState<UpdateManagerMessage>,
    tracker: DiskTracker,
    install_command: Vec<String>,
    kill_grace: Duration,
    lifecycle: Mutex<Option<Arc<UpdateLifecycle>>>,
    /// The current install's disk went away before it finished.
    disk_gone: Mutex<bool>,
    status_changed: Arc<Notify>,
}

impl UpdateManager {
    pub fn new(
        install_command: Vec<String>,
        kill_grace: Duration,
        bus: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        let offline = UpdateManagerMessage {
            manager: ManagerMessage::stopped(),
            update: None,
        };
        Ok(Arc::new(Self {
            state: ManagerState::new(NAME, &[super::astdiskd::NAME], &offline, bus, transport)?,
            tracker: DiskTracker::new(DiskTypeCalculator::default()),
            install_command,
            kill_grace,
            lifecycle: Mutex::new(None),
            disk_gone: Mutex::new(false),
            status_changed: Arc::new(Notify::new()),
        }))
    }

    fn current(&self) -> Option<Arc<UpdateLifecycle>> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn publish_status(&self) {
        let status = UpdateManagerMessage {
            manager: ManagerMessage::running(),
            update: self.current().map(|l| l.info()),
        };
        if let Err(e) = self.state.set_status(status).await {
            warn!("Unable to publish update status: {}", e);
        }
    }

    fn inform_callback(&self) -> StatusCallback {
        let notify = Arc::clone(&self.status_changed);
        Arc::new(move |status| {
            debug!("Update is {}", status);
            notify.notify_one();
        })
    }

    async fn status_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.status_changed.notified() => self.publish_status().await,
                _ = self.state.wait_loop() => break,
            }
        }
    }
}

#[async_trait]
impl DiskHandler for UpdateManager {
    async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo) {
        if disk.disk_type != DiskType::Update {
            return;
        }
        info!("Update disk {} is mounted at {}", disk.uuid, disk.mount_path.display());

        let lifecycle = {
            let mut slot = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|l| !l.status().is_terminal()) {
                warn!("Ignoring update disk {}, an update is already in progress.", disk.uuid);
                write_error_artifact(
                    &disk.mount_path.join(UPDATE_LOG_FILENAME),
                    INSTALL_FAILED,
                    UPDATE_IN_PROGRESS,
                );
                return;
            }
            let lifecycle = Arc::new(UpdateLifecycle::new(
                disk,
                self.install_command.clone(),
                self.kill_grace,
                self.inform_callback(),
            ));
            *slot = Some(Arc::clone(&lifecycle));
            *self.disk_gone.lock().unwrap_or_else(|e| e.into_inner()) = false;
            lifecycle
        };

        self.publish_status().await;
        lifecycle.run().await;

        let cleared = {
            let mut slot = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let mut disk_gone = self.disk_gone.lock().unwrap_or_else(|e| e.into_inner());
            if *disk_gone && slot.as_ref().is_some_and(|l| Arc::ptr_eq(l, &lifecycle)) {
                *disk_gone = false;
                slot.take();
                true
            } else {
                false
            }
        };
        if cleared {
            info!("Update finished after its disk was removed");
            self.publish_status().await;
        }
    }

    async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo) {
        if disk.disk_type != DiskType::Update {
            return;
        }
        info!("Update disk {} removed", disk.uuid);

        let cleared = {
            let mut slot = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let terminal = slot
                .as_ref()
                .filter(|l| l.info().disk_info.uuid == disk.uuid)
                .map(|l| l.status().is_terminal());
            match terminal {
                Some(true) => {
                    slot.take();
                    true
                }
                Some(false) => {
                    // The installer keeps running without its disk.
                    warn!("Update disk removed while the install is still running");
                    *self.disk_gone.lock().unwrap_or_else(|e| e.into_inner()) = true;
                    false
                }
                None => false,
            }
        };
        if cleared {
            self.publish_status().await;
        }
    }
}

#[async_trait]
impl StateManager for UpdateManager {
    type Status = UpdateManagerMessage;

    fn state(&self) -> &ManagerState<UpdateManagerMessage> {
        &self.state
    }

    fn offline_status(&self) -> UpdateManagerMessage {
        UpdateManagerMessage {
            manager: ManagerMessage::stopped(),
            update: None,
        }
    }

    async fn main(self: Arc<Self>) -> anyhow::Result<()> {
        self.publish_status().await;
        let status_task = tokio::spawn(Arc::clone(&self).status_loop());

        let this = Arc::downgrade(&self);
        self.state
            .bus()
            .subscribe(
                super::astdiskd::NAME,
                crate::bus::handler(move |_, payload| {
                    let this = this.clone();
                    async move {
                        if let Some(manager) = this.upgrade() {
                            manager.tracker.handle_message(&payload, &manager).await;
                        }
                    }
                }),
            )
            .await?;

        self.state.wait_loop().await;
        if let Some(lifecycle) = self.current() {
            lifecycle.kill().await;
        }
        let _ = status_task.await;
        Ok(())
    }
}
