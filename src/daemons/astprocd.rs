//! Process manager: runs usercode from the inserted usercode disk.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::bus::{handler, BroadcastHelper, BusConfig, Transport};
use crate::disks::{DiskHandler, DiskInfo, DiskTracker, DiskType, DiskTypeCalculator};
use crate::error::BusError;
use crate::ipc::{
    EventHeader, ManagerMessage, MetadataManagerMessage, ProcessManagerMessage, RequestHeader,
    RequestResponse, UsercodeLogEvent,
};
use crate::manager::{ManagerState, StateManager};
use crate::metadata::fields::MetadataField;
use crate::metadata::sources::DiskOverrides;
use crate::metadata::Metadata;
use crate::process::{write_error_artifact, LifecycleStatus, StatusCallback};
use crate::usercode::{LogLine, LogSink, UsercodeLifecycle, UsercodeSettings, LOG_FILENAME, START_FAILED};

pub const NAME: &str = "astprocd";
pub const MULTIPLE_DISKS: &str = "It is not safe to run multiple code disks at once";
pub const NO_LIFECYCLE: &str = "No active usercode lifecycle";
pub const ALREADY_RUNNING: &str = "Code is already running.";

pub struct ProcessManager {
    state: ManagerState<ProcessManagerMessage>,
    tracker: DiskTracker,
    settings: UsercodeSettings,
    default_entrypoint: String,
    metadata: Mutex<Option<Metadata>>,
    lifecycle: Mutex<Option<Arc<UsercodeLifecycle>>>,
    status_changed: Arc<Notify>,
    log_tx: mpsc::UnboundedSender<LogLine>,
    log_rx: Mutex<Option<mpsc::UnboundedReceiver<LogLine>>>,
}

impl ProcessManager {
    pub fn new(
        settings: UsercodeSettings,
        default_entrypoint: impl Into<String>,
        bus: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        let offline = ProcessManagerMessage {
            manager: ManagerMessage::stopped(),
            code_status: None,
            disk_info: None,
        };
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            state: ManagerState::new(
                NAME,
                &[super::astdiskd::NAME, super::astmetad::NAME],
                &offline,
                bus,
                transport,
            )?,
            tracker: DiskTracker::new(DiskTypeCalculator::default()),
            settings,
            default_entrypoint: default_entrypoint.into(),
            metadata: Mutex::new(None),
            lifecycle: Mutex::new(None),
            status_changed: Arc::new(Notify::new()),
            log_tx,
            log_rx: Mutex::new(Some(log_rx)),
        }))
    }

    fn current(&self) -> Option<Arc<UsercodeLifecycle>> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn code_status(&self) -> Option<LifecycleStatus> {
        self.current().map(|lifecycle| lifecycle.status())
    }

    fn status_message(&self) -> ProcessManagerMessage {
        let lifecycle = self.current();
        ProcessManagerMessage {
            manager: ManagerMessage::running(),
            code_status: lifecycle.as_ref().map(|l| l.status()),
            disk_info: lifecycle.map(|l| l.disk_info().clone()),
        }
    }

    async fn publish_status(&self) {
        if let Err(e) = self.state.set_status(self.status_message()).await {
            warn!("Unable to publish process status: {}", e);
        }
    }

    /// The disk's own settings win, then the latest published metadata.
    fn entrypoint_for(&self, disk: &DiskInfo) -> String {
        let from_disk = DiskOverrides::load(disk.clone())
            .and_then(|o| o.diff.get(MetadataField::UsercodeEntrypoint.as_str()).cloned())
            .filter(|e| !e.is_empty());
        from_disk
            .or_else(|| {
                self.metadata
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(|m| m.usercode_entrypoint.clone())
            })
            .unwrap_or_else(|| self.default_entrypoint.clone())
    }

    fn inform_callback(&self) -> StatusCallback {
        let notify = Arc::clone(&self.status_changed);
        Arc::new(move |status| {
            debug!("Usercode is {}", status);
            notify.notify_one();
        })
    }

    fn log_sink(&self) -> LogSink {
        let tx = self.log_tx.clone();
        Arc::new(move |line| {
            let _ = tx.send(line);
        })
    }

    fn handle_metadata(&self, payload: &str) {
        match serde_json::from_str::<MetadataManagerMessage>(payload) {
            Ok(message) => {
                *self.metadata.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.metadata);
            }
            Err(e) => warn!("Received bad metadata message: {}", e),
        }
    }

    async fn handle_kill(&self, request: RequestHeader) -> RequestResponse {
        let Some(lifecycle) = self.current() else {
            return RequestResponse::fail(&request, NO_LIFECYCLE);
        };
        info!("Kill request received.");
        lifecycle.kill().await;
        RequestResponse::ok(&request)
    }

    async fn handle_restart(&self, request: RequestHeader) -> RequestResponse {
        info!("Restart request received.");
        let Some(lifecycle) = self.current() else {
            return RequestResponse::fail(&request, NO_LIFECYCLE);
        };
        if lifecycle.status() == LifecycleStatus::Running {
            return RequestResponse::fail(&request, ALREADY_RUNNING);
        }
        tokio::spawn(async move { lifecycle.run().await });
        RequestResponse::ok(&request)
    }

    /// Republish whenever a lifecycle reports a transition.
    async fn status_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.status_changed.notified() => self.publish_status().await,
                _ = self.state.wait_loop() => break,
            }
        }
    }

    async fn log_loop(self: Arc<Self>, mut lines: mpsc::UnboundedReceiver<LogLine>) {
        let helper = BroadcastHelper::<UsercodeLogEvent>::sender(Arc::clone(self.state.bus()));
        loop {
            let line = tokio::select! {
                line = lines.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
                _ = self.state.wait_loop() => break,
            };
            let event = UsercodeLogEvent {
                header: EventHeader::new::<UsercodeLogEvent>(NAME, line.index),
                pid: line.pid,
                content: line.content,
                source: line.source,
            };
            if let Err(e) = helper.send(&event).await {
                debug!("Unable to broadcast usercode log: {}", e);
            }
        }
    }
}

#[async_trait]
impl DiskHandler for ProcessManager {
    async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo) {
        if disk.disk_type != DiskType::Usercode {
            return;
        }
        info!("Usercode disk {} is mounted at {}", disk.uuid, disk.mount_path.display());

        let lifecycle = {
            let mut slot = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!("Cannot run usercode, there is already a lifecycle present.");
                write_error_artifact(&disk.mount_path.join(LOG_FILENAME), START_FAILED, MULTIPLE_DISKS);
                return;
            }

            let entrypoint = self.entrypoint_for(&disk);
            debug!("Starting usercode lifecycle for {} with {}", disk.uuid, entrypoint);
            let lifecycle = Arc::new(UsercodeLifecycle::new(
                disk,
                entrypoint,
                self.settings.clone(),
                self.inform_callback(),
                self.log_sink(),
            ));
            *slot = Some(Arc::clone(&lifecycle));
            lifecycle
        };

        self.publish_status().await;
        lifecycle.run().await;
    }

    async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo) {
        if disk.disk_type != DiskType::Usercode {
            return;
        }
        info!("Usercode disk {} removed ({})", disk.uuid, disk.mount_path.display());

        let lifecycle = {
            let mut slot = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let owned = slot.as_ref().is_some_and(|l| l.disk_info().uuid == disk.uuid);
            if owned {
                slot.take()
            } else {
                None
            }
        };

        match lifecycle {
            Some(lifecycle) => {
                lifecycle.kill().await;
                self.publish_status().await;
            }
            None => warn!("Disk removed, but no code lifecycle available"),
        }
    }
}

fn stopping(request: &RequestHeader) -> RequestResponse {
    RequestResponse::fail(request, "astprocd is stopping")
}

#[async_trait]
impl StateManager for ProcessManager {
    type Status = ProcessManagerMessage;

    fn state(&self) -> &ManagerState<ProcessManagerMessage> {
        &self.state
    }

    fn offline_status(&self) -> ProcessManagerMessage {
        ProcessManagerMessage {
            manager: ManagerMessage::stopped(),
            code_status: None,
            disk_info: None,
        }
    }

    async fn init(self: Arc<Self>) -> anyhow::Result<()> {
        let this: Weak<Self> = Arc::downgrade(&self);
        self.state
            .register_request("kill", move |request: RequestHeader| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.handle_kill(request).await,
                        None => stopping(&request),
                    }
                }
            })
            .await?;

        let this = Arc::downgrade(&self);
        self.state
            .register_request("restart", move |request: RequestHeader| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.handle_restart(request).await,
                        None => stopping(&request),
                    }
                }
            })
            .await?;

        Ok(())
    }

    async fn main(self: Arc<Self>) -> anyhow::Result<()> {
        self.publish_status().await;

        let status_task = tokio::spawn(Arc::clone(&self).status_loop());
        let log_rx = self.log_rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(log_rx) = log_rx {
            tokio::spawn(Arc::clone(&self).log_loop(log_rx));
        }

        let this = Arc::downgrade(&self);
        self.state
            .bus()
            .subscribe(
                super::astmetad::NAME,
                handler(move |_, payload| {
                    let this = this.clone();
                    async move {
                        if let Some(manager) = this.upgrade() {
                            manager.handle_metadata(&payload);
                        }
                    }
                }),
            )
            .await?;

        let this = Arc::downgrade(&self);
        self.state
            .bus()
            .subscribe(
                super::astdiskd::NAME,
                handler(move |_, payload| {
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
        self.tracker.remove_all(&self).await;
        let _ = status_task.await;
        Ok(())
    }
}
