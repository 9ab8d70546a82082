//! Disk manager: publishes the set of mounted removable disks.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{BusConfig, Transport};
use crate::config::DiskConfig;
use crate::disks::differ::classify;
use crate::disks::{DiskDiffer, DiskTypeCalculator, DiskUuid};
use crate::error::BusError;
use crate::ipc::{
    DiskManagerMessage, ManagerMessage, ManagerRequest, RequestHeader, RequestResponse,
    StaticDiskRequest,
};
use crate::manager::{ManagerState, StateManager};

pub const NAME: &str = "astdiskd";
pub const STATIC_PREFIX: &str = "static-";

const PROC_MOUNTS: &str = "/proc/mounts";
const DISK_BY_UUID: &str = "/dev/disk/by-uuid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
}

/// Undo the octal escapes `/proc/mounts` uses for whitespace and backslashes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
            })
        })
        .collect()
}

/// Disks found by polling the kernel mount table.
#[derive(Debug, Clone)]
pub struct MountTableProvider {
    mount_roots: Vec<PathBuf>,
    ignored_mounts: Vec<PathBuf>,
    mounts_file: PathBuf,
    by_uuid_dir: PathBuf,
}

impl MountTableProvider {
    pub fn new(config: &DiskConfig) -> Self {
        Self {
            mount_roots: config.mount_roots.clone(),
            ignored_mounts: config.ignored_mounts.clone(),
            mounts_file: PathBuf::from(PROC_MOUNTS),
            by_uuid_dir: PathBuf::from(DISK_BY_UUID),
        }
    }

    pub fn with_mounts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_file = path.into();
        self
    }

    pub fn with_by_uuid_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.by_uuid_dir = path.into();
        self
    }

    /// Strictly below a mount root and not ignored.
    pub fn is_managed(&self, mount_point: &Path) -> bool {
        self.mount_roots
            .iter()
            .any(|root| mount_point.starts_with(root) && mount_point != root)
            && !self.ignored_mounts.iter().any(|ignored| ignored == mount_point)
    }

    /// Device path to filesystem uuid, from the by-uuid symlinks.
    fn uuid_index(&self) -> HashMap<PathBuf, String> {
        let Ok(entries) = std::fs::read_dir(&self.by_uuid_dir) else {
            return HashMap::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let device = std::fs::canonicalize(entry.path()).ok()?;
                Some((device, entry.file_name().to_string_lossy().into_owned()))
            })
            .collect()
    }

    pub fn scan(&self) -> BTreeMap<DiskUuid, PathBuf> {
        let content = match std::fs::read_to_string(&self.mounts_file) {
            Ok(content) => content,
            Err(e) => {
                warn!("Unable to read {}: {}", self.mounts_file.display(), e);
                return BTreeMap::new();
            }
        };

        let uuids = self.uuid_index();
        parse_mounts(&content)
            .into_iter()
            .filter(|entry| self.is_managed(&entry.mount_point))
            .map(|entry| {
                let device = PathBuf::from(&entry.device);
                let canonical = std::fs::canonicalize(&device).unwrap_or(device);
                let id = uuids
                    .get(&canonical)
                    .cloned()
                    .unwrap_or_else(|| entry.device.clone());
                (DiskUuid::new(id), entry.mount_point)
            })
            .collect()
    }
}

pub struct DiskManager {
    state: ManagerState<DiskManagerMessage>,
    provider: MountTableProvider,
    poll_interval: Duration,
    settle: Duration,
    mounted: Mutex<BTreeMap<DiskUuid, PathBuf>>,
    static_disks: Mutex<BTreeMap<DiskUuid, PathBuf>>,
    differ: Mutex<DiskDiffer>,
    calculator: DiskTypeCalculator,
}

impl DiskManager {
    pub fn new(
        config: &DiskConfig,
        provider: MountTableProvider,
        bus: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        let offline = DiskManagerMessage {
            manager: ManagerMessage::stopped(),
            disks: BTreeMap::new(),
        };
        Ok(Arc::new(Self {
            state: ManagerState::new(NAME, &[], &offline, bus, transport)?,
            provider,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            settle: Duration::from_millis(config.settle_ms),
            mounted: Mutex::new(BTreeMap::new()),
            static_disks: Mutex::new(BTreeMap::new()),
            differ: Mutex::new(DiskDiffer::new()),
            calculator: DiskTypeCalculator::default(),
        }))
    }

    pub fn disks(&self) -> BTreeMap<DiskUuid, PathBuf> {
        let mut disks = self.mounted.lock().unwrap_or_else(|e| e.into_inner()).clone();
        disks.extend(
            self.static_disks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        disks
    }

    async fn update_state(&self) {
        let disks = self.disks();

        let changes = self
            .differ
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(classify(&disks, &self.calculator));
        for disk in &changes.added {
            info!(
                "Disk inserted: {} ({}) at {}",
                disk.uuid,
                disk.disk_type.as_str(),
                disk.mount_path.display()
            );
        }
        for disk in &changes.removed {
            info!("Disk removed: {} ({})", disk.uuid, disk.mount_path.display());
        }

        let status = DiskManagerMessage {
            manager: ManagerMessage::running(),
            disks,
        };
        if let Err(e) = self.state.set_status(status).await {
            warn!("Unable to publish disk status: {}", e);
        }
    }

    /// Rescan after the mount table has had time to settle. Returns false when stopped meanwhile.
    async fn settle_and_rescan(&self) -> bool {
        debug!("Mount table changed, waiting {:?} to settle", self.settle);
        tokio::select! {
            _ = tokio::time::sleep(self.settle) => {}
            _ = self.state.wait_loop() => return false,
        }
        *self.mounted.lock().unwrap_or_else(|e| e.into_inner()) = self.provider.scan();
        self.update_state().await;
        true
    }

    async fn add_static_disk(&self, request: StaticDiskRequest) -> RequestResponse {
        if !request.path.is_dir() {
            return RequestResponse::fail(
                &request,
                format!("{} does not exist or is not a directory", request.path.display()),
            );
        }

        if self.disks().values().any(|path| path == &request.path) {
            return RequestResponse::fail(&request, "The specified path is already mounted.");
        }

        let uuid = DiskUuid::new(format!("{}{}", STATIC_PREFIX, request.uuid()));
        info!("Static disk {} mounted ({})", uuid, request.path.display());
        self.static_disks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uuid, request.path.clone());
        self.update_state().await;
        RequestResponse::ok(&request)
    }

    async fn remove_static_disk(&self, request: StaticDiskRequest) -> RequestResponse {
        let removed = {
            let mut disks = self.static_disks.lock().unwrap_or_else(|e| e.into_inner());
            let uuid = disks
                .iter()
                .find(|(_, path)| **path == request.path)
                .map(|(uuid, _)| uuid.clone());
            uuid.and_then(|uuid| disks.remove(&uuid).map(|_| uuid))
        };

        match removed {
            Some(uuid) => {
                info!("Static disk {} unmounted ({})", uuid, request.path.display());
                self.update_state().await;
                RequestResponse::ok(&request)
            }
            None => RequestResponse::fail(
                &request,
                format!("{} is not mounted as a static disk.", request.path.display()),
            ),
        }
    }

    async fn remove_all_static_disks(&self, request: RequestHeader) -> RequestResponse {
        let removed = std::mem::take(&mut *self.static_disks.lock().unwrap_or_else(|e| e.into_inner()));
        if removed.is_empty() {
            return RequestResponse::ok_with(&request, "There are no static disks to remove.");
        }

        for (uuid, path) in &removed {
            info!("Static disk {} unmounted ({})", uuid, path.display());
        }
        self.update_state().await;
        RequestResponse::ok_with(&request, "Successfully removed all static disks.")
    }
}

fn stopping(request: &impl crate::ipc::ManagerRequest) -> RequestResponse {
    RequestResponse::fail(request, "astdiskd is stopping")
}

#[async_trait]
impl StateManager for DiskManager {
    type Status = DiskManagerMessage;

    fn state(&self) -> &ManagerState<DiskManagerMessage> {
        &self.state
    }

    fn offline_status(&self) -> DiskManagerMessage {
        DiskManagerMessage {
            manager: ManagerMessage::stopped(),
            disks: BTreeMap::new(),
        }
    }

    async fn init(self: Arc<Self>) -> anyhow::Result<()> {
        let this: Weak<Self> = Arc::downgrade(&self);
        self.state
            .register_request("add_static_disk", move |request: StaticDiskRequest| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.add_static_disk(request).await,
                        None => stopping(&request),
                    }
                }
            })
            .await?;

        let this = Arc::downgrade(&self);
        self.state
            .register_request("remove_static_disk", move |request: StaticDiskRequest| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.remove_static_disk(request).await,
                        None => stopping(&request),
                    }
                }
            })
            .await?;

        let this = Arc::downgrade(&self);
        self.state
            .register_request("remove_all_static_disks", move |request: RequestHeader| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.remove_all_static_disks(request).await,
                        None => stopping(&request),
                    }
                }
            })
            .await?;

        Ok(())
    }

    async fn main(self: Arc<Self>) -> anyhow::Result<()> {
        *self.mounted.lock().unwrap_or_else(|e| e.into_inner()) = self.provider.scan();
        self.update_state().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.state.wait_loop() => break,
                _ = ticker.tick() => {
                    let snapshot = self.provider.scan();
                    let changed = *self.mounted.lock().unwrap_or_else(|e| e.into_inner()) != snapshot;
                    if changed && !self.settle_and_rescan().await {
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}
