//! Metadata manager: merges defaults, cached values, requests and disk contents.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{handler, BusConfig, Transport};
use crate::disks::{DiskHandler, DiskInfo, DiskTracker, DiskType, DiskTypeCalculator};
use crate::error::BusError;
use crate::ipc::{ManagerMessage, MetadataManagerMessage, MetadataSetRequest, RequestResponse};
use crate::manager::{ManagerState, StateManager};
use crate::metadata::cache::{MetadataCache, CACHE_FILENAME};
use crate::metadata::fields::{MetadataField, CACHED, REQUEST_MUTABLE};
use crate::metadata::merge::{compute_metadata, OverrideSource};
use crate::metadata::sources::DiskOverrides;
use crate::metadata::{Metadata, SystemInfo};

pub const NAME: &str = "astmetad";

/// Disk roles that contribute metadata, lowest precedence first.
const DISK_SOURCE_ORDER: [DiskType; 2] = [DiskType::Usercode, DiskType::Metadata];

pub struct MetadataManager {
    state: ManagerState<MetadataManagerMessage>,
    tracker: DiskTracker,
    system: SystemInfo,
    default_entrypoint: String,
    cache: Mutex<MetadataCache>,
    requested: Mutex<BTreeMap<String, String>>,
    disks: Mutex<HashMap<DiskType, DiskOverrides>>,
}

impl MetadataManager {
    pub fn new(
        system: SystemInfo,
        default_entrypoint: impl Into<String>,
        cache_dir: &Path,
        bus: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        let default_entrypoint = default_entrypoint.into();
        let offline = MetadataManagerMessage {
            manager: ManagerMessage::stopped(),
            metadata: Metadata::new(&system, &default_entrypoint),
        };
        Ok(Arc::new(Self {
            state: ManagerState::new(NAME, &[super::astdiskd::NAME], &offline, bus, transport)?,
            tracker: DiskTracker::new(DiskTypeCalculator::default()),
            cache: Mutex::new(MetadataCache::load(cache_dir.join(CACHE_FILENAME), CACHED)),
            requested: Mutex::new(BTreeMap::new()),
            disks: Mutex::new(HashMap::new()),
            system,
            default_entrypoint,
        }))
    }

    fn defaults(&self) -> Metadata {
        Metadata::new(&self.system, &self.default_entrypoint)
    }

    /// Merge every source in precedence order.
    pub fn compute(&self) -> Metadata {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let requested = self.requested.lock().unwrap_or_else(|e| e.into_inner());
        let disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());

        let mut sources = vec![
            OverrideSource::new("cache", CACHED, cache.data()),
            OverrideSource::new("request", REQUEST_MUTABLE, &requested),
        ];
        sources.extend(
            DISK_SOURCE_ORDER
                .iter()
                .filter_map(|role| disks.get(role))
                .map(|o| OverrideSource::new(o.source_name, o.permitted, &o.diff)),
        );

        compute_metadata(self.defaults(), &sources)
    }

    async fn update_status(&self) {
        let metadata = self.compute();

        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            for field in CACHED {
                if let Err(e) = cache.update_cached_attr(*field, metadata.get(*field)) {
                    warn!("{}", e);
                }
            }
        }

        let status = MetadataManagerMessage {
            manager: ManagerMessage::running(),
            metadata,
        };
        if let Err(e) = self.state.set_status(status).await {
            warn!("Unable to publish metadata: {}", e);
        }
    }

    async fn handle_mutation(&self, request: MetadataSetRequest) -> RequestResponse {
        let field = match request.attr.parse::<MetadataField>() {
            Ok(field) if REQUEST_MUTABLE.contains(&field) => field,
            _ => {
                return RequestResponse::fail(
                    &request,
                    format!("{} is not a mutable attribute", request.attr),
                )
            }
        };

        if request.value.is_empty() {
            info!("Clearing {} override", field);
            self.requested
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(field.as_str());
        } else {
            if let Err(e) = self.defaults().set(field, &request.value) {
                return RequestResponse::fail(&request, e.to_string());
            }
            info!("Setting {} to {}", field, request.value);
            self.requested
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(field.as_str().to_string(), request.value.clone());
        }

        self.update_status().await;
        RequestResponse::ok(&request)
    }
}

#[async_trait]
impl DiskHandler for MetadataManager {
    async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo) {
        let role = disk.disk_type;
        if !DISK_SOURCE_ORDER.contains(&role) {
            return;
        }

        {
            let mut disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = disks.get(&role) {
                warn!(
                    "Ignoring {} disk {}: {} is already providing {} metadata",
                    role.as_str(),
                    disk.uuid,
                    existing.disk.uuid,
                    role.as_str()
                );
                return;
            }
            let Some(overrides) = DiskOverrides::load(disk) else {
                return;
            };
            info!(
                "Loaded {} from disk {} ({} value(s))",
                overrides.source_name,
                overrides.disk.uuid,
                overrides.diff.len()
            );
            disks.insert(role, overrides);
        }

        self.update_status().await;
    }

    async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo) {
        let removed = {
            let mut disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());
            match disks.get(&disk.disk_type) {
                Some(existing) if existing.disk.uuid == disk.uuid => {
                    disks.remove(&disk.disk_type)
                }
                _ => None,
            }
        };

        if let Some(overrides) = removed {
            debug!("Dropped {} from disk {}", overrides.source_name, disk.uuid);
            self.update_status().await;
        }
    }
}

#[async_trait]
impl StateManager for MetadataManager {
    type Status = MetadataManagerMessage;

    fn state(&self) -> &ManagerState<MetadataManagerMessage> {
        &self.state
    }

    fn offline_status(&self) -> MetadataManagerMessage {
        MetadataManagerMessage {
            manager: ManagerMessage::stopped(),
            metadata: self.defaults(),
        }
    }

    async fn init(self: Arc<Self>) -> anyhow::Result<()> {
        let this = Arc::downgrade(&self);
        self.state
            .register_request("mutate", move |request: MetadataSetRequest| {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(manager) => manager.handle_mutation(request).await,
                        None => RequestResponse::fail(&request, "astmetad is stopping"),
                    }
                }
            })
            .await?;
        Ok(())
    }

    async fn main(self: Arc<Self>) -> anyhow::Result<()> {
        self.update_status().await;

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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, LocalTransport, MessageBus};
    use crate::disks::classifier::METADATA_FILE;
    use crate::disks::DiskUuid;
    use crate::ipc::{DiskManagerMessage, RequestHeader};
    use crate::manager;
    use crate::metadata::settings::SETTINGS_FILENAME;
    use crate::metadata::{test_system, RobotMode};
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        cache_dir: tempfile::TempDir,
        broker: Arc<Broker>,
        manager: Arc<MetadataManager>,
        client: Arc<MessageBus>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn publish_disks(broker: &Broker, disks: &[(&str, &Path)]) {
        let message = DiskManagerMessage {
            manager: ManagerMessage::running(),
            disks: disks
                .iter()
                .map(|(id, path)| (DiskUuid::new(*id), path.to_path_buf()))
                .collect(),
        };
        broker.publish(
            "astoria/astdiskd",
            &serde_json::to_string(&message).unwrap(),
            true,
        );
    }

    async fn start() -> Fixture {
        let cache_dir = tempfile::tempdir().unwrap();
        let broker = Broker::new();
        publish_disks(&broker, &[]);

        let manager = MetadataManager::new(
            test_system(),
            "robot.py",
            cache_dir.path(),
            BusConfig::default(),
            Arc::new(LocalTransport::new(Arc::clone(&broker))),
        )
        .unwrap();
        let task = tokio::spawn(manager::run(Arc::clone(&manager)));

        let client = MessageBus::builder(
            "astctl",
            BusConfig::default(),
            Arc::new(LocalTransport::new(Arc::clone(&broker))),
        )
        .dependencies([NAME])
        .build()
        .unwrap();
        client.connect().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), client.wait_dependencies())
            .await
            .unwrap();

        Fixture {
            cache_dir,
            broker,
            manager,
            client,
            task,
        }
    }

    async fn published(f: &Fixture, check: impl Fn(&Metadata) -> bool) -> Metadata {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(status) = f.manager.state().status() {
                    if check(&status.metadata) {
                        return status.metadata;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    fn mutate(attr: &str, value: &str) -> MetadataSetRequest {
        MetadataSetRequest {
            header: RequestHeader::new("astctl"),
            attr: attr.to_string(),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mutation_and_disk_precedence() {
        let f = start().await;

        f.client
            .manager_request(NAME, "mutate", &mutate("arena", "B"))
            .await
            .unwrap();
        assert_eq!(f.manager.compute().arena, "B");

        let disk = tempfile::tempdir().unwrap();
        std::fs::write(
            disk.path().join(METADATA_FILE),
            r#"{"arena": "C", "mode": "COMP"}"#,
        )
        .unwrap();
        publish_disks(&f.broker, &[("meta", disk.path())]);
        let metadata = published(&f, |m| m.arena == "C").await;
        assert_eq!(metadata.mode, RobotMode::Competition);

        publish_disks(&f.broker, &[]);
        let metadata = published(&f, |m| m.arena == "B").await;
        assert_eq!(metadata.mode, RobotMode::Development);

        f.client
            .manager_request(NAME, "mutate", &mutate("arena", ""))
            .await
            .unwrap();
        assert_eq!(f.manager.compute().arena, "A");

        f.manager.state().halt();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disallowed_mutation_rejected() {
        let f = start().await;
        let before = f.manager.compute();

        for (attr, value) in [("usercode_entrypoint", "evil.py"), ("kernel_version", "x")] {
            let result = f.client.manager_request(NAME, "mutate", &mutate(attr, value)).await;
            assert!(
                matches!(&result, Err(BusError::RequestFailed(reason)) if *reason == format!("{} is not a mutable attribute", attr))
            );
        }

        let result = f.client.manager_request(NAME, "mutate", &mutate("zone", "-3")).await;
        assert!(matches!(result, Err(BusError::RequestFailed(_))));
        assert_eq!(f.manager.compute(), before);

        f.manager.state().halt();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_usercode_settings_cached() {
        let f = start().await;

        let disk = tempfile::tempdir().unwrap();
        std::fs::write(
            disk.path().join(SETTINGS_FILENAME),
            "team_tla = \"ABC\"\nusercode_entrypoint = \"main.py\"\nwifi_psk = \"secret\"\n",
        )
        .unwrap();
        std::fs::write(disk.path().join("robot.zip"), "").unwrap();
        publish_disks(&f.broker, &[("code", disk.path())]);

        let metadata = published(&f, |m| m.usercode_entrypoint == "main.py").await;
        assert_eq!(metadata.wifi_ssid.as_deref(), Some("robot-ABC"));

        publish_disks(&f.broker, &[]);
        let metadata = published(&f, |m| m.usercode_entrypoint == "robot.py").await;
        assert_eq!(metadata.wifi_ssid.as_deref(), Some("robot-ABC"));
        assert_eq!(metadata.wifi_psk.as_deref(), Some("secret"));

        let cache: PathBuf = f.cache_dir.path().join(CACHE_FILENAME);
        let cached = std::fs::read_to_string(cache).unwrap();
        assert!(cached.contains("robot-ABC"));

        f.manager.state().halt();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_disk_of_role_ignored() {
        let f = start().await;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join(METADATA_FILE), r#"{"zone": 1}"#).unwrap();
        std::fs::write(second.path().join(METADATA_FILE), r#"{"zone": 2}"#).unwrap();

        publish_disks(&f.broker, &[("first", first.path())]);
        published(&f, |m| m.zone == 1).await;

        publish_disks(&f.broker, &[("first", first.path()), ("second", second.path())]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.manager.compute().zone, 1);

        f.manager.state().halt();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disk_swap_in_one_snapshot_uses_new_disk() {
        let f = start().await;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join(METADATA_FILE), r#"{"zone": 1}"#).unwrap();
        std::fs::write(second.path().join(METADATA_FILE), r#"{"zone": 2}"#).unwrap();

        publish_disks(&f.broker, &[("first", first.path())]);
        published(&f, |m| m.zone == 1).await;

        publish_disks(&f.broker, &[("second", second.path())]);
        published(&f, |m| m.zone == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.manager.compute().zone, 2);

        f.manager.state().halt();
        f.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_offline_status_is_defaults() {
        let f = start().await;
        f.manager.state().halt();
        f.task.await.unwrap().unwrap();

        let retained = f.broker.retained("astoria/astmetad").unwrap();
        let status: MetadataManagerMessage = serde_json::from_str(&retained).unwrap();
        assert_eq!(status.manager.status, crate::ipc::ManagerStatus::Stopped);
        assert_eq!(status.metadata.arena, "A");
    }
}
