//! Documents exchanged over the bus: status messages, requests, responses and broadcast events.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::disks::{DiskInfo, DiskUuid};
use crate::metadata::Metadata;
use crate::process::LifecycleStatus;

pub const ASTORIA_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerStatus {
    Stopped,
    Running,
}

impl ManagerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ManagerStatus::Running)
    }
}

/// Fields shared by every daemon's status document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManagerMessage {
    pub status: ManagerStatus,
    pub astoria_version: String,
}

impl ManagerMessage {
    pub fn running() -> Self {
        Self {
            status: ManagerStatus::Running,
            astoria_version: ASTORIA_VERSION.to_string(),
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: ManagerStatus::Stopped,
            astoria_version: ASTORIA_VERSION.to_string(),
        }
    }
}

/// The only part of a status document dependents look at.
#[derive(Deserialize, Debug)]
pub struct StatusHeader {
    pub status: ManagerStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiskManagerMessage {
    #[serde(flatten)]
    pub manager: ManagerMessage,
    pub disks: BTreeMap<DiskUuid, PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetadataManagerMessage {
    #[serde(flatten)]
    pub manager: ManagerMessage,
    pub metadata: Metadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessManagerMessage {
    #[serde(flatten)]
    pub manager: ManagerMessage,
    pub code_status: Option<LifecycleStatus>,
    pub disk_info: Option<DiskInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateInfo {
    pub bundle_filename: String,
    pub status: LifecycleStatus,
    pub disk_info: DiskInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateManagerMessage {
    #[serde(flatten)]
    pub manager: ManagerMessage,
    pub update: Option<UpdateInfo>,
}

/// Correlation fields carried by every request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub uuid: Uuid,
    pub sender_name: String,
}

impl RequestHeader {
    pub fn new(sender_name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            sender_name: sender_name.into(),
        }
    }
}

pub trait ManagerRequest: Serialize + DeserializeOwned + Send + 'static {
    fn header(&self) -> &RequestHeader;

    fn uuid(&self) -> Uuid {
        self.header().uuid
    }
}

impl ManagerRequest for RequestHeader {
    fn header(&self) -> &RequestHeader {
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MetadataSetRequest {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub attr: String,
    /// Empty clears the override
    pub value: String,
}

impl ManagerRequest for MetadataSetRequest {
    fn header(&self) -> &RequestHeader {
        &self.header
    }
}

/// Body of `add_static_disk` and `remove_static_disk`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StaticDiskRequest {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub path: PathBuf,
}

impl ManagerRequest for StaticDiskRequest {
    fn header(&self) -> &RequestHeader {
        &self.header
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestResponse {
    pub uuid: Uuid,
    pub success: bool,
    #[serde(default)]
    pub reason: String,
}

impl RequestResponse {
    pub fn ok(request: &impl ManagerRequest) -> Self {
        Self::ok_with(request, "")
    }

    pub fn ok_with(request: &impl ManagerRequest, reason: impl Into<String>) -> Self {
        Self {
            uuid: request.uuid(),
            success: true,
            reason: reason.into(),
        }
    }

    pub fn fail(request: &impl ManagerRequest, reason: impl Into<String>) -> Self {
        Self {
            uuid: request.uuid(),
            success: false,
            reason: reason.into(),
        }
    }
}

pub trait BroadcastEvent: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    fn header(&self) -> &EventHeader;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub event_name: String,
    pub sender_name: String,
    /// Lower is delivered first
    pub priority: i64,
}

impl EventHeader {
    pub fn new<E: BroadcastEvent>(sender_name: impl Into<String>, priority: i64) -> Self {
        Self {
            event_name: E::NAME.to_string(),
            sender_name: sender_name.into(),
            priority,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Astoria,
    Stdout,
    Stderr,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UsercodeLogEvent {
    #[serde(flatten)]
    pub header: EventHeader,
    pub pid: Option<u32>,
    pub content: String,
    pub source: LogSource,
}

impl BroadcastEvent for UsercodeLogEvent {
    const NAME: &'static str = "usercode_log";

    fn header(&self) -> &EventHeader {
        &self.header
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StartButtonEvent {
    #[serde(flatten)]
    pub header: EventHeader,
}

impl BroadcastEvent for StartButtonEvent {
    const NAME: &'static str = "start_button";

    fn header(&self) -> &EventHeader {
        &self.header
    }
}
