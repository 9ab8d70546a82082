use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a mounted disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DiskUuid(String);

impl DiskUuid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of a disk, derived from its contents.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskType {
    #[serde(rename = "USERCODE")]
    Usercode,
    #[serde(rename = "METADATA")]
    Metadata,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "NONE")]
    NoAction,
}

impl DiskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Usercode => "usercode",
            DiskType::Metadata => "metadata",
            DiskType::Update => "update",
            DiskType::NoAction => "no action",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub uuid: DiskUuid,
    pub mount_path: PathBuf,
    pub disk_type: DiskType,
}
