use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::classifier::DiskTypeCalculator;
use super::types::{DiskInfo, DiskUuid};
use crate::ipc::DiskManagerMessage;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiskChanges {
    pub added: Vec<DiskInfo>,
    pub removed: Vec<DiskInfo>,
}

impl DiskChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Turns successive disk snapshots into insertion and removal events.
///
/// Disks are compared by uuid only.
#[derive(Debug, Default)]
pub struct DiskDiffer {
    current: HashMap<DiskUuid, DiskInfo>,
}

impl DiskDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, snapshot: HashMap<DiskUuid, DiskInfo>) -> DiskChanges {
        let mut changes = DiskChanges::default();

        for (uuid, info) in &snapshot {
            if !self.current.contains_key(uuid) {
                changes.added.push(info.clone());
            }
        }
        for (uuid, info) in &self.current {
            if !snapshot.contains_key(uuid) {
                changes.removed.push(info.clone());
            }
        }

        self.current = snapshot;
        changes
    }

    /// Forget every disk, reporting them all as removed.
    pub fn drain(&mut self) -> Vec<DiskInfo> {
        self.current.drain().map(|(_, info)| info).collect()
    }

    pub fn disks(&self) -> impl Iterator<Item = &DiskInfo> {
        self.current.values()
    }
}

/// Classify each disk of a published snapshot.
pub fn classify(
    disks: &BTreeMap<DiskUuid, PathBuf>,
    calculator: &DiskTypeCalculator,
) -> HashMap<DiskUuid, DiskInfo> {
    disks
        .iter()
        .map(|(uuid, path)| {
            let info = DiskInfo {
                uuid: uuid.clone(),
                mount_path: path.clone(),
                disk_type: calculator.calculate(path),
            };
            (uuid.clone(), info)
        })
        .collect()
}

#[async_trait]
pub trait DiskHandler: Send + Sync + 'static {
    async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo);

    async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo);
}

/// Feeds `astdiskd` status documents through a differ into a [`DiskHandler`].
pub struct DiskTracker {
    differ: Mutex<DiskDiffer>,
    calculator: DiskTypeCalculator,
}

impl DiskTracker {
    pub fn new(calculator: DiskTypeCalculator) -> Self {
        Self {
            differ: Mutex::new(DiskDiffer::new()),
            calculator,
        }
    }

    /// Decode a status payload, then dispatch its removals and insertions.
    ///
    /// Removals are awaited in turn before any insertion starts, so a disk swapped
    /// within one snapshot finds its predecessor already gone. Insertions are
    /// spawned since their handlers may run for as long as the disk is present.
    /// The differ stays locked until every removal has finished.
    pub async fn handle_message<H: DiskHandler>(&self, payload: &str, handler: &Arc<H>) {
        let message: DiskManagerMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Received bad disk manager message: {}", e);
                return;
            }
        };

        let snapshot = classify(&message.disks, &self.calculator);
        let mut differ = self.differ.lock().await;
        let changes = differ.update(snapshot);
        if changes.is_empty() {
            return;
        }
        debug!(
            "{} disk(s) inserted, {} removed",
            changes.added.len(),
            changes.removed.len()
        );

        for disk in changes.removed {
            Arc::clone(handler).handle_disk_removal(disk).await;
        }
        drop(differ);

        for disk in changes.added {
            tokio::spawn(Arc::clone(handler).handle_disk_insertion(disk));
        }
    }

    /// Report every known disk as removed, awaiting each handler in turn.
    pub async fn remove_all<H: DiskHandler>(&self, handler: &Arc<H>) {
        let disks = self.differ.lock().await.drain();
        for disk in disks {
            Arc::clone(handler).handle_disk_removal(disk).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::DiskType;
    use crate::ipc::ManagerMessage;
    use std::time::Duration;

    fn info(id: &str) -> DiskInfo {
        DiskInfo {
            uuid: DiskUuid::new(id),
            mount_path: PathBuf::from(format!("/media/{}", id)),
            disk_type: DiskType::NoAction,
        }
    }

    fn snapshot(ids: &[&str]) -> HashMap<DiskUuid, DiskInfo> {
        ids.iter().map(|id| (DiskUuid::new(*id), info(id))).collect()
    }

    #[test]
    fn test_insertion_and_removal() {
        let mut differ = DiskDiffer::new();

        let changes = differ.update(snapshot(&["a", "b"]));
        assert_eq!(changes.added.len(), 2);
        assert!(changes.removed.is_empty());

        let changes = differ.update(snapshot(&["b", "c"]));
        assert_eq!(changes.added, vec![info("c")]);
        assert_eq!(changes.removed, vec![info("a")]);
    }

    #[test]
    fn test_identical_snapshot_yields_nothing() {
        let mut differ = DiskDiffer::new();
        differ.update(snapshot(&["a"]));
        assert!(differ.update(snapshot(&["a"])).is_empty());
    }

    #[test]
    fn test_drain_reports_all() {
        let mut differ = DiskDiffer::new();
        differ.update(snapshot(&["a", "b"]));
        assert_eq!(differ.drain().len(), 2);
        assert_eq!(differ.disks().count(), 0);
    }

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiskHandler for Recorder {
        async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo) {
            self.events.lock().unwrap().push(format!("+{}", disk.uuid));
        }

        async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo) {
            self.events.lock().unwrap().push(format!("-{}", disk.uuid));
        }
    }

    #[tokio::test]
    async fn test_tracker_dispatches_each_change_once() {
        let tracker = DiskTracker::new(DiskTypeCalculator::default());
        let recorder = Arc::new(Recorder::default());

        let message = |ids: &[&str]| {
            serde_json::to_string(&DiskManagerMessage {
                manager: ManagerMessage::running(),
                disks: ids
                    .iter()
                    .map(|id| (DiskUuid::new(*id), PathBuf::from(format!("/media/{}", id))))
                    .collect(),
            })
            .unwrap()
        };

        tracker.handle_message(&message(&["a"]), &recorder).await;
        tracker.handle_message(&message(&["a"]), &recorder).await;
        tracker.handle_message(&message(&[]), &recorder).await;
        tracker.handle_message("garbage", &recorder).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*recorder.events.lock().unwrap(), vec!["+a", "-a"]);
    }

    /// Records whether the previous disk was still held when a new one arrived.
    #[derive(Default)]
    struct SingleSlot {
        held: std::sync::Mutex<Option<DiskUuid>>,
        rejected: std::sync::Mutex<Vec<DiskUuid>>,
    }

    #[async_trait]
    impl DiskHandler for SingleSlot {
        async fn handle_disk_insertion(self: Arc<Self>, disk: DiskInfo) {
            let mut held = self.held.lock().unwrap();
            if held.is_some() {
                self.rejected.lock().unwrap().push(disk.uuid);
            } else {
                *held = Some(disk.uuid);
            }
        }

        async fn handle_disk_removal(self: Arc<Self>, disk: DiskInfo) {
            // Removal takes a while, as killing a process would.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut held = self.held.lock().unwrap();
            if held.as_ref() == Some(&disk.uuid) {
                *held = None;
            }
        }
    }

    #[tokio::test]
    async fn test_swap_in_one_snapshot_removes_before_inserting() {
        let tracker = DiskTracker::new(DiskTypeCalculator::default());
        let slot = Arc::new(SingleSlot::default());

        let message = |id: &str| {
            serde_json::to_string(&DiskManagerMessage {
                manager: ManagerMessage::running(),
                disks: [(DiskUuid::new(id), PathBuf::from(format!("/media/{}", id)))]
                    .into_iter()
                    .collect(),
            })
            .unwrap()
        };

        tracker.handle_message(&message("first"), &slot).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.handle_message(&message("second"), &slot).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(slot.rejected.lock().unwrap().is_empty());
        assert_eq!(*slot.held.lock().unwrap(), Some(DiskUuid::new("second")));
    }
}
