pub mod classifier;
pub mod differ;
pub mod types;

pub use classifier::{Constraint, DiskTypeCalculator};
pub use differ::{DiskChanges, DiskDiffer, DiskHandler, DiskTracker};
pub use types::{DiskInfo, DiskType, DiskUuid};
