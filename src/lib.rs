pub mod bus;
pub mod config;
pub mod daemons;
pub mod disks;
pub mod env;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod process;
pub mod update;
pub mod usercode;

pub use error::{AstoriaError, BusError, Result};
