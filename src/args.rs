use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "astoria")]
#[command(version)]
#[command(about = "Robot management daemons and control tool", long_about = None)]
pub(crate) struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file to use instead of the default search path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the message broker
    Broker,

    /// Run the disk manager
    Astdiskd,

    /// Run the metadata manager
    Astmetad,

    /// Run the usercode process manager
    Astprocd,

    /// Run the update manager
    Astupdated,

    /// Talk to running daemons
    Ctl {
        #[command(subcommand)]
        command: CtlCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum CtlCommands {
    /// Inspect or change robot metadata
    Metadata {
        #[command(subcommand)]
        command: MetadataCommands,
    },

    /// Control the running usercode
    Usercode {
        #[command(subcommand)]
        command: UsercodeCommands,
    },

    /// Manage disks known to astdiskd
    Disks {
        #[command(subcommand)]
        command: DiskCommands,
    },

    /// Press the virtual start button
    Start,
}

#[derive(Subcommand)]
pub(crate) enum MetadataCommands {
    /// Print the current metadata
    Show,

    /// Set a mutable attribute; an empty value clears it
    Set {
        /// Attribute name (e.g., arena, zone, mode)
        attr: String,

        /// New value
        #[arg(default_value = "")]
        value: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum UsercodeCommands {
    /// Stop the running code
    Kill,

    /// Run the code again after it has exited
    Restart,

    /// Stream the usercode log
    Log,
}

#[derive(Subcommand)]
pub(crate) enum DiskCommands {
    /// List mounted and static disks
    List,

    /// Register a directory as a static disk
    Add {
        /// Directory to treat as a disk
        path: PathBuf,
    },

    /// Remove a static disk
    Remove {
        /// Directory previously added
        path: PathBuf,
    },

    /// Remove every static disk
    RemoveAll,
}
