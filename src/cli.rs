use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use keel_api::{config::ExtensionRole, constants};

use crate::KEEL_VERSION;

#[derive(Parser, Debug)]
#[clap(version = KEEL_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Path to save an eventual fatal error
    #[arg(global = true, long)]
    pub error: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install the OS onto a disk
    Install {
        /// The configuration to apply
        #[clap(long, default_value = constants::AGENT_CONFIG_PATH)]
        config: PathBuf,

        /// Target device, overriding the configured one
        #[clap(long)]
        device: Option<PathBuf>,

        /// Install over an existing layout without partitioning
        #[clap(long)]
        no_format: bool,

        /// Proceed even when a deployment is already present
        #[clap(long)]
        force: bool,
    },

    /// Upgrade the active slot (or the recovery image) to a new version
    Upgrade {
        /// The configuration to apply
        #[clap(long, default_value = constants::AGENT_CONFIG_PATH)]
        config: PathBuf,

        /// Upgrade the recovery image instead of the active slot
        #[clap(long)]
        recovery: bool,
    },

    /// Reset the device to factory state
    Reset {
        /// The configuration to apply
        #[clap(long, default_value = constants::AGENT_CONFIG_PATH)]
        config: PathBuf,

        /// Reboot when the reset finished
        #[clap(long)]
        reboot: bool,

        /// Power off when the reset finished
        #[clap(long)]
        poweroff: bool,
    },

    /// List or select boot entries
    Bootentries {
        #[clap(subcommand)]
        command: BootentriesCommands,
    },

    /// Manage system extension images
    Sysext {
        #[clap(subcommand)]
        command: SysextCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum BootentriesCommands {
    /// List the available boot entries
    List,
    /// Select the entry to boot next
    Select { entry: String },
}

#[derive(Subcommand, Debug)]
pub enum SysextCommands {
    /// List installed extensions, optionally for one role
    List {
        #[clap(long)]
        role: Option<ExtensionRole>,
    },
    /// Download an extension image into the installed pool
    Install { uri: String },
    /// Enable an installed extension for a role
    Enable {
        name: String,
        #[clap(long)]
        role: ExtensionRole,
        /// Also merge it into the running system
        #[clap(long)]
        now: bool,
    },
    /// Disable an extension for a role
    Disable {
        name: String,
        #[clap(long)]
        role: ExtensionRole,
        /// Also unmerge it from the running system
        #[clap(long)]
        now: bool,
    },
    /// Disable an extension everywhere and remove it from the pool
    Remove {
        name: String,
        #[clap(long)]
        now: bool,
    },
}
