//! fleetctl: operator CLI for the device lifecycle store.
//!
//! Every command runs one lifecycle operation against the SQLite store and
//! prints a JSON envelope on stdout. Logs go to stderr.
//!
//! ## Subcommands
//!
//! - `namespace`: create, show, audit counters, delete
//! - `device`: register, list, show, accept, reject, pend, update, delete

mod commands;
mod logging;
mod output;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use fleet_core::DeviceStatus;
use output::Response;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Device lifecycle administration")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.fleet/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Database file, overriding the configured store path
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Namespace administration
    #[command(subcommand)]
    Namespace(NamespaceCommand),

    /// Device lifecycle operations
    #[command(subcommand)]
    Device(DeviceCommand),
}

#[derive(Subcommand)]
pub enum NamespaceCommand {
    /// Create a namespace with zeroed counters
    Create {
        tenant: String,

        #[arg(long)]
        name: String,

        /// Accepted device ceiling; zero or negative means unlimited
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        max_devices: i64,
    },

    /// Show a namespace and its counters
    Show { tenant: String },

    /// Compare counters with the stored device records
    Audit { tenant: String },

    /// Delete a namespace with all its devices
    Delete { tenant: String },
}

#[derive(Args)]
pub struct DeviceRef {
    pub tenant: String,
    pub uid: String,
}

#[derive(Subcommand)]
pub enum DeviceCommand {
    /// Register a new pending device
    Register {
        tenant: String,
        hostname: String,
        /// Hardware identity, e.g. a MAC address
        identity: String,
    },

    /// List devices, optionally filtered by status
    List {
        tenant: String,

        #[arg(long, value_parser = parse_status)]
        status: Option<DeviceStatus>,
    },

    /// Show one device
    Show(DeviceRef),

    /// Admit a pending or rejected device
    Accept(DeviceRef),

    /// Reject a pending device
    Reject(DeviceRef),

    /// Move a rejected device back to pending
    Pend(DeviceRef),

    /// Rename a device or toggle its public URL
    Update {
        #[command(flatten)]
        device: DeviceRef,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        public_url: Option<bool>,
    },

    /// Delete a device (accepted devices are kept as tombstones)
    Delete(DeviceRef),
}

fn parse_status(value: &str) -> Result<DeviceStatus, String> {
    DeviceStatus::from_str(&value.to_lowercase())
        .ok_or_else(|| format!("unknown status {:?}", value))
}

fn main() {
    let cli = Cli::parse();

    let config = match fleet_core::load_config(cli.config) {
        Ok(config) => config,
        Err(err) => {
            Response::error(err.kind().as_str(), err.to_string()).print();
            std::process::exit(2);
        }
    };
    let _logging_guard = logging::init(config.logging.dir.as_deref());

    let db_path = match cli.db {
        Some(path) => path,
        None => match config.db_path() {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(error = %err, "Failed to resolve database path");
                Response::error(err.kind().as_str(), err.to_string()).print();
                std::process::exit(2);
            }
        },
    };

    match commands::run(cli.command, &config, db_path) {
        Ok(data) => Response::ok(data).print(),
        Err(err) => {
            tracing::error!(error = %err, "fleetctl command failed");
            Response::error(err.code(), err.to_string()).print();
            std::process::exit(1);
        }
    }
}
