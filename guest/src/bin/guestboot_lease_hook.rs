//! Lease event handler invoked by the DHCP client.
//!
//! The client passes the event name as the first argument and the lease
//! details in the environment.

use clap::Parser;
use guestboot_guest::config::{BootConfig, DEFAULT_CONFIG_PATH};
use guestboot_guest::logging;
use guestboot_guest::net::{self, LeaseEvent, SysInterfaces};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "guestboot-lease-hook")]
#[command(about = "Apply DHCP lease events to the guest network configuration")]
struct Cli {
    /// Boot configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Lease event (bound, renew, deconfig, ...)
    event: String,
}

fn main() -> ExitCode {
    logging::init(None);
    let cli = Cli::parse();
    let config = BootConfig::load_or_default(&cli.config);

    let event = match LeaseEvent::from_env(&cli.event, |key| std::env::var(key).ok()) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(event = %cli.event, "malformed lease event: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match net::handle_lease_event(event, &config.network, &SysInterfaces) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(event = %cli.event, "applying lease event failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
