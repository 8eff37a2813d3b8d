//! Stage two: entry program of the composed root.

use clap::Parser;
use guestboot_guest::clock::{self, RealtimeClock, SyncOutcome};
use guestboot_guest::config::{BootConfig, DEFAULT_CONFIG_PATH};
use guestboot_guest::container;
use guestboot_guest::logging;
use guestboot_guest::logsink::LogSink;
use guestboot_guest::net::{self, LeaseOrigin, SysInterfaces, Udhcpc};
use guestboot_guest::pipeline::{Pipeline, StepOutcome};
use guestboot_guest::pseudofs;
use guestboot_guest::rescue::rescue_shell;
use guestboot_guest::share;
use guestboot_guest::supervisor::Supervisor;
use guestboot_mount::SystemMounter;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "guestboot-stage2")]
#[command(about = "Stage two of the guest boot: bring up services and supervise the agent")]
struct Cli {
    /// Boot configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() {
    let cli = Cli::try_parse().unwrap_or_else(|_| Cli {
        config: PathBuf::from(DEFAULT_CONFIG_PATH),
    });

    let mounter = SystemMounter;
    let runtime = pseudofs::mount_runtime(&mounter, Path::new("/"));

    let loaded = BootConfig::load(&cli.config);
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let sink = LogSink::select(&config.logs.stage2_primary, &config.logs.stage2_fallback);
    logging::init(sink.open().ok().flatten());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), log = ?sink.target(), "guestboot stage two");
    if let Err(e) = &loaded {
        tracing::warn!("Ignoring configuration at {:?}: {}", cli.config, e);
    }

    let result = Pipeline::new("stage2")
        .step("pseudofs", move || StepOutcome::recoverable_on(runtime))
        .step("hostname", || {
            StepOutcome::recoverable_on(nix::unistd::sethostname(&config.hostname).map_err(Into::into))
        })
        .step("shares", || {
            StepOutcome::recoverable_on(share::mount_extra_shares(&mounter, &config.shares))
        })
        .step("network", || {
            let client = Udhcpc::new(&config.network);
            let lease = net::bring_up(&config.network, &client, &SysInterfaces);
            match lease.origin {
                LeaseOrigin::Dynamic => StepOutcome::Ok,
                LeaseOrigin::Static => StepOutcome::Recoverable(format!(
                    "static fallback {} on {}",
                    lease.address, lease.interface
                )),
            }
        })
        .step("clock", || {
            match clock::sync_once(&config.clock.endpoints, config.clock.timeout(), &RealtimeClock) {
                SyncOutcome::Synced { .. } => StepOutcome::Ok,
                SyncOutcome::Failed => StepOutcome::Recoverable("no endpoint answered".to_string()),
            }
        })
        .step("containers", || {
            StepOutcome::recoverable_on(container::prepare_container_runtime(&mounter, &config.containers))
        })
        .run();

    match result {
        Ok(report) if report.degraded.is_empty() => tracing::info!("stage two complete"),
        Ok(report) => {
            let steps: Vec<&str> = report.degraded.iter().map(|(step, _)| step.as_str()).collect();
            tracing::warn!(degraded = ?steps, "stage two complete with degraded steps");
        }
        Err(e) => rescue_shell(&e),
    }

    let agent_sink = LogSink::select(&config.agent.log_primary, &config.agent.log_fallback);
    Supervisor::new(&config.agent, agent_sink)
        .reap_orphans(std::process::id() == 1)
        .supervise()
}
