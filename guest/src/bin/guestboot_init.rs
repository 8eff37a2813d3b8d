//! Stage one: PID 1 in the initramfs.

use clap::Parser;
use guestboot_guest::BootError;
use guestboot_guest::assets::{self, AssetPaths, BootCmdline};
use guestboot_guest::config::{BootConfig, DEFAULT_CONFIG_PATH};
use guestboot_guest::logging;
use guestboot_guest::logsink::LogSink;
use guestboot_guest::modules::{self, KernelModules, ModuleLoader};
use guestboot_guest::pipeline::{Pipeline, StepOutcome};
use guestboot_guest::pseudofs;
use guestboot_guest::rescue::rescue_shell;
use guestboot_guest::retry::poll_until;
use guestboot_guest::rootfs::{RootComposer, RootLayout};
use guestboot_guest::share;
use guestboot_guest::switch::Handoff;
use guestboot_mount::SystemMounter;
use std::cell::RefCell;
use std::convert::Infallible;
use std::path::{Path, PathBuf};

const LOOP_CONTROL: &str = "/dev/loop-control";

#[derive(Parser)]
#[command(name = "guestboot-init")]
#[command(about = "Stage one of the guest boot: compose the root and hand off")]
struct Cli {
    /// Boot configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() {
    // The kernel may pass arguments meant for someone else; never fail on them.
    let cli = Cli::try_parse().unwrap_or_else(|_| Cli {
        config: PathBuf::from(DEFAULT_CONFIG_PATH),
    });

    let err = match run(&cli) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    rescue_shell(&err)
}

fn run(cli: &Cli) -> Result<Infallible, BootError> {
    let mounter = SystemMounter;
    let early = pseudofs::mount_early(&mounter, Path::new("/"));

    let loaded = BootConfig::load(&cli.config);
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let sink = LogSink::file_or_console(&config.logs.init);
    logging::init(sink.open().ok().flatten());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "guestboot stage one");

    early?;
    if let Err(e) = &loaded {
        tracing::warn!("Ignoring configuration at {:?}: {}", cli.config, e);
    }

    let cmdline = BootCmdline::read()?;
    if cmdline.flag(&config.rescue_key()) {
        return Err(BootError::RescueRequested);
    }

    let release = modules::kernel_release()?;
    let located: RefCell<Option<AssetPaths>> = RefCell::new(None);

    Pipeline::new("stage1")
        .step("modules", || {
            let loader = ModuleLoader::new(KernelModules::default(), modules::module_tree_root(&release));
            let summary = loader.activate_all(&config.modules);
            if summary.skipped.is_empty() {
                StepOutcome::Ok
            } else {
                StepOutcome::Recoverable(format!("not loaded: {}", summary.skipped.join(", ")))
            }
        })
        .step("share", || {
            StepOutcome::fatal_on(share::wait_for_share(
                &mounter,
                &config.share.tag,
                &config.share.mountpoint,
                config.share.wait_attempts,
                config.share.wait_interval(),
            ))
        })
        .step("assets", || match assets::locate(&cmdline, &config) {
            Ok(paths) => {
                *located.borrow_mut() = Some(paths);
                StepOutcome::Ok
            }
            Err(e) => StepOutcome::Fatal(e),
        })
        .step("compose", || {
            let Some(paths) = located.borrow().clone() else {
                return StepOutcome::Fatal(BootError::Compose("no boot assets".to_string()));
            };
            let loop_ready = poll_until(
                || Path::new(LOOP_CONTROL).exists(),
                config.share.wait_attempts,
                config.share.wait_interval(),
            );
            if !loop_ready.is_found() {
                return StepOutcome::Fatal(BootError::Compose(format!("{} never appeared", LOOP_CONTROL)));
            }
            let layout = RootLayout::new(&config.root.scratch, &config.root.staging);
            let composer = RootComposer::new(&mounter, layout, &config.root.image_fstype)
                .with_tmpfs_size(config.root.overlay_tmpfs_size.clone());
            StepOutcome::fatal_on(composer.compose(&paths.root_image))
        })
        .run()?;

    let paths = located
        .into_inner()
        .ok_or_else(|| BootError::Handoff("boot assets were not located".to_string()))?;

    Handoff::new(&mounter, &config.root.staging, &config.root.stage2_init)
        .relocate(&config.share.mountpoint)
        .handoff(
            &paths.module_archive,
            &config.root.module_archive_fstype,
            &release,
        )
}
