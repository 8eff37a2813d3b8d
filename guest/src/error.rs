use guestboot_mount::MountError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("boot parameter {0} not found on the kernel command line")]
    MissingBootToken(String),

    #[error("invalid boot asset version: {0:?}")]
    InvalidAssetVersion(String),

    #[error("boot asset not found: {0:?}")]
    AssetMissing(PathBuf),

    #[error("external share unavailable: {0}")]
    ShareUnavailable(String),

    #[error("module {name} failed to load: {reason}")]
    ModuleLoad { name: String, reason: String },

    #[error("root composition failed: {0}")]
    Compose(String),

    #[error("hand-off failed: {0}")]
    Handoff(String),

    #[error("network configuration failed: {0}")]
    Network(String),

    #[error("no lease obtained on {0}")]
    NoLease(String),

    #[error("clock sync failed: {0}")]
    Clock(String),

    #[error("{step} degraded: {}", problems.join("; "))]
    Degraded { step: String, problems: Vec<String> },

    #[error("agent error: {0}")]
    Agent(String),

    #[error("rescue shell requested on the kernel command line")]
    RescueRequested,

    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<BootError>,
    },

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
