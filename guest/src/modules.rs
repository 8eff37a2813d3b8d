//! Kernel module activation.
//!
//! Modules are loaded from a fixed table, strictly group by group. Group
//! order is the only dependency resolution performed: bus and transport
//! drivers must be resident before the device, filesystem and protocol
//! drivers that sit on top of them. Within a group the table order is kept
//! as written, since some neighbours depend on each other informally.

use crate::BootError;
use nix::kmod::{ModuleInitFlags, finit_module};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Load-order tier. The derived ordering is the load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleGroup {
    Transport,
    Device,
    Block,
    Filesystem,
    Socket,
    Netfilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    /// Path of the module artifact relative to the module tree root.
    pub relative_path: PathBuf,
    pub group: ModuleGroup,
}

impl ModuleSpec {
    pub fn new(name: &str, relative_path: &str, group: ModuleGroup) -> Self {
        Self {
            name: name.to_string(),
            relative_path: PathBuf::from(relative_path),
            group,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMethod {
    Registry,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Activated(LoadMethod),
    /// Neither method worked; the facility may be built into the kernel.
    Skipped,
}

/// How modules actually get into the kernel.
pub trait ModuleBackend {
    /// Load by name through the module registry, resolving dependencies.
    fn load_by_name(&self, name: &str) -> Result<(), BootError>;

    /// Insert a module artifact directly.
    fn insert(&self, path: &Path) -> Result<(), BootError>;
}

/// Backend using `modprobe` for registry loads and `finit_module(2)` for
/// direct insertion.
#[derive(Debug, Clone)]
pub struct KernelModules {
    modprobe: PathBuf,
}

impl Default for KernelModules {
    fn default() -> Self {
        Self {
            modprobe: PathBuf::from("modprobe"),
        }
    }
}

impl ModuleBackend for KernelModules {
    fn load_by_name(&self, name: &str) -> Result<(), BootError> {
        let output = Command::new(&self.modprobe)
            .arg(name)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BootError::ModuleLoad {
                name: name.to_string(),
                reason: format!("spawn {:?}: {}", self.modprobe, e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BootError::ModuleLoad {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn insert(&self, path: &Path) -> Result<(), BootError> {
        let file = File::open(path)?;
        match finit_module(&file, c"", ModuleInitFlags::empty()) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Result of running the whole table.
#[derive(Debug, Default, Clone)]
pub struct LoadSummary {
    pub activated: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct ModuleLoader<B> {
    backend: B,
    tree_root: PathBuf,
}

impl<B: ModuleBackend> ModuleLoader<B> {
    pub fn new(backend: B, tree_root: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            tree_root: tree_root.into(),
        }
    }

    pub fn tree_root(&self) -> &Path {
        &self.tree_root
    }

    /// Activate a single facility. Never fails: a module that cannot be
    /// loaded either way is reported as skipped.
    pub fn activate(&self, spec: &ModuleSpec) -> Activation {
        let registry_err = match self.backend.load_by_name(&spec.name) {
            Ok(()) => {
                tracing::debug!(module = %spec.name, "loaded via registry");
                return Activation::Activated(LoadMethod::Registry);
            }
            Err(e) => e,
        };

        let path = self.tree_root.join(&spec.relative_path);
        match self.backend.insert(&path) {
            Ok(()) => {
                tracing::debug!(module = %spec.name, path = %path.display(), "inserted directly");
                Activation::Activated(LoadMethod::Direct)
            }
            Err(insert_err) => {
                tracing::warn!(
                    module = %spec.name,
                    "not loaded (registry: {}; direct: {}), assuming built in",
                    registry_err,
                    insert_err
                );
                Activation::Skipped
            }
        }
    }

    /// Activate every entry, group by group, keeping table order within a
    /// group.
    pub fn activate_all(&self, table: &[ModuleSpec]) -> LoadSummary {
        let mut ordered: Vec<&ModuleSpec> = table.iter().collect();
        ordered.sort_by_key(|spec| spec.group);

        let mut summary = LoadSummary::default();
        for spec in ordered {
            match self.activate(spec) {
                Activation::Activated(_) => summary.activated.push(spec.name.clone()),
                Activation::Skipped => summary.skipped.push(spec.name.clone()),
            }
        }

        tracing::info!(
            "Module activation finished: {} activated, {} skipped",
            summary.activated.len(),
            summary.skipped.len()
        );
        summary
    }
}

/// `/lib/modules/<release>`.
pub fn module_tree_root(release: &str) -> PathBuf {
    Path::new("/lib/modules").join(release)
}

pub fn kernel_release() -> Result<String, BootError> {
    let uts = nix::sys::utsname::uname()?;
    Ok(uts.release().to_string_lossy().into_owned())
}

/// The module table for a virtio guest that runs nested containers.
pub fn default_table() -> Vec<ModuleSpec> {
    use ModuleGroup::*;

    vec![
        ModuleSpec::new("virtio", "kernel/drivers/virtio/virtio.ko", Transport),
        ModuleSpec::new("virtio_ring", "kernel/drivers/virtio/virtio_ring.ko", Transport),
        ModuleSpec::new("virtio_pci_modern_dev", "kernel/drivers/virtio/virtio_pci_modern_dev.ko", Transport),
        ModuleSpec::new("virtio_pci", "kernel/drivers/virtio/virtio_pci.ko", Transport),
        ModuleSpec::new("virtio_mmio", "kernel/drivers/virtio/virtio_mmio.ko", Transport),
        ModuleSpec::new("virtio_console", "kernel/drivers/char/virtio_console.ko", Device),
        ModuleSpec::new("failover", "kernel/net/core/failover.ko", Device),
        ModuleSpec::new("net_failover", "kernel/drivers/net/net_failover.ko", Device),
        ModuleSpec::new("virtio_net", "kernel/drivers/net/virtio_net.ko", Device),
        ModuleSpec::new("virtio_balloon", "kernel/drivers/virtio/virtio_balloon.ko", Device),
        ModuleSpec::new("virtio_blk", "kernel/drivers/block/virtio_blk.ko", Device),
        ModuleSpec::new("loop", "kernel/drivers/block/loop.ko", Block),
        ModuleSpec::new("overlay", "kernel/fs/overlayfs/overlay.ko", Filesystem),
        ModuleSpec::new("squashfs", "kernel/fs/squashfs/squashfs.ko", Filesystem),
        ModuleSpec::new("mbcache", "kernel/fs/mbcache.ko", Filesystem),
        ModuleSpec::new("jbd2", "kernel/fs/jbd2/jbd2.ko", Filesystem),
        ModuleSpec::new("ext4", "kernel/fs/ext4/ext4.ko", Filesystem),
        ModuleSpec::new("fuse", "kernel/fs/fuse/fuse.ko", Filesystem),
        ModuleSpec::new("virtiofs", "kernel/fs/fuse/virtiofs.ko", Filesystem),
        ModuleSpec::new("vsock", "kernel/net/vmw_vsock/vsock.ko", Socket),
        ModuleSpec::new(
            "vmw_vsock_virtio_transport_common",
            "kernel/net/vmw_vsock/vmw_vsock_virtio_transport_common.ko",
            Socket,
        ),
        ModuleSpec::new(
            "vmw_vsock_virtio_transport",
            "kernel/net/vmw_vsock/vmw_vsock_virtio_transport.ko",
            Socket,
        ),
        ModuleSpec::new("llc", "kernel/net/llc/llc.ko", Netfilter),
        ModuleSpec::new("stp", "kernel/net/802/stp.ko", Netfilter),
        ModuleSpec::new("bridge", "kernel/net/bridge/bridge.ko", Netfilter),
        ModuleSpec::new("br_netfilter", "kernel/net/bridge/br_netfilter.ko", Netfilter),
        ModuleSpec::new("veth", "kernel/drivers/net/veth.ko", Netfilter),
        ModuleSpec::new("nf_defrag_ipv4", "kernel/net/ipv4/netfilter/nf_defrag_ipv4.ko", Netfilter),
        ModuleSpec::new("nf_defrag_ipv6", "kernel/net/ipv6/netfilter/nf_defrag_ipv6.ko", Netfilter),
        ModuleSpec::new("nf_conntrack", "kernel/net/netfilter/nf_conntrack.ko", Netfilter),
        ModuleSpec::new("nf_nat", "kernel/net/netfilter/nf_nat.ko", Netfilter),
        ModuleSpec::new("x_tables", "kernel/net/netfilter/x_tables.ko", Netfilter),
        ModuleSpec::new("ip_tables", "kernel/net/ipv4/netfilter/ip_tables.ko", Netfilter),
        ModuleSpec::new("iptable_filter", "kernel/net/ipv4/netfilter/iptable_filter.ko", Netfilter),
        ModuleSpec::new("iptable_nat", "kernel/net/ipv4/netfilter/iptable_nat.ko", Netfilter),
        ModuleSpec::new("xt_conntrack", "kernel/net/netfilter/xt_conntrack.ko", Netfilter),
        ModuleSpec::new("xt_MASQUERADE", "kernel/net/netfilter/xt_MASQUERADE.ko", Netfilter),
        ModuleSpec::new("xt_addrtype", "kernel/net/netfilter/xt_addrtype.ko", Netfilter),
    ]
}
