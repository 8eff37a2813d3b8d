//! Boot configuration.
//!
//! Everything that varies between environments (module table, NTP
//! endpoints, static network fallback, paths) lives here rather than in the
//! boot logic. The file is JSON and every field has a default, so a missing
//! or partial file still yields a bootable configuration.

use crate::BootError;
use crate::modules::{ModuleSpec, default_table};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/guestboot/boot.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Prefix of the boot parameters this orchestrator reads,
    /// e.g. `guestboot.boot_asset_version=...`.
    pub cmdline_namespace: String,
    pub hostname: String,
    pub share: ShareSettings,
    pub root: RootSettings,
    pub modules: Vec<ModuleSpec>,
    pub network: NetworkSettings,
    pub clock: ClockSettings,
    pub containers: ContainerSettings,
    pub agent: AgentSettings,
    pub logs: LogSettings,
    /// Additional virtio-fs shares mounted in stage two. Failure to mount
    /// any of them is not fatal.
    pub shares: Vec<ExtraShare>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cmdline_namespace: "guestboot".to_string(),
            hostname: "guest".to_string(),
            share: ShareSettings::default(),
            root: RootSettings::default(),
            modules: default_table(),
            network: NetworkSettings::default(),
            clock: ClockSettings::default(),
            containers: ContainerSettings::default(),
            agent: AgentSettings::default(),
            logs: LogSettings::default(),
            shares: vec![ExtraShare {
                tag: "home".to_string(),
                target: PathBuf::from("/home/guest"),
                read_only: false,
            }],
        }
    }
}

impl BootConfig {
    /// Load the configuration at `path`. An absent file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, BootError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: BootConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration, falling back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Ignoring configuration at {:?}: {}", path, e);
            Self::default()
        })
    }

    fn validate(&self) -> Result<(), BootError> {
        if self.cmdline_namespace.is_empty() {
            return Err(BootError::Config("cmdline_namespace is empty".to_string()));
        }
        if self.network.fallback.dns.is_empty() {
            return Err(BootError::Config(
                "network.fallback.dns needs at least one resolver".to_string(),
            ));
        }
        if !self.root.stage2_init.is_absolute() {
            return Err(BootError::Config(format!(
                "root.stage2_init must be absolute: {:?}",
                self.root.stage2_init
            )));
        }
        Ok(())
    }

    pub fn version_key(&self) -> String {
        format!("{}.boot_asset_version", self.cmdline_namespace)
    }

    pub fn rescue_key(&self) -> String {
        format!("{}.rescue", self.cmdline_namespace)
    }
}

/// The virtio-fs share carrying versioned boot assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareSettings {
    pub tag: String,
    pub mountpoint: PathBuf,
    pub rootfs_image: String,
    pub module_archive: String,
    pub wait_attempts: u32,
    pub wait_interval_ms: u64,
}

impl Default for ShareSettings {
    fn default() -> Self {
        Self {
            tag: "bootshare".to_string(),
            mountpoint: PathBuf::from("/mnt/share"),
            rootfs_image: "rootfs.img".to_string(),
            module_archive: "modules.img".to_string(),
            wait_attempts: 50,
            wait_interval_ms: 100,
        }
    }
}

impl ShareSettings {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootSettings {
    pub image_fstype: String,
    pub module_archive_fstype: String,
    /// Scratch area holding the base image mount and the writable layer.
    pub scratch: PathBuf,
    pub staging: PathBuf,
    pub overlay_tmpfs_size: Option<String>,
    /// Entry program of the staged root.
    pub stage2_init: PathBuf,
}

impl Default for RootSettings {
    fn default() -> Self {
        Self {
            image_fstype: "squashfs".to_string(),
            module_archive_fstype: "squashfs".to_string(),
            scratch: PathBuf::from("/run/overlay"),
            staging: PathBuf::from("/newroot"),
            overlay_tmpfs_size: None,
            stage2_init: PathBuf::from("/sbin/guestboot-stage2"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub interface: String,
    pub dhcp_client: PathBuf,
    pub dhcp_retries: u32,
    pub dhcp_timeout_secs: u32,
    pub link_wait_attempts: u32,
    pub link_wait_interval_ms: u64,
    pub fallback: StaticFallback,
    pub resolv_conf: PathBuf,
    /// Handler the DHCP client runs on lease events.
    pub lease_hook: PathBuf,
    /// Where the lease hook records the applied lease.
    pub lease_state: PathBuf,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            dhcp_client: PathBuf::from("/sbin/udhcpc"),
            dhcp_retries: 3,
            dhcp_timeout_secs: 2,
            link_wait_attempts: 50,
            link_wait_interval_ms: 100,
            fallback: StaticFallback::default(),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            lease_hook: PathBuf::from("/sbin/guestboot-lease-hook"),
            lease_state: PathBuf::from("/run/guestboot/lease.json"),
        }
    }
}

impl NetworkSettings {
    pub fn link_wait_interval(&self) -> Duration {
        Duration::from_millis(self.link_wait_interval_ms)
    }
}

/// Static addressing matching the hypervisor's user-mode NAT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticFallback {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<IpAddr>,
}

impl Default for StaticFallback {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 2, 15),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 2, 2),
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 2, 3)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
        }
    }
}

/// NTP endpoints are socket addresses, never hostnames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    pub endpoints: Vec<SocketAddr>,
    pub timeout_ms: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![
                SocketAddr::from(([162, 159, 200, 1], 123)),
                SocketAddr::from(([216, 239, 35, 0], 123)),
                SocketAddr::from(([129, 6, 15, 28], 123)),
            ],
            timeout_ms: 3000,
        }
    }
}

impl ClockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    pub cgroup_mountpoint: PathBuf,
    /// Writable backing for container image storage.
    pub storage_dir: PathBuf,
    pub storage_tmpfs_size: Option<String>,
    pub ip_forward: PathBuf,
    pub propagation_root: PathBuf,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            cgroup_mountpoint: PathBuf::from("/sys/fs/cgroup"),
            storage_dir: PathBuf::from("/var/lib/containers"),
            storage_tmpfs_size: None,
            ip_forward: PathBuf::from("/proc/sys/net/ipv4/ip_forward"),
            propagation_root: PathBuf::from("/"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub restart_interval_ms: u64,
    pub monitor_interval_ms: u64,
    pub log_primary: PathBuf,
    pub log_fallback: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/local/bin/guest-agent"),
            args: Vec::new(),
            restart_interval_ms: 1000,
            monitor_interval_ms: 200,
            log_primary: PathBuf::from("/mnt/share/logs/agent.log"),
            log_fallback: PathBuf::from("/var/log/guestboot/agent.log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub init: PathBuf,
    pub stage2_primary: PathBuf,
    pub stage2_fallback: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            init: PathBuf::from("/run/guestboot-init.log"),
            stage2_primary: PathBuf::from("/mnt/share/logs/stage2.log"),
            stage2_fallback: PathBuf::from("/var/log/guestboot/stage2.log"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraShare {
    pub tag: String,
    pub target: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = BootConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.cmdline_namespace, "guestboot");
        assert_eq!(config.version_key(), "guestboot.boot_asset_version");
        assert!(!config.modules.is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot.json");
        std::fs::write(
            &path,
            r#"{
                "cmdline_namespace": "acme",
                "clock": { "endpoints": ["192.0.2.10:123"] },
                "network": { "fallback": { "address": "192.168.64.2", "gateway": "192.168.64.1", "dns": ["192.168.64.1"] } }
            }"#,
        )
        .unwrap();

        let config = BootConfig::load(&path).unwrap();
        assert_eq!(config.version_key(), "acme.boot_asset_version");
        assert_eq!(config.clock.endpoints, vec!["192.0.2.10:123".parse().unwrap()]);
        assert_eq!(config.clock.timeout_ms, 3000);
        assert_eq!(config.network.fallback.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.network.interface, "eth0");
    }

    #[test]
    fn test_hostname_endpoint_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot.json");
        std::fs::write(&path, r#"{ "clock": { "endpoints": ["pool.ntp.org:123"] } }"#).unwrap();

        assert!(matches!(BootConfig::load(&path), Err(BootError::Json(_))));
    }

    #[test]
    fn test_empty_fallback_dns_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("boot.json");
        std::fs::write(&path, r#"{ "network": { "fallback": { "dns": [] } } }"#).unwrap();

        assert!(matches!(BootConfig::load(&path), Err(BootError::Config(_))));
        assert_eq!(BootConfig::load_or_default(&path).network.fallback.dns.len(), 2);
    }
}
