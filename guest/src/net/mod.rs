//! Network bring-up.
//!
//! Loopback first, then the primary interface via a bounded DHCP attempt
//! with a static fallback matching the hypervisor's NAT. Either way exactly
//! one lease ends up applied and the resolver file is never left empty.

mod dhcp;
mod iface;
mod lease;

pub use dhcp::{LeaseClient, Udhcpc};
pub use iface::{InterfaceConfigurator, SysInterfaces};
pub use lease::{LeaseEvent, LeaseOrigin, NetworkLease};

use crate::BootError;
use crate::config::NetworkSettings;
use std::io::Write;
use std::path::Path;

const LOOPBACK: &str = "lo";

pub fn bring_up(
    settings: &NetworkSettings,
    client: &dyn LeaseClient,
    ifaces: &dyn InterfaceConfigurator,
) -> NetworkLease {
    if let Err(e) = ifaces.set_up(LOOPBACK) {
        tracing::warn!("loopback not brought up: {}", e);
    }

    let interface = settings.interface.as_str();
    let link_present = ifaces.wait_for_link(
        interface,
        settings.link_wait_attempts,
        settings.link_wait_interval(),
    );

    let dynamic = if link_present {
        ifaces.set_up(interface).and_then(|()| client.negotiate(interface))
    } else {
        Err(BootError::Network(format!("{} never appeared", interface)))
    };

    let lease = match dynamic {
        Ok(mut lease) => {
            if lease.dns.is_empty() {
                tracing::warn!(interface, "lease carried no resolvers, using fallback resolvers");
                lease.dns = settings.fallback.dns.clone();
            }
            lease
        }
        Err(e) => {
            tracing::warn!(interface, "dynamic configuration failed ({}), applying static fallback", e);
            let lease = NetworkLease::fallback(interface, &settings.fallback);
            if let Err(e) = ifaces.configure(&lease) {
                tracing::error!(interface, "static configuration failed: {}", e);
            }
            lease
        }
    };

    if let Err(e) = write_resolv_conf(&settings.resolv_conf, &lease) {
        tracing::error!("writing {:?} failed: {}", settings.resolv_conf, e);
    }

    tracing::info!(
        interface,
        address = %lease.address,
        origin = ?lease.origin,
        "network ready"
    );
    lease
}

/// React to a lease event delivered by the DHCP client.
pub fn handle_lease_event(
    event: LeaseEvent,
    settings: &NetworkSettings,
    ifaces: &dyn InterfaceConfigurator,
) -> Result<(), BootError> {
    match event {
        LeaseEvent::Bound(mut lease) | LeaseEvent::Renew(mut lease) => {
            if lease.dns.is_empty() {
                lease.dns = settings.fallback.dns.clone();
            }
            ifaces.configure(&lease)?;
            write_resolv_conf(&settings.resolv_conf, &lease)?;
            persist_lease(&settings.lease_state, &lease)?;
            Ok(())
        }
        LeaseEvent::Deconfig { interface } => ifaces.deconfigure(&interface),
        LeaseEvent::Other(name) => {
            tracing::debug!(event = %name, "lease event ignored");
            Ok(())
        }
    }
}

/// Rewrite the resolver file from `lease`. The file is replaced atomically.
pub fn write_resolv_conf(path: &Path, lease: &NetworkLease) -> Result<(), BootError> {
    if lease.dns.is_empty() {
        return Err(BootError::Network("refusing to write an empty resolver file".to_string()));
    }

    let mut content = format!("# Generated by guestboot ({:?} lease on {})\n", lease.origin, lease.interface);
    if let Some(domain) = &lease.domain {
        content.push_str(&format!("search {}\n", domain));
    }
    for server in &lease.dns {
        content.push_str(&format!("nameserver {}\n", server));
    }

    write_atomic(path, content.as_bytes())
}

fn persist_lease(path: &Path, lease: &NetworkLease) -> Result<(), BootError> {
    write_atomic(path, serde_json::to_string_pretty(lease)?.as_bytes())
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), BootError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Responder(Option<NetworkLease>);

    impl LeaseClient for Responder {
        fn negotiate(&self, interface: &str) -> Result<NetworkLease, BootError> {
            self.0
                .clone()
                .ok_or_else(|| BootError::NoLease(format!("{}: timed out", interface)))
        }
    }

    #[derive(Default)]
    struct RecordingInterfaces {
        link_missing: bool,
        ups: RefCell<Vec<String>>,
        configured: RefCell<Vec<NetworkLease>>,
        deconfigured: RefCell<Vec<String>>,
    }

    impl InterfaceConfigurator for RecordingInterfaces {
        fn wait_for_link(&self, _name: &str, _attempts: u32, _interval: Duration) -> bool {
            !self.link_missing
        }

        fn set_up(&self, name: &str) -> Result<(), BootError> {
            self.ups.borrow_mut().push(name.to_string());
            Ok(())
        }

        fn configure(&self, lease: &NetworkLease) -> Result<(), BootError> {
            self.configured.borrow_mut().push(lease.clone());
            Ok(())
        }

        fn deconfigure(&self, name: &str) -> Result<(), BootError> {
            self.deconfigured.borrow_mut().push(name.to_string());
            Ok(())
        }
    }

    fn settings_in(dir: &TempDir) -> NetworkSettings {
        NetworkSettings {
            resolv_conf: dir.path().join("etc/resolv.conf"),
            lease_state: dir.path().join("run/lease.json"),
            ..NetworkSettings::default()
        }
    }

    fn offered(dns: &[&str]) -> NetworkLease {
        NetworkLease {
            interface: "eth0".to_string(),
            address: Ipv4Addr::new(192, 168, 127, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Some(Ipv4Addr::new(192, 168, 127, 1)),
            dns: dns.iter().map(|s| s.parse().unwrap()).collect(),
            domain: None,
            origin: LeaseOrigin::Dynamic,
        }
    }

    fn nameservers(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("nameserver "))
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_dynamic_lease_resolvers_only() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let ifaces = RecordingInterfaces::default();

        let lease = bring_up(&settings, &Responder(Some(offered(&["192.168.127.1"]))), &ifaces);

        assert_eq!(lease.origin, LeaseOrigin::Dynamic);
        assert_eq!(nameservers(&settings.resolv_conf), vec!["192.168.127.1"]);
        // Applied by the lease hook, not a second time here.
        assert!(ifaces.configured.borrow().is_empty());
        assert_eq!(*ifaces.ups.borrow(), vec!["lo", "eth0"]);
    }

    #[test]
    fn test_timeout_uses_static_fallback() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let ifaces = RecordingInterfaces::default();

        let lease = bring_up(&settings, &Responder(None), &ifaces);

        assert_eq!(lease.origin, LeaseOrigin::Static);
        assert_eq!(lease.address, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(lease.gateway, Some(Ipv4Addr::new(10, 0, 2, 2)));
        assert_eq!(nameservers(&settings.resolv_conf), vec!["10.0.2.3", "8.8.8.8"]);
        assert_eq!(*ifaces.configured.borrow(), vec![lease]);
    }

    #[test]
    fn test_missing_link_goes_static() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let ifaces = RecordingInterfaces {
            link_missing: true,
            ..Default::default()
        };

        let lease = bring_up(&settings, &Responder(Some(offered(&["1.1.1.1"]))), &ifaces);
        assert_eq!(lease.origin, LeaseOrigin::Static);
        assert!(!nameservers(&settings.resolv_conf).is_empty());
    }

    #[test]
    fn test_lease_without_resolvers_gets_fallback_resolvers() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);

        let lease = bring_up(&settings, &Responder(Some(offered(&[]))), &RecordingInterfaces::default());
        assert_eq!(lease.origin, LeaseOrigin::Dynamic);
        assert_eq!(nameservers(&settings.resolv_conf), vec!["10.0.2.3", "8.8.8.8"]);
    }

    #[test]
    fn test_bound_event_applies_and_records() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let ifaces = RecordingInterfaces::default();
        let mut lease = offered(&["9.9.9.9"]);
        lease.domain = Some("corp.example".to_string());

        handle_lease_event(LeaseEvent::Bound(lease.clone()), &settings, &ifaces).unwrap();

        assert_eq!(*ifaces.configured.borrow(), vec![lease.clone()]);
        let resolv = std::fs::read_to_string(&settings.resolv_conf).unwrap();
        assert!(resolv.contains("search corp.example\n"));
        assert_eq!(nameservers(&settings.resolv_conf), vec!["9.9.9.9"]);

        let recorded: NetworkLease =
            serde_json::from_str(&std::fs::read_to_string(&settings.lease_state).unwrap()).unwrap();
        assert_eq!(recorded, lease);
    }

    #[test]
    fn test_deconfig_keeps_resolvers() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let ifaces = RecordingInterfaces::default();
        handle_lease_event(LeaseEvent::Bound(offered(&["9.9.9.9"])), &settings, &ifaces).unwrap();

        handle_lease_event(
            LeaseEvent::Deconfig {
                interface: "eth0".to_string(),
            },
            &settings,
            &ifaces,
        )
        .unwrap();

        assert_eq!(*ifaces.deconfigured.borrow(), vec!["eth0"]);
        assert_eq!(nameservers(&settings.resolv_conf), vec!["9.9.9.9"]);
    }

    #[test]
    fn test_empty_resolver_file_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resolv.conf");
        assert!(write_resolv_conf(&path, &offered(&[])).is_err());
        assert!(!path.exists());

        let v6 = NetworkLease {
            dns: vec![IpAddr::V6("fd00::1".parse().unwrap())],
            ..offered(&[])
        };
        write_resolv_conf(&path, &v6).unwrap();
        assert_eq!(nameservers(&path), vec!["fd00::1"]);
    }
}
