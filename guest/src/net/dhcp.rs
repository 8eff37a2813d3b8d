use crate::BootError;
use crate::config::NetworkSettings;
use crate::net::NetworkLease;
use crate::retry::poll_until;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

const WAIT_INTERVAL: Duration = Duration::from_millis(100);
// Allowance on top of the client's own retry budget before it is killed.
const GRACE_SECS: u32 = 2;

/// Negotiates a dynamic lease for an interface.
pub trait LeaseClient {
    fn negotiate(&self, interface: &str) -> Result<NetworkLease, BootError>;
}

/// BusyBox `udhcpc` in one-shot mode. The client runs the lease hook on each
/// event; the hook applies the lease and records it in `lease_state`, which
/// is read back here once the client exits.
pub struct Udhcpc<'a> {
    settings: &'a NetworkSettings,
}

impl<'a> Udhcpc<'a> {
    pub fn new(settings: &'a NetworkSettings) -> Self {
        Self { settings }
    }

    fn budget(&self) -> Duration {
        let secs = self
            .settings
            .dhcp_retries
            .saturating_mul(self.settings.dhcp_timeout_secs)
            .saturating_add(GRACE_SECS);
        Duration::from_secs(u64::from(secs))
    }
}

impl LeaseClient for Udhcpc<'_> {
    fn negotiate(&self, interface: &str) -> Result<NetworkLease, BootError> {
        let settings = self.settings;
        match std::fs::remove_file(&settings.lease_state) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut child = Command::new(&settings.dhcp_client)
            .arg("-i")
            .arg(interface)
            .args(["-f", "-q", "-n"])
            .arg("-t")
            .arg(settings.dhcp_retries.to_string())
            .arg("-T")
            .arg(settings.dhcp_timeout_secs.to_string())
            .arg("-s")
            .arg(&settings.lease_hook)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| BootError::NoLease(format!("{}: spawn {:?}: {}", interface, settings.dhcp_client, e)))?;

        let attempts = (self.budget().as_millis() / WAIT_INTERVAL.as_millis()) as u32;
        let mut status = None;
        let exited = poll_until(
            || match child.try_wait() {
                Ok(Some(s)) => {
                    status = Some(s);
                    true
                }
                Ok(None) => false,
                Err(_) => true,
            },
            attempts,
            WAIT_INTERVAL,
        );

        if !exited.is_found() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BootError::NoLease(format!("{}: client did not finish in {:?}", interface, self.budget())));
        }

        match status {
            Some(s) if s.success() => {}
            other => {
                return Err(BootError::NoLease(format!("{}: client exited with {:?}", interface, other)));
            }
        }

        read_lease_state(&settings.lease_state)
            .map_err(|e| BootError::NoLease(format!("{}: no lease recorded: {}", interface, e)))
    }
}

fn read_lease_state(path: &Path) -> Result<NetworkLease, BootError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
