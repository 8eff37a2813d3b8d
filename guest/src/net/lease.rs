use crate::BootError;
use crate::config::StaticFallback;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOrigin {
    Dynamic,
    Static,
}

/// The addressing state applied to one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLease {
    pub interface: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<IpAddr>,
    #[serde(default)]
    pub domain: Option<String>,
    pub origin: LeaseOrigin,
}

impl NetworkLease {
    pub fn fallback(interface: &str, fallback: &StaticFallback) -> Self {
        Self {
            interface: interface.to_string(),
            address: fallback.address,
            netmask: fallback.netmask,
            gateway: Some(fallback.gateway),
            dns: fallback.dns.clone(),
            domain: None,
            origin: LeaseOrigin::Static,
        }
    }
}

/// A DHCP client lease event, as delivered to the handler script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    Bound(NetworkLease),
    Renew(NetworkLease),
    Deconfig { interface: String },
    /// `leasefail`, `nak` and anything else needing no action.
    Other(String),
}

impl LeaseEvent {
    /// Decode an event from the client's environment (`interface`, `ip`,
    /// `subnet`, `router`, `dns`, `domain`).
    pub fn from_env(event: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self, BootError> {
        match event {
            "bound" => Ok(LeaseEvent::Bound(lease_from_env(&env)?)),
            "renew" => Ok(LeaseEvent::Renew(lease_from_env(&env)?)),
            "deconfig" => Ok(LeaseEvent::Deconfig {
                interface: required(&env, "interface")?,
            }),
            other => Ok(LeaseEvent::Other(other.to_string())),
        }
    }
}

fn lease_from_env(env: &impl Fn(&str) -> Option<String>) -> Result<NetworkLease, BootError> {
    let interface = required(env, "interface")?;
    let address = parse_v4("ip", &required(env, "ip")?)?;
    let netmask = match env("subnet") {
        Some(mask) => parse_v4("subnet", &mask)?,
        None => Ipv4Addr::new(255, 255, 255, 0),
    };

    // Several routers may be offered; the first one becomes the default route.
    let gateway = env("router")
        .and_then(|routers| routers.split_whitespace().next().map(String::from))
        .map(|r| parse_v4("router", &r))
        .transpose()?;

    let dns = env("dns")
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|s| match s.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!("ignoring malformed resolver {:?}", s);
                None
            }
        })
        .collect();

    Ok(NetworkLease {
        interface,
        address,
        netmask,
        gateway,
        dns,
        domain: env("domain").filter(|d| !d.is_empty()),
        origin: LeaseOrigin::Dynamic,
    })
}

fn required(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String, BootError> {
    env(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BootError::Network(format!("lease event without {}", key)))
}

fn parse_v4(key: &str, value: &str) -> Result<Ipv4Addr, BootError> {
    value
        .parse()
        .map_err(|_| BootError::Network(format!("invalid {} {:?}", key, value)))
}
