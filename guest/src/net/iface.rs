//! Interface configuration through the classic socket ioctls.

use crate::BootError;
use crate::net::NetworkLease;
use crate::retry::poll_until;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

// linux/sockios.h
const SIOCADDRT: libc::c_ulong = 0x890B;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCSIFNETMASK: libc::c_ulong = 0x891C;

// linux/route.h
const RTF_UP: libc::c_ushort = 0x0001;
const RTF_GATEWAY: libc::c_ushort = 0x0002;

const SYS_CLASS_NET: &str = "/sys/class/net";

#[repr(C)]
struct IfreqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfreqAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr_in,
    _pad: [u8; 8],
}

/// Applies addressing to network interfaces.
pub trait InterfaceConfigurator {
    /// Wait (bounded) for `name` to be registered by its driver.
    fn wait_for_link(&self, name: &str, attempts: u32, interval: Duration) -> bool;

    fn set_up(&self, name: &str) -> Result<(), BootError>;

    /// Apply address, netmask and default route, and bring the link up.
    fn configure(&self, lease: &NetworkLease) -> Result<(), BootError>;

    /// Drop the address but keep the link up, as DHCP clients expect.
    fn deconfigure(&self, name: &str) -> Result<(), BootError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SysInterfaces;

impl InterfaceConfigurator for SysInterfaces {
    fn wait_for_link(&self, name: &str, attempts: u32, interval: Duration) -> bool {
        let path = Path::new(SYS_CLASS_NET).join(name);
        poll_until(|| path.exists(), attempts, interval).is_found()
    }

    fn set_up(&self, name: &str) -> Result<(), BootError> {
        let sock = ControlSocket::open()?;
        let mut req = IfreqFlags {
            ifr_name: ifname(name)?,
            ifr_flags: 0,
            _pad: [0; 22],
        };
        sock.ioctl(SIOCGIFFLAGS, &mut req)
            .map_err(|e| BootError::Network(format!("get flags of {}: {}", name, e)))?;
        req.ifr_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        sock.ioctl(SIOCSIFFLAGS, &mut req)
            .map_err(|e| BootError::Network(format!("bring up {}: {}", name, e)))?;

        tracing::debug!(interface = name, "link up");
        Ok(())
    }

    fn configure(&self, lease: &NetworkLease) -> Result<(), BootError> {
        let sock = ControlSocket::open()?;
        let name = &lease.interface;

        set_address(&sock, name, SIOCSIFADDR, lease.address)
            .map_err(|e| BootError::Network(format!("set address on {}: {}", name, e)))?;
        set_address(&sock, name, SIOCSIFNETMASK, lease.netmask)
            .map_err(|e| BootError::Network(format!("set netmask on {}: {}", name, e)))?;
        self.set_up(name)?;

        if let Some(gateway) = lease.gateway {
            add_default_route(&sock, name, gateway)?;
        }

        tracing::info!(
            interface = %name,
            address = %lease.address,
            netmask = %lease.netmask,
            gateway = ?lease.gateway,
            "interface configured"
        );
        Ok(())
    }

    fn deconfigure(&self, name: &str) -> Result<(), BootError> {
        let sock = ControlSocket::open()?;
        set_address(&sock, name, SIOCSIFADDR, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| BootError::Network(format!("clear address on {}: {}", name, e)))?;
        self.set_up(name)
    }
}

struct ControlSocket(OwnedFd);

impl ControlSocket {
    fn open() -> Result<Self, BootError> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> std::io::Result<()> {
        if unsafe { libc::ioctl(self.0.as_raw_fd(), request as _, arg as *mut T) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

fn set_address(sock: &ControlSocket, name: &str, request: libc::c_ulong, addr: Ipv4Addr) -> Result<(), BootError> {
    let mut req = IfreqAddr {
        ifr_name: ifname(name)?,
        ifr_addr: sockaddr_v4(addr),
        _pad: [0; 8],
    };
    sock.ioctl(request, &mut req)?;
    Ok(())
}

fn add_default_route(sock: &ControlSocket, name: &str, gateway: Ipv4Addr) -> Result<(), BootError> {
    let dev = CString::new(name).map_err(|_| BootError::Network(format!("bad interface name {:?}", name)))?;

    let mut route: libc::rtentry = unsafe { std::mem::zeroed() };
    write_sockaddr(&mut route.rt_dst, Ipv4Addr::UNSPECIFIED);
    write_sockaddr(&mut route.rt_genmask, Ipv4Addr::UNSPECIFIED);
    write_sockaddr(&mut route.rt_gateway, gateway);
    route.rt_flags = RTF_UP | RTF_GATEWAY;
    route.rt_dev = dev.as_ptr() as *mut libc::c_char;

    match sock.ioctl(SIOCADDRT, &mut route) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
            tracing::debug!(interface = name, %gateway, "default route already present");
            Ok(())
        }
        Err(e) => Err(BootError::Network(format!("default route via {}: {}", gateway, e))),
    }
}

fn ifname(name: &str) -> Result<[libc::c_char; libc::IFNAMSIZ], BootError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(BootError::Network(format!("invalid interface name {:?}", name)));
    }

    let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
    for (slot, b) in out.iter_mut().zip(bytes) {
        *slot = *b as libc::c_char;
    }
    Ok(out)
}

fn sockaddr_v4(addr: Ipv4Addr) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        },
        sin_zero: [0; 8],
    }
}

// sockaddr and sockaddr_in are both 16 bytes.
fn write_sockaddr(slot: &mut libc::sockaddr, addr: Ipv4Addr) {
    let sin = sockaddr_v4(addr);
    unsafe { std::ptr::write(slot as *mut libc::sockaddr as *mut libc::sockaddr_in, sin) };
}
