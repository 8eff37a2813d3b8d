//! One-shot wall-clock synchronization.
//!
//! Endpoints are numeric socket addresses, so no resolver is ever consulted
//! and the worst-case stall is bounded by the per-endpoint timeout.

use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_settime};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { endpoint: SocketAddr, time: TimeSpec },
    Failed,
}

pub trait SystemClock {
    fn set(&self, time: TimeSpec) -> nix::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealtimeClock;

impl SystemClock for RealtimeClock {
    fn set(&self, time: TimeSpec) -> nix::Result<()> {
        clock_settime(ClockId::CLOCK_REALTIME, time)
    }
}

/// Query `endpoints` in order and step the clock from the first answer.
///
/// The virtual clock starts unset, so any answer is accepted even when it
/// lies behind the current time.
pub fn sync_once(endpoints: &[SocketAddr], timeout: Duration, clock: &dyn SystemClock) -> SyncOutcome {
    for &endpoint in endpoints {
        let time = match query(endpoint, timeout) {
            Ok(time) => time,
            Err(e) => {
                tracing::warn!(%endpoint, "time query failed: {}", e);
                continue;
            }
        };

        match clock.set(time) {
            Ok(()) => {
                tracing::info!(%endpoint, seconds = time.tv_sec(), "system clock set");
                return SyncOutcome::Synced { endpoint, time };
            }
            Err(e) => tracing::warn!(%endpoint, "setting the clock failed: {}", e),
        }
    }

    tracing::warn!(endpoints = endpoints.len(), "clock not synchronized");
    SyncOutcome::Failed
}

fn query(endpoint: SocketAddr, timeout: Duration) -> Result<TimeSpec, String> {
    let bind: SocketAddr = match endpoint {
        SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
        SocketAddr::V6(_) => ([0u16; 8], 0).into(),
    };
    let socket = UdpSocket::bind(bind).map_err(|e| e.to_string())?;
    socket.set_read_timeout(Some(timeout)).map_err(|e| e.to_string())?;
    socket.set_write_timeout(Some(timeout)).map_err(|e| e.to_string())?;

    // A numeric "ip:port" string parses directly and never reaches the resolver.
    let addr = endpoint.to_string();
    let result = sntpc::simple_get_time(addr.as_str(), &socket).map_err(|e| format!("{:?}", e))?;
    let nanos = sntpc::fraction_to_nanoseconds(result.sec_fraction());
    Ok(TimeSpec::new(i64::from(result.sec()), i64::from(nanos)))
}
