//! Synchronous host name resolution
//!
//! Resolution is blocking by design: it happens at configuration load and on
//! operator `add` commands, never on the forwarding path.

use std::net::{IpAddr, ToSocketAddrs};

use crate::error::RouteError;

/// Resolve a host name (or address literal) to an ordered address list.
///
/// Literals short-circuit the resolver. Duplicate addresses reported by the
/// system resolver (one per socket type) are collapsed, preserving order.
///
/// # Errors
///
/// Returns `RouteError::Resolve` if the lookup fails and
/// `RouteError::NoAddresses` if it yields nothing usable.
pub fn resolve_host(host: &str) -> Result<Vec<IpAddr>, RouteError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| RouteError::resolve(host, e.to_string()))?;

    let mut out: Vec<IpAddr> = Vec::new();
    for addr in addrs {
        if !out.contains(&addr.ip()) {
            out.push(addr.ip());
        }
    }

    if out.is_empty() {
        return Err(RouteError::NoAddresses {
            host: host.to_string(),
        });
    }
    Ok(out)
}

/// Pick the target address from a resolved list: the first address, with
/// IPv4 preferred when both families are present.
#[must_use]
pub fn pick_target(addrs: &[IpAddr]) -> Option<IpAddr> {
    addrs
        .iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
}
