//! Routing table
//!
//! An ordered list of routes keyed by source IP. New routes are prepended so
//! recent additions take priority when a host resolves to an address that is
//! later re-added. The table owns no sockets: when a route replacement must
//! evict live traffic, the table reports the bound descriptor and the engine
//! performs the teardown.

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use tracing::{debug, info};

use super::resolver::{pick_target, resolve_host};
use crate::error::RouteError;

/// Unresolved route specification: `<source_host> <target_host>:<port>`.
///
/// This is the form routes take in the configuration file and in `add`
/// commands, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub source_host: String,
    pub target_host: String,
    pub target_port: u16,
}

impl RouteSpec {
    /// Scan a route specification.
    ///
    /// The target host and port are separated by the first `:`; the port must
    /// be in 1..=65535.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidSpec` or `RouteError::InvalidPort`.
    pub fn parse(spec: &str) -> Result<Self, RouteError> {
        let invalid = || RouteError::InvalidSpec(spec.to_string());

        let mut fields = spec.split_whitespace();
        let source_host = fields.next().ok_or_else(invalid)?;
        let target = fields.next().ok_or_else(invalid)?;
        if fields.next().is_some() {
            return Err(invalid());
        }

        let (target_host, port) = target.split_once(':').ok_or_else(invalid)?;
        if source_host.is_empty() || target_host.is_empty() {
            return Err(invalid());
        }
        let port: u32 = port.parse().map_err(|_| invalid())?;
        let target_port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(RouteError::InvalidPort(port))?;

        Ok(Self {
            source_host: source_host.to_string(),
            target_host: target_host.to_string(),
            target_port,
        })
    }
}

/// One routing entry: a source IP mapped to a target address, plus the
/// descriptor of the currently proxied connection from that source, if any.
#[derive(Debug, Clone)]
pub struct Route {
    pub source_ip: IpAddr,
    pub target_ip: IpAddr,
    pub target_port: u16,
    source_fd: Option<RawFd>,
}

impl Route {
    /// Descriptor of the accepted connection bound to this route.
    #[must_use]
    pub fn source_fd(&self) -> Option<RawFd> {
        self.source_fd
    }

    /// Target as a connectable socket address.
    #[must_use]
    pub fn target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.target_ip, self.target_port)
    }
}

/// Outcome of inserting one resolved route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// A new entry was prepended.
    Added,
    /// An idle entry with the same source had its target overwritten.
    Updated,
    /// A busy entry was overwritten; the named descriptor must be torn down.
    Evicted(RawFd),
}

/// Ordered routing table. Lookups are linear; the table is bounded only by
/// the descriptor limit.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Resolve both hosts and insert one route per source address, all
    /// sharing the first (IPv4-preferred) target address.
    ///
    /// Returns the descriptors of any live pairs evicted by the replacement
    /// of their routes; the caller must tear those pairs down.
    ///
    /// # Errors
    ///
    /// Returns `RouteError` if either host fails to resolve.
    pub fn add(
        &mut self,
        source_host: &str,
        target_host: &str,
        target_port: u16,
    ) -> Result<Vec<RawFd>, RouteError> {
        if target_port == 0 {
            return Err(RouteError::InvalidPort(0));
        }

        let target_addrs = resolve_host(target_host)?;
        let target_ip = pick_target(&target_addrs).ok_or_else(|| RouteError::NoAddresses {
            host: target_host.to_string(),
        })?;

        let source_addrs = resolve_host(source_host)?;

        let mut evicted = Vec::new();
        for source_ip in source_addrs {
            let outcome = self.insert(Route {
                source_ip,
                target_ip,
                target_port,
                source_fd: None,
            });
            match outcome {
                Inserted::Added => {
                    info!("route added: {source_ip} -> {target_ip}:{target_port}");
                }
                Inserted::Updated => {
                    info!("route updated: {source_ip} -> {target_ip}:{target_port}");
                }
                Inserted::Evicted(fd) => {
                    info!(
                        "route replaced: {source_ip} -> {target_ip}:{target_port}, \
                         evicting fd {fd}"
                    );
                    evicted.push(fd);
                }
            }
        }
        Ok(evicted)
    }

    /// Insert a resolved route, merging with any entry for the same source.
    pub fn insert(&mut self, route: Route) -> Inserted {
        if let Some(existing) = self
            .routes
            .iter_mut()
            .find(|r| r.source_ip == route.source_ip)
        {
            existing.target_ip = route.target_ip;
            existing.target_port = route.target_port;
            return match existing.source_fd.take() {
                Some(fd) => Inserted::Evicted(fd),
                None => Inserted::Updated,
            };
        }
        self.routes.insert(0, route);
        Inserted::Added
    }

    /// Route for a source IP, or none.
    #[must_use]
    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<&Route> {
        self.routes.iter().find(|r| r.source_ip == ip)
    }

    /// Route currently bound to a descriptor, or none.
    #[must_use]
    pub fn lookup_by_fd(&self, fd: RawFd) -> Option<&Route> {
        self.routes.iter().find(|r| r.source_fd == Some(fd))
    }

    /// Bind a route to the accepted descriptor of its active pair.
    pub fn bind(&mut self, ip: IpAddr, fd: RawFd) -> bool {
        if let Some(route) = self.routes.iter_mut().find(|r| r.source_ip == ip) {
            route.source_fd = Some(fd);
            return true;
        }
        false
    }

    /// Clear whichever route is bound to `fd`. No-op when none is.
    pub fn clear_binding(&mut self, fd: RawFd) -> bool {
        if let Some(route) = self.routes.iter_mut().find(|r| r.source_fd == Some(fd)) {
            debug!("route for {} unbound from fd {fd}", route.source_ip);
            route.source_fd = None;
            return true;
        }
        false
    }

    /// Drop every binding. Used during orderly shutdown after all pairs have
    /// been closed.
    pub fn clear_all_bindings(&mut self) {
        for route in &mut self.routes {
            route.source_fd = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_route_spec_parse() {
        let spec = RouteSpec::parse("10.0.0.5 backend.local:9100").unwrap();
        assert_eq!(spec.source_host, "10.0.0.5");
        assert_eq!(spec.target_host, "backend.local");
        assert_eq!(spec.target_port, 9100);

        // extra whitespace is tolerated
        let spec = RouteSpec::parse("  a   b:1  ").unwrap();
        assert_eq!(spec.source_host, "a");
        assert_eq!(spec.target_port, 1);
    }

    #[test]
    fn test_route_spec_parse_rejects_malformed() {
        for bad in [
            "",
            "onlyhost",
            "a b",
            "a b:",
            "a b:notaport",
            "a b:1 extra",
        ] {
            assert!(
                matches!(RouteSpec::parse(bad), Err(RouteError::InvalidSpec(_))),
                "{bad:?} should be invalid"
            );
        }
        assert!(matches!(
            RouteSpec::parse("a b:0"),
            Err(RouteError::InvalidPort(0))
        ));
        assert!(matches!(
            RouteSpec::parse("a b:70000"),
            Err(RouteError::InvalidPort(70000))
        ));
    }

    #[test]
    fn test_add_and_lookup() {
        let mut table = RouteTable::new();
        let evicted = table.add("10.0.0.5", "127.0.0.1", 9100).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(table.len(), 1);

        let route = table.lookup_by_ip(ip("10.0.0.5")).unwrap();
        assert_eq!(route.target_ip, ip("127.0.0.1"));
        assert_eq!(route.target_port, 9100);
        assert!(route.source_fd().is_none());
        assert!(table.lookup_by_ip(ip("10.0.0.6")).is_none());
    }

    #[test]
    fn test_new_routes_are_prepended() {
        let mut table = RouteTable::new();
        table.add("10.0.0.1", "127.0.0.1", 1).unwrap();
        table.add("10.0.0.2", "127.0.0.1", 2).unwrap();
        let order: Vec<IpAddr> = table.iter().map(|r| r.source_ip).collect();
        assert_eq!(order, vec![ip("10.0.0.2"), ip("10.0.0.1")]);
    }

    #[test]
    fn test_readd_idle_route_updates_in_place() {
        let mut table = RouteTable::new();
        table.add("10.0.0.5", "127.0.0.1", 9100).unwrap();
        table.add("10.0.0.9", "127.0.0.1", 9100).unwrap();

        // Re-add with a new target: size unchanged, target fields updated.
        let evicted = table.add("10.0.0.5", "192.168.1.1", 9200).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(table.len(), 2);

        let route = table.lookup_by_ip(ip("10.0.0.5")).unwrap();
        assert_eq!(route.target_ip, ip("192.168.1.1"));
        assert_eq!(route.target_port, 9200);
    }

    #[test]
    fn test_readd_busy_route_reports_eviction() {
        let mut table = RouteTable::new();
        table.add("10.0.0.5", "127.0.0.1", 9100).unwrap();
        assert!(table.bind(ip("10.0.0.5"), 42));
        assert_eq!(table.lookup_by_fd(42).unwrap().source_ip, ip("10.0.0.5"));

        let evicted = table.add("10.0.0.5", "127.0.0.1", 9200).unwrap();
        assert_eq!(evicted, vec![42]);
        assert_eq!(table.len(), 1);

        // The binding is gone and the new target is in effect.
        let route = table.lookup_by_ip(ip("10.0.0.5")).unwrap();
        assert!(route.source_fd().is_none());
        assert_eq!(route.target_port, 9200);
        assert!(table.lookup_by_fd(42).is_none());
    }

    #[test]
    fn test_no_duplicate_sources() {
        let mut table = RouteTable::new();
        table.add("10.0.0.5", "127.0.0.1", 1).unwrap();
        table.add("10.0.0.5", "127.0.0.2", 2).unwrap();
        table.add("10.0.0.5", "127.0.0.3", 3).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.lookup_by_ip(ip("10.0.0.5")).unwrap().target_ip,
            ip("127.0.0.3")
        );
    }

    #[test]
    fn test_clear_binding_is_idempotent() {
        let mut table = RouteTable::new();
        table.add("10.0.0.5", "127.0.0.1", 9100).unwrap();
        table.bind(ip("10.0.0.5"), 7);
        assert!(table.clear_binding(7));
        assert!(!table.clear_binding(7));
        assert!(table.lookup_by_fd(7).is_none());
    }

    #[test]
    fn test_add_rejects_unresolvable_target() {
        let mut table = RouteTable::new();
        assert!(table.add("10.0.0.5", "no such host", 9100).is_err());
        assert!(table.is_empty());
    }
}
