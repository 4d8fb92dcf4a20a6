//! Typed view over the proxy configuration
//!
//! The core consumes two sections: `[tcp_proxy]` for the listen port and
//! `[tcp_proxy\routes]` for the initial routing table.

use std::path::Path;

use tracing::info;

use super::reader::ConfigFile;
use crate::error::ConfigError;
use crate::routes::RouteSpec;

/// Section holding the listen port.
pub const SECTION_MAIN: &str = "tcp_proxy";

/// Section holding the repeated `route` entries.
pub const SECTION_ROUTES: &str = "tcp_proxy\\routes";

const KEY_PORT: &str = "port";
const KEY_ROUTE: &str = "route";

/// Validated proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen port, 1..=65535.
    pub port: u16,

    /// Route specifications in file order. May be empty; routes can also be
    /// added at runtime through the control channel.
    pub routes: Vec<RouteSpec>,
}

/// Load and validate the proxy configuration.
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, the port is absent or out
/// of range, or any route specification fails to scan.
pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig, ConfigError> {
    let file = ConfigFile::open(path)?;

    let port = file.get_int(SECTION_MAIN, KEY_PORT)?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ConfigError::validation(format!("port {port} is out of range")))?;

    let mut routes = Vec::new();
    let mut bad_route = None;
    file.enumerate(SECTION_ROUTES, KEY_ROUTE, |spec| match RouteSpec::parse(spec) {
        Ok(route) => {
            routes.push(route);
            true
        }
        Err(e) => {
            bad_route = Some(ConfigError::validation(e.to_string()));
            false
        }
    })?;
    if let Some(e) = bad_route {
        return Err(e);
    }

    info!("configuration loaded: port {port}, {} route(s)", routes.len());

    Ok(ProxyConfig { port, routes })
}
