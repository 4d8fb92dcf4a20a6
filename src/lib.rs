//! tcp-router: source-IP-routed TCP reverse proxy
//!
//! A single-threaded, readiness-driven TCP forwarder. Clients are matched
//! against a routing table by source IP; each accepted connection is paired
//! with a non-blocking connect to its route's target, and bytes are shuttled
//! in both directions through small per-direction staging buffers until
//! either side disconnects. A named-fifo control channel lets an operator
//! add routes or stop the process at runtime.
//!
//! # Architecture
//!
//! ```text
//! client ──> listener ──> route lookup ──> target connect
//!                │                              │
//!                └────── forwarding pair ───────┘
//!                     (reactor, poll-driven)
//! ```
//!
//! # Modules
//!
//! - [`config`]: sectioned key/value configuration reader
//! - [`control`]: command fifo and the operator command grammar
//! - [`engine`]: connection pairing, forwarding discipline, event loop
//! - [`error`]: error types
//! - [`instance`]: single-instance advisory lock
//! - [`net`]: socket construction and the non-blocking/keepalive policy
//! - [`reactor`]: descriptor slots, interest sets, readiness wait
//! - [`routes`]: routing table and host resolution

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod instance;
pub mod net;
pub mod reactor;
pub mod routes;

// Re-export commonly used types at the crate root
pub use config::{load_config, ConfigFile, ProxyConfig};
pub use control::{base_name, Command, ControlChannel, RuntimePaths};
pub use engine::Proxy;
pub use error::{
    ConfigError, ControlError, ReactorError, RouteError, TcpRouterError,
};
pub use instance::InstanceLock;
pub use reactor::{Handler, Reactor, Readiness, Slot, SlotSource, BUFFER_SIZE, MAX_DESCRIPTORS};
pub use routes::{resolve_host, Route, RouteSpec, RouteTable};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
