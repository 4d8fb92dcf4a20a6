//! Error types for tcp-router
//!
//! Errors are grouped by subsystem: configuration, routing, the readiness
//! reactor, and the control channel. The top-level [`TcpRouterError`] wraps
//! all of them for the startup path; steady-state handlers classify raw
//! `io::Error`s directly (see [`is_transient`]).

use std::io;

use thiserror::Error;

/// Top-level error type for tcp-router
#[derive(Debug, Error)]
pub enum TcpRouterError {
    /// Configuration errors (file parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Routing table errors (resolution, route specs)
    #[error("routing error: {0}")]
    Route(#[from] RouteError),

    /// Readiness reactor errors
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// Control channel errors
    #[error("control channel error: {0}")]
    Control(#[from] ControlError),

    /// Another process already holds the instance lock
    #[error("another instance of {name} is already running")]
    AlreadyRunning { name: String },

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Malformed line, section, or value
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A required key is missing
    #[error("missing configuration value '{name}' in section [{section}]")]
    Missing { section: String, name: String },

    /// Structurally valid but semantically wrong (bad port, bad route spec)
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// I/O error while reading the file
    #[error("configuration I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConfigError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Routing table errors
#[derive(Debug, Error)]
pub enum RouteError {
    /// Route specification did not scan as `<source> <target>:<port>`
    #[error("invalid route specification: \"{0}\"")]
    InvalidSpec(String),

    /// Host name resolution failed outright
    #[error("failed to resolve host '{host}': {reason}")]
    Resolve { host: String, reason: String },

    /// Resolution succeeded but produced no usable address
    #[error("no IPv4 or IPv6 addresses available for '{host}'")]
    NoAddresses { host: String },

    /// Target port outside 1..=65535
    #[error("invalid target port {0}")]
    InvalidPort(u32),
}

impl RouteError {
    /// Create a resolve error
    pub fn resolve(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

/// Readiness reactor errors
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Descriptor number at or above the reactor ceiling
    #[error("descriptor {fd} exceeds the reactor limit of {limit}")]
    DescriptorLimit { fd: i32, limit: usize },

    /// Register called for a descriptor that already has a slot
    #[error("descriptor {fd} is already registered")]
    SlotOccupied { fd: i32 },

    /// The blocking readiness wait itself failed
    #[error("poll failed: {0}")]
    Wait(#[from] io::Error),
}

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// mkfifo failed
    #[error("failed to create command fifo at {path}: {reason}")]
    Create { path: String, reason: String },

    /// Opening the fifo read-only non-blocking failed
    #[error("failed to open command fifo at {path}: {reason}")]
    Open { path: String, reason: String },

    /// Verb not in the command grammar
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),

    /// Known verb with malformed arguments
    #[error("invalid command \"{0}\": {1}")]
    InvalidCommand(String, String),
}

/// Whether an I/O error is a transient non-blocking condition.
///
/// Transient errors are returned from quietly: the reactor will redeliver
/// readiness. Everything else tears the affected pair down.
#[must_use]
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Type alias for Result with TcpRouterError
pub type Result<T> = std::result::Result<T, TcpRouterError>;
