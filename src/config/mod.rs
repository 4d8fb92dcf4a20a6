//! Configuration: sectioned key/value reader and typed view

mod reader;
mod types;

pub use reader::ConfigFile;
pub use types::{load_config, ProxyConfig, SECTION_MAIN, SECTION_ROUTES};
