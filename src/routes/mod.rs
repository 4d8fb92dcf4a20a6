//! Source-IP routing: specifications, resolution, and the live table

mod resolver;
mod table;

pub use resolver::{pick_target, resolve_host};
pub use table::{Inserted, Route, RouteSpec, RouteTable};
