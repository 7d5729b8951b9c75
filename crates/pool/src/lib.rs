//! Sandbox pool: language catalog, packing scheduler, and resource
//! controller.
//!
//! Sessions claim seats with [`Pool::acquire`] and give them back with
//! [`Pool::release`]; up to [`PoolConfig::max_users`] sessions share one
//! sandbox per language before a new one is provisioned. A background
//! [`monitor_loop`] rescales each sandbox's memory/CPU quota from measured
//! usage and reaps idle or unresponsive sandboxes.

mod catalog;
mod config;
mod error;
mod monitor;
mod paths;
mod pool;

pub use catalog::{Artifact, Catalog, HostCompile, LangSpec};
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use monitor::monitor_loop;
pub use paths::{HostPaths, DEFAULT_BASE_DIR};
pub use pool::{Pool, PoolSnapshot, SandboxEntry};
