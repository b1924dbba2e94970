//! Core infrastructure: configuration and the process-wide registry.

pub mod config;
pub mod registry;

pub use config::Config;
pub use registry::Globals;
