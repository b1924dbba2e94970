//! Structured logging setup with a reloadable level filter.

use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize logging with a reloadable level. With `json` set the output is
/// one JSON object per line, suitable for log shippers.
pub fn init_tracing(log_level: Option<&str>, json: bool) -> Result<LogHandle> {
    let level = log_level.unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}
