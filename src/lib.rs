#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: request handlers are inherently long
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Variable naming: domain terms often similar
#![allow(clippy::similar_names)]

//! Herald - clustered real-time messaging server.
//!
//! This crate implements the cluster edge of the server: proxy topics that
//! mirror a master topic hosted on another node, and the HTTP frontend with
//! its media (large file) pipeline.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::registry` - Process-wide handles and teardown hooks
//!
//! ## Messaging
//! - `types` - Ids, access modes, wire messages
//! - `session` - Client sessions and the session store
//! - `topic` - Topic state and the proxy-topic event loop
//! - `hub` - Topic registry and self-eviction sink
//! - `cluster` - Facade over the cluster transport
//!
//! ## Edge
//! - `net::http` - Listener lifecycle and graceful shutdown
//! - `net::tls` - TLS material loading and hot reload
//! - `net::middleware` - HSTS, cache-control, JSON error envelope
//! - `net::status` - Debug dump endpoint
//! - `auth` - HTTP request authentication
//! - `media` - Upload/download pipeline and orphan GC
//!
//! ## Operations
//! - `ops::telemetry` - Logging setup
//! - `ops::stats` - Statistics counters
//! - `users` - Per-user counter cache

// Core infrastructure
pub mod core;

// Messaging
pub mod cluster;
pub mod hub;
pub mod session;
pub mod topic;
pub mod types;

// Edge
pub mod auth;
pub mod media;
pub mod net;

// Operations
pub mod ops;
pub mod users;

// CLI
pub mod cli;

// Re-exports for convenience
pub use crate::core::{config, registry};
pub use crate::core::{Config, Globals};
