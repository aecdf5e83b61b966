//! Spinhost - a multi-tenant application host
//!
//! This library launches and supervises per-tenant application processes
//! ("spinlets"):
//! - Allocates each spinlet a port from a shared pool
//! - Launches it through a per-framework strategy and waits for readiness
//! - Watches liveness and samples cpu/memory while it runs
//! - Stops it after a period of inactivity, reconciling timers lost in a crash
//! - Builds source trees into launchable artifacts through a bounded queue
//!
//! All durable state lives behind the [`store::ResourceStore`] trait.

pub mod build_queue;
pub mod builder;
pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod health;
pub mod launcher;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod spinfile;
pub mod spinlet;
pub mod store;
pub mod ticker;
pub mod usage;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
