//! eslog daemon library.
//!
//! Exposes the daemon modules for integration testing.
//! In production, `eslog-daemon` is used as a binary (main.rs).

pub mod cli;
pub mod logging;
pub mod metrics_server;
pub mod plugin_api;
