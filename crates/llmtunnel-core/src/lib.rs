//! `llmtunnel` Core Library
//!
//! Shared functionality for `llmtunnel` components:
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Injectable wall clock
//! - JSON configuration loading
//! - Tracing and Prometheus recorder initialisation

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
#[cfg(feature = "prometheus")]
pub mod metrics;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
