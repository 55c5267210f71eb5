//! netgate Core Library
//!
//! Shared functionality for netgate components:
//! - Configuration resolution and startup validation
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Counters and plain-text metrics exposition
//! - HMAC request signing
//! - Injectable wall clock

pub mod clock;
pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod metrics;
pub mod signature;
pub mod tracing_init;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
