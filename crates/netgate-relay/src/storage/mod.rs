//! `SQLite` storage for the netgate relay.
//!
//! Provides persistence for the device registry, peer bindings and the
//! `SQLite` job store backend.

mod db;
mod models;
mod queries_devices;
mod queries_jobs;


pub use db::RelayDatabase;
pub use models::*;
pub use netgate_core::db::DatabaseError;
pub use queries_devices::DeviceParams;
pub use queries_jobs::NewJobParams;
