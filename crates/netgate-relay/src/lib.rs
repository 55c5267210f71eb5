//! netgate relay
//!
//! Turns payment and session events into access changes on fleet routers,
//! with durable follow-up jobs, per-router circuit breakers and an overlay
//! peer reconciler.

pub mod actions;
pub mod audit;
pub mod circuit;
pub mod consumer;
pub mod driver;
pub mod jobs;
pub mod machine;
pub mod overlay;
pub mod provision;
pub mod reconciler;
pub mod runner;
pub mod server;
pub mod storage;
