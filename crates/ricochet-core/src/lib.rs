//! Core types shared across ricochet crates.
//!
//! This crate provides:
//! - The protocol-neutral [`Entity`](entity::Entity) view of an inbound request
//! - Default configuration values
//! - Connection tracking for graceful shutdown

pub mod defaults;
pub mod entity;
pub mod tracker;

pub use entity::{DnsQuestion, Entity, EntityError, HttpEntity, RawEntity};
pub use tracker::{ConnectionGuard, ConnectionTracker};

/// Project name.
pub const PROJECT_NAME: &str = "ricochet";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
