//! Building blocks for event-sourced storage engines: append-only per-
//! stream event logs, per-aggregate metadata documents with a hash-chain
//! CAS, snapshots, checkpointed projections, and live stream migration.
//!
//! The crate ships one reference backend (`InMemory`, present on every
//! store module) usable both for tests and as a fully functional embedded
//! store; real network-backed implementations are expected to live in
//! separate crates implementing the traits defined here.

#![allow(missing_docs)]

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod migration;
pub mod projection;
pub mod resilience;
pub mod scenario;
pub mod serde;
pub mod snapshot;
pub mod stream;
pub mod tag;
#[cfg(feature = "tracing")]
pub mod tracing_support;
pub mod version;
