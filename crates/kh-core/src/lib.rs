//! Core data model, persistence, and configuration for the KrakenHashes
//! distributed job-execution engine.
//!
//! Everything the scheduler, sessions, and engine crates share lives here:
//! the job/task/layer entities and their state machines, the SQLite-backed
//! [`store::StoreDb`], typed [`settings::SystemSettings`], the daemon
//! [`config::Config`], and the [`artifacts::ArtifactStore`] boundary.

pub mod artifacts;
pub mod attack;
pub mod config;
pub mod error;
pub mod settings;
pub mod store;
pub mod types;

pub use error::CoreError;
pub use store::StoreDb;
