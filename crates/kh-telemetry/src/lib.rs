//! Tracing/logging bootstrap for the KrakenHashes coordinator.

pub mod logging;
