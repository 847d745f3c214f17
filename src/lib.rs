//! Trajectory Library
//!
//! Exposes the cache store, data adapters and refresh pipeline for the binary
//! and for integration tests.

pub mod cache;
pub mod cli;
pub mod clock;
pub mod data;
pub mod refresh;
