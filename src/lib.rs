//! Preboundary Backend Library
//!
//! Exposes the allocation core for use by binaries and tests.
//! Data loading and persistence of inputs live with the callers;
//! the core only consumes snapshots, episodes and a config.

pub mod preboundary;
