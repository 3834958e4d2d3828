#![deny(missing_docs)]
//! Sandbox gateway core library.
//!
//! Sandbox lifecycle, agent bootstrap and the session relay, independent of
//! any transport.

/// Configuration management.
pub mod config;
/// Session relay: rooms, readiness and fan-out.
pub mod relay;
/// Sandbox lifecycle on top of a container runtime.
pub mod sandbox;

/// In-memory runtime driver for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
