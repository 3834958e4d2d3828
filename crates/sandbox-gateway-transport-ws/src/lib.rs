#![deny(missing_docs)]
//! HTTP and WebSocket transport for the sandbox gateway.

/// Control surface error mapping.
pub mod error;
/// Relay WebSocket endpoints.
pub mod relay_socket;
/// HTTP control surface.
pub mod routes;
/// Server entrypoint.
pub mod runner;
/// Shared application state.
pub mod state;

pub use routes::router;
pub use runner::run_server;
pub use state::AppState;
