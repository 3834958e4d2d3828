//! In-sandbox agent
//!
//! Dials the gateway's relay, keeps an interactive shell running and applies
//! file and archive events under its work root.

#![deny(missing_docs)]

pub mod connection;
pub mod files;
pub mod settings;
pub mod shell;

pub use connection::{Agent, ConnectionState};
pub use settings::AgentSettings;
