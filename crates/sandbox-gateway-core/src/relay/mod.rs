//! Session relay
//!
//! Rooms keyed by session id, readiness tracking, fan-out and reclamation.

pub mod hub;
pub mod protocol;
pub mod room;

pub use hub::{RelayConnection, SandboxControl, SessionRelay};
pub use protocol::{Binary, ConnectionId, OutputKind, RelayCommand, RelayEvent};
pub use room::{Readiness, Role, RoomTable, Transition};
