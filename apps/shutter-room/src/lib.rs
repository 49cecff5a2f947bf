//! Room coordination for multi-device camera control.
//!
//! Devices connect over a WebSocket to an account-scoped room, take the
//! exclusive `controller` or a shared `participant` slot, and the controller
//! may hold a time-bounded operational lease. [`rooms::RoomHub`] owns all
//! room state; [`session`] runs one protocol loop per socket and
//! [`sweeper`] revokes leases that stop being renewed.

pub mod broadcast;
pub mod config;
pub mod principal;
pub mod protocol;
pub mod rooms;
pub mod routes;
pub mod session;
pub mod sweeper;

pub use config::{Cli, RoomConfig, ServerConfig};
pub use rooms::RoomHub;
pub use routes::{build_router, AppState};
pub use sweeper::{spawn_sweeper, SweeperHandle};
