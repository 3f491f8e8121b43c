//! Application layer for httpws-server.
//!
//! Knows *what* happens on a WebSocket connection, not how bytes get there.
//!
//! - [`hub`] keeps the set of open connections and fans messages out to them.
//! - [`echo`] is the [`httpws_core::WsHandler`] wired to the upgrade path.
//! - [`status`] builds the periodic status snapshot and pushes it to everyone.

pub mod echo;
pub mod hub;
pub mod status;

pub use echo::{EchoApp, NEXT_TOKEN};
pub use hub::Hub;
pub use status::{run_status_loop, StatusBroadcaster, StatusSnapshot};
