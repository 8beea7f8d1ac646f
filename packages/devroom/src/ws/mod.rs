//! Workspace WebSocket
//!
//! One connection per attached client. Inbound frames become session
//! operations; relay and sandbox events become outbound frames.

mod handler;
mod protocol;

pub use handler::handle_workspace_ws;
