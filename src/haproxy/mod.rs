//! HAProxy collaborators: config reload pipeline and runtime control
//! socket.
//!
//! # Data Flow
//! ```text
//! controller ──reload(set)──▶ manager: render → write tmp → check → rename → reload cmd
//! controller ──patch/stats──▶ sock:    enable/disable server, show stat
//! ```

pub mod manager;
pub mod sock;

/// Name of the rendered backend section; the control socket addresses
/// servers as `<section>/<name>`.
pub const BACKEND_SECTION: &str = "servers";
