//! Reconciliation core.
//!
//! # Data Flow
//! ```text
//! membership watcher ──ServersChanged──▶ controller ──reload──▶ Reloader
//!        ▲                                   │
//!        └──────rebuild on session───────────┤
//!                                            ├──patch/stats──▶ Patcher
//!  audit / dirty / clean timers ─────────────┘
//! ```
//!
//! # Design Decisions
//! - The controller is the only writer of the backend set; collaborators
//!   get `&BackendSet` per call
//! - Collaborators are traits so the whole policy is testable with fakes
//! - All transitions run one at a time on a single dispatch loop

pub mod audit;
pub mod backend;
pub mod controller;
pub mod events;

use std::future::Future;
use std::time::Duration;

use crate::core::audit::ServerStat;
use crate::core::backend::BackendSet;

/// Ceiling on how long live state may diverge from the on-disk config.
pub const MAX_DIRTY_TIME: Duration = Duration::from_secs(6 * 3600);

/// Cadence of the runtime-state double-check against the control socket.
pub const AUDIT_INTERVAL: Duration = Duration::from_secs(30);

/// Refresh cadence for the last-clean timestamp while resident in clean.
pub const CLEAN_REFRESH: Duration = Duration::from_secs(5);

/// Retry floor after a failed reload, so a broken load balancer is retried
/// on a timer instead of in a tight loop.
pub const RELOAD_RETRY: Duration = Duration::from_secs(30);

/// Applies a full desired backend set by regenerating, validating and
/// activating the load balancer configuration.
///
/// Implementations must serialize concurrent invocations: at most one
/// reload may run against the load balancer at a time, and a queued caller
/// renders from its own (newer) set once it gets its turn.
pub trait Reloader: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn reload(
        &self,
        trusted_ip: &str,
        untrusted_ips: &[String],
        servers: &BackendSet,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Talks to the load balancer's runtime control socket.
pub trait Patcher: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enable/disable each known backend to match its `enabled` flag.
    /// Never adds or removes routing slots.
    fn sync_server_state(
        &self,
        servers: &BackendSet,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Read-only live per-backend status snapshot.
    fn server_stats(&self) -> impl Future<Output = Result<Vec<ServerStat>, Self::Error>> + Send;
}

/// Handle to the membership watcher owned by the coordination layer.
pub trait MembershipWatch: Send {
    /// Forward a raw child-listing change to the watcher's resolution
    /// logic. The controller never acts on the raw listing directly.
    fn children_changed(&self, names: Vec<String>);

    /// Tear down and recreate the watcher after a session renewal.
    fn rebuild(&mut self);
}
