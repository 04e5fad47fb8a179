//! The reconciliation state machine.
//!
//! # Responsibilities
//! - Own the authoritative backend set and the last-clean timestamp
//! - Decide live patch vs full reload for every change
//! - Bound how long live state may drift from the on-disk config
//! - Periodically audit the load balancer's runtime state
//!
//! # Design Decisions
//! - One `tokio::select!` dispatch loop; every event source is mapped to a
//!   typed `Event` and handled to completion before the next is taken, so
//!   no handler ever observes the backend set mid-mutation
//! - Collaborator failures become transition decisions (retry, downgrade,
//!   stay dirty); nothing here terminates the process
//! - A failed reload parks in dirty and is retried by the next event or
//!   timer rather than immediately, so an unreachable load balancer is
//!   reported on a cadence instead of spinning

use std::collections::BTreeMap;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::core::audit::{check_stats, ServerStat};
use crate::core::backend::BackendSet;
use crate::core::events::{SessionEvent, WatchEvent};
use crate::core::{
    MembershipWatch, Patcher, Reloader, AUDIT_INTERVAL, CLEAN_REFRESH, MAX_DIRTY_TIME, RELOAD_RETRY,
};

/// Sub-state while the watcher is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    /// Backend set matches the on-disk config.
    Clean,
    /// Enablement changes applied over the control socket only.
    Dirty,
}

/// Typed union of everything that can request a transition.
#[derive(Debug)]
enum Event {
    ChildrenChanged(Vec<String>),
    ServersChanged(BTreeMap<String, String>),
    SessionRenewed,
    AuditTick,
    CleanTick,
    DirtyDeadline,
    Shutdown,
}

/// The long-lived supervisory loop. Constructed once per established
/// coordination session and driven until shutdown.
pub struct Controller<W, R, P> {
    trusted_ip: String,
    untrusted_ips: Vec<String>,

    servers: BackendSet,
    activity: Activity,
    last_clean: Instant,
    dirty_deadline: Option<Instant>,

    watcher: W,
    reloader: R,
    patcher: P,

    events: mpsc::UnboundedReceiver<WatchEvent>,
    sessions: mpsc::UnboundedReceiver<SessionEvent>,
}

impl<W, R, P> Controller<W, R, P>
where
    W: MembershipWatch,
    R: Reloader,
    P: Patcher,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trusted_ip: impl Into<String>,
        untrusted_ips: Vec<String>,
        watcher: W,
        reloader: R,
        patcher: P,
        events: mpsc::UnboundedReceiver<WatchEvent>,
        sessions: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        Self {
            trusted_ip: trusted_ip.into(),
            untrusted_ips,
            servers: BackendSet::new(),
            activity: Activity::Clean,
            // The clock starts at construction: a daemon that never gets
            // clean still reloads within one dirty budget of startup.
            last_clean: Instant::now(),
            dirty_deadline: None,
            watcher,
            reloader,
            patcher,
            events,
            sessions,
        }
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut audit = time::interval(AUDIT_INTERVAL);
        audit.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clean = time::interval(CLEAN_REFRESH);
        clean.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Far-future stand-in keeps the deadline branch well-formed
            // while no deadline is armed.
            let deadline = self.dirty_deadline;
            let parked = Instant::now() + Duration::from_secs(24 * 3600);

            let event = tokio::select! {
                _ = shutdown.recv() => Event::Shutdown,
                Some(ev) = self.events.recv() => match ev {
                    WatchEvent::ChildrenChanged(names) => Event::ChildrenChanged(names),
                    WatchEvent::ServersChanged(map) => Event::ServersChanged(map),
                },
                Some(SessionEvent) = self.sessions.recv() => Event::SessionRenewed,
                _ = audit.tick() => Event::AuditTick,
                _ = clean.tick() => Event::CleanTick,
                _ = time::sleep_until(deadline.unwrap_or(parked)), if deadline.is_some() => {
                    Event::DirtyDeadline
                }
            };

            match event {
                Event::Shutdown => {
                    tracing::info!("controller received shutdown signal, exiting loop");
                    return;
                }
                Event::ChildrenChanged(names) => {
                    tracing::debug!(children = names.len(), "child listing changed");
                    self.watcher.children_changed(names);
                }
                Event::ServersChanged(map) => self.servers_changed(map).await,
                Event::SessionRenewed => {
                    tracing::info!("coordination session renewed, rebuilding watcher");
                    self.watcher.rebuild();
                }
                Event::AuditTick => self.audit().await,
                Event::CleanTick => {
                    // Tracks "most recent instant spent clean", not "instant
                    // first entered clean".
                    if self.activity == Activity::Clean {
                        self.last_clean = Instant::now();
                    }
                }
                Event::DirtyDeadline => self.dirty_deadline_fired().await,
            }
        }
    }

    /// Current authoritative set; exposed for status reporting.
    pub fn backends(&self) -> &BackendSet {
        &self.servers
    }

    /// The reconciliation algorithm for a resolved membership snapshot.
    async fn servers_changed(&mut self, snapshot: BTreeMap<String, String>) {
        let outcome = self.servers.absorb(&snapshot);

        if !outcome.disabled.is_empty() {
            tracing::info!(backends = ?outcome.disabled, "backends left membership, disabling");
        }

        if outcome.saw_new_names() {
            // Adding a routing slot is only safe through a full reload.
            tracing::info!(backends = ?outcome.new_names, "new backends registered, reload required");
            self.to_reload().await;
        } else {
            self.to_dirty().await;
        }
    }

    /// Periodic double-check of the load balancer's runtime state.
    async fn audit(&mut self) {
        if self.servers.is_empty() {
            return;
        }

        tracing::trace!("periodic check of load balancer server state");
        let stats = match self.patcher.server_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                // Conservative: try to re-sync over the socket; the patch
                // path escalates to a reload on its own if that also fails.
                tracing::error!(error = %e, "failed to query control socket during periodic check");
                self.to_dirty().await;
                return;
            }
        };

        let report = check_stats(&stats, &self.servers);
        let missing = self.missing_from_live(&stats);

        if report.in_sync() && missing.is_empty() {
            tracing::trace!("periodic check ok");
            return;
        }

        tracing::warn!(
            wrong = ?report.wrong,
            missing = ?missing,
            "load balancer server state out of sync during periodic check"
        );

        if report.reload || !missing.is_empty() {
            self.to_reload().await;
        } else {
            self.to_dirty().await;
        }
    }

    /// Enabled backends the load balancer does not know at all. A live
    /// patch cannot create slots, so these always force a reload; this is
    /// also what retries a reload that previously failed.
    fn missing_from_live(&self, stats: &[ServerStat]) -> Vec<String> {
        self.servers
            .iter()
            .filter(|(name, b)| b.enabled && !stats.iter().any(|s| &s.svname == *name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn dirty_deadline_fired(&mut self) {
        self.dirty_deadline = None;
        // Soft deadline: a flap that self-resolved must not force a reload.
        if self.servers.has_disabled() {
            tracing::info!(
                "dirty changes persisted for the full dirty budget, reloading"
            );
            self.to_reload().await;
        }
    }

    /// Enter `dirty`: apply enablement over the control socket, bounded by
    /// the dirty-duration budget.
    async fn to_dirty(&mut self) {
        self.activity = Activity::Dirty;

        let elapsed = self.last_clean.elapsed();
        if elapsed >= MAX_DIRTY_TIME && self.servers.has_disabled() {
            // Budget already spent; skip straight to the reload.
            self.to_reload().await;
            return;
        }
        self.dirty_deadline = Some(Instant::now() + MAX_DIRTY_TIME.saturating_sub(elapsed));

        match self.patcher.sync_server_state(&self.servers).await {
            Ok(()) => {
                tracing::info!(backends = self.servers.len(), "lb updated using control socket");
                if !self.servers.has_disabled() {
                    self.set_clean();
                }
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to sync server state over control socket, falling back to reload"
                );
                self.to_reload().await;
            }
        }
    }

    /// Enter `reload`: prune tombstones and regenerate the full config.
    async fn to_reload(&mut self) {
        let removed = self.servers.prune_disabled();
        if !removed.is_empty() {
            tracing::info!(backends = ?removed, "pruned disabled backends ahead of reload");
        }

        let result = self
            .reloader
            .reload(&self.trusted_ip, &self.untrusted_ips, &self.servers)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(backends = self.servers.len(), "lb config reloaded");
                self.set_clean();
            }
            Err(e) => {
                tracing::error!(error = %e, "lb reload failed, staying dirty");
                self.activity = Activity::Dirty;
                let remaining = MAX_DIRTY_TIME
                    .saturating_sub(self.last_clean.elapsed())
                    .max(RELOAD_RETRY);
                self.dirty_deadline = Some(Instant::now() + remaining);
            }
        }
    }

    fn set_clean(&mut self) {
        self.activity = Activity::Clean;
        self.dirty_deadline = None;
        self.last_clean = Instant::now();
    }
}
