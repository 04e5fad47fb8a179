//! Authoritative backend set.
//!
//! # Responsibilities
//! - Track every backend the load balancer should know about
//! - Mark backends disabled (not deleted) when they drop out of membership
//! - Prune disabled entries, which only the reload path is allowed to do
//!
//! # Design Decisions
//! - Disabled entries are tombstones: a backend that flaps back in is
//!   re-enabled in place instead of being re-created, so a flap never looks
//!   like a brand-new registration
//! - An entry's address never changes for the lifetime of its name; a new
//!   address arrives under a new registration name
//! - BTreeMap keeps iteration order stable so rendered configs are
//!   reproducible

use std::collections::BTreeMap;

use serde::Serialize;

/// One upstream server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// Network address the load balancer reaches this backend at
    /// (host or host:port).
    pub address: String,
    /// Whether traffic should be routed to it. Not part of identity.
    pub enabled: bool,
}

/// Outcome of absorbing a membership snapshot into the set.
#[derive(Debug, Clone, Default)]
pub struct AbsorbOutcome {
    /// Names never seen before this snapshot. Non-empty means a reload is
    /// required; the live-patch path cannot add routing slots.
    pub new_names: Vec<String>,
    /// Names that were disabled by this snapshot.
    pub disabled: Vec<String>,
}

impl AbsorbOutcome {
    pub fn saw_new_names(&self) -> bool {
        !self.new_names.is_empty()
    }
}

/// Mapping from registration name to backend, exclusively owned by the
/// reconciliation controller. Collaborators only ever see `&BackendSet`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendSet {
    servers: BTreeMap<String, Backend>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.servers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Backend)> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Names of all backends, enabled or not.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.servers.keys()
    }

    pub fn has_disabled(&self) -> bool {
        self.servers.values().any(|b| !b.enabled)
    }

    /// Fold a resolved membership snapshot into the set.
    ///
    /// Names missing from the snapshot are disabled in place, never removed.
    /// Names present in the snapshot are force-enabled; ones we have never
    /// seen are inserted and reported in the outcome, because adding a
    /// routing slot requires a full reload.
    pub fn absorb(&mut self, snapshot: &BTreeMap<String, String>) -> AbsorbOutcome {
        let mut outcome = AbsorbOutcome::default();

        for (name, backend) in self.servers.iter_mut() {
            if !snapshot.contains_key(name) && backend.enabled {
                backend.enabled = false;
                outcome.disabled.push(name.clone());
            }
        }

        for (name, address) in snapshot {
            match self.servers.get_mut(name) {
                Some(backend) => {
                    // Address is immutable per name; only flip enablement.
                    backend.enabled = true;
                }
                None => {
                    self.servers.insert(
                        name.clone(),
                        Backend {
                            address: address.clone(),
                            enabled: true,
                        },
                    );
                    outcome.new_names.push(name.clone());
                }
            }
        }

        outcome
    }

    /// Drop every disabled entry, returning the removed names.
    ///
    /// Only the reload transition calls this: a reload rewrites the whole
    /// config, so it is the one moment a backend can leave the set cleanly.
    pub fn prune_disabled(&mut self) -> Vec<String> {
        let removed: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, b)| !b.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.servers.remove(name);
        }
        removed
    }

    /// Test/bootstrap helper to seed a backend directly.
    pub fn insert(&mut self, name: impl Into<String>, address: impl Into<String>, enabled: bool) {
        self.servers.insert(
            name.into(),
            Backend {
                address: address.into(),
                enabled,
            },
        );
    }
}
