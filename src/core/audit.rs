//! Runtime state audit.
//!
//! # Responsibilities
//! - Compare live per-backend status from the control socket against the
//!   authoritative backend set
//! - Classify each discrepancy as structural (needs a reload) or
//!   enablement-only (fixable with a live patch)
//!
//! # Design Decisions
//! - `check_stats` is a pure function with no clock and no I/O; it is the
//!   unit-test surface for the whole reconciliation policy
//! - Mismatches carry the fields that drove the decision so a log line is
//!   enough to diagnose them

use serde::Serialize;

use crate::core::backend::BackendSet;

/// One row of live per-backend status, as reported by the load balancer's
/// control socket.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStat {
    /// Proxy (backend section) the server belongs to.
    pub pxname: String,
    /// Server name inside the section; matches the registration name.
    pub svname: String,
    /// Load balancer status string ("UP", "DOWN", "MAINT", ...).
    pub status: String,
    /// "ip:port" the server is configured at, when the load balancer
    /// version reports it.
    pub addr: Option<String>,
}

impl ServerStat {
    /// Administratively drained, as opposed to merely failing checks.
    pub fn is_maint(&self) -> bool {
        self.status.starts_with("MAINT")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MismatchReason {
    /// Live server name is not in the backend set at all.
    NoServer,
    /// Live server sits at a different address than expected.
    AddrMismatch,
    /// Expected enabled, live state says administratively down.
    WantEnabled,
    /// Expected disabled, live state says routable.
    WantDisabled,
}

impl MismatchReason {
    /// Structural mismatches cannot be fixed over the control socket.
    pub fn is_structural(self) -> bool {
        matches!(self, MismatchReason::NoServer | MismatchReason::AddrMismatch)
    }
}

/// A single discrepancy between live state and expectation.
#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub name: String,
    pub status: String,
    pub addr: Option<String>,
    pub reason: MismatchReason,
}

/// Result of auditing one live snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub wrong: Vec<Mismatch>,
    /// True iff any mismatch was structural.
    pub reload: bool,
}

impl AuditReport {
    pub fn in_sync(&self) -> bool {
        self.wrong.is_empty()
    }
}

fn addr_matches(live: &str, expected: &str) -> bool {
    // The live field is "ip:port"; the expected address may or may not
    // carry a port.
    live == expected || live.starts_with(&format!("{expected}:"))
}

/// Compare live server status against the authoritative set.
///
/// Deterministic and side-effect free: same inputs, same report.
pub fn check_stats(stats: &[ServerStat], servers: &BackendSet) -> AuditReport {
    let mut report = AuditReport::default();

    for stat in stats {
        let Some(backend) = servers.get(&stat.svname) else {
            // A server we have never heard of means the running config is
            // badly out of sync with the set.
            report.push(stat, MismatchReason::NoServer);
            report.reload = true;
            continue;
        };

        if let Some(addr) = &stat.addr {
            if !addr_matches(addr, &backend.address) {
                report.push(stat, MismatchReason::AddrMismatch);
                report.reload = true;
                continue;
            }
        }

        if backend.enabled && stat.is_maint() {
            report.push(stat, MismatchReason::WantEnabled);
            continue;
        }
        if !backend.enabled && !stat.is_maint() {
            report.push(stat, MismatchReason::WantDisabled);
        }
    }

    report
}

impl AuditReport {
    fn push(&mut self, stat: &ServerStat, reason: MismatchReason) {
        self.wrong.push(Mismatch {
            name: stat.svname.clone(),
            status: stat.status.clone(),
            addr: stat.addr.clone(),
            reason,
        });
    }
}
