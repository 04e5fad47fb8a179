//! Event types flowing into the controller.

use std::collections::BTreeMap;

/// Emitted by the membership watcher layer.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Raw child-node listing under the watched path changed. Forwarded to
    /// the watcher's resolution logic, not acted on directly.
    ChildrenChanged(Vec<String>),
    /// Resolved backend map (registration name to address). The sole
    /// trigger for the reconciliation algorithm.
    ServersChanged(BTreeMap<String, String>),
}

/// Emitted by the coordination session layer on initial connect and every
/// reconnect. Always forces a watcher rebuild.
#[derive(Debug, Clone, Copy)]
pub struct SessionEvent;
