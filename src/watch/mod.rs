//! Membership watching.
//!
//! # Responsibilities
//! - Map a service domain to its registration path
//! - Resolve raw child listings into a name → address backend map
//! - Coalesce rapid bursts of child changes before resolving
//!
//! # Design Decisions
//! - The coordination-service client sits behind the `Registry` trait; this
//!   crate does not speak any coordination wire protocol itself
//! - Resolution runs on its own task so the controller never blocks on
//!   node reads; results come back through the same ordered event channel
//! - A node that fails to read or parse is skipped with a warning rather
//!   than failing the whole snapshot

pub mod dir;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::core::events::WatchEvent;
use crate::core::MembershipWatch;

/// Quiet period before a burst of child changes is resolved. Only the
/// newest listing in a burst is looked at.
const COALESCE_WINDOW: Duration = Duration::from_millis(250);

/// Read access to the registration tree, implemented by whichever
/// coordination client is wired in.
pub trait Registry: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// List child node names under a path.
    fn children(&self, path: &str)
        -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

    /// Read the contents of a registration node.
    fn read(&self, path: &str) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

/// "webapi.us-east.example.com" registers under
/// "/com/example/us-east/webapi".
pub fn domain_to_path(domain: &str) -> String {
    let mut path = String::new();
    for label in domain.split('.').rev() {
        path.push('/');
        path.push_str(label);
    }
    path
}

/// A registration node's payload.
#[derive(Debug, Deserialize)]
struct Registration {
    #[serde(rename = "type", default)]
    kind: String,
    address: String,
    #[serde(default)]
    port: Option<u16>,
}

impl Registration {
    fn is_routable(&self) -> bool {
        self.kind.is_empty() || self.kind == "host" || self.kind == "load_balancer"
    }

    fn backend_address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.address, port),
            None => self.address.clone(),
        }
    }
}

/// Resolves child listings to backend maps on a background task.
///
/// Rebuilt from scratch on every session renewal, dropping any resolution
/// that was in flight under the old session.
pub struct ServerWatcher<R: Registry> {
    registry: R,
    path: String,
    out: mpsc::UnboundedSender<WatchEvent>,
    tx: mpsc::UnboundedSender<Vec<String>>,
    task: JoinHandle<()>,
}

impl<R: Registry> ServerWatcher<R> {
    pub fn new(registry: R, path: impl Into<String>, out: mpsc::UnboundedSender<WatchEvent>) -> Self {
        let path = path.into();
        let (tx, task) = spawn_resolver(registry.clone(), path.clone(), out.clone());
        Self {
            registry,
            path,
            out,
            tx,
            task,
        }
    }
}

impl<R: Registry> MembershipWatch for ServerWatcher<R> {
    fn children_changed(&self, names: Vec<String>) {
        // Receiver only goes away when the watcher is rebuilt under us.
        let _ = self.tx.send(names);
    }

    fn rebuild(&mut self) {
        self.task.abort();
        let (tx, task) = spawn_resolver(self.registry.clone(), self.path.clone(), self.out.clone());
        self.tx = tx;
        self.task = task;
    }
}

impl<R: Registry> Drop for ServerWatcher<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_resolver<R: Registry>(
    registry: R,
    path: String,
    out: mpsc::UnboundedSender<WatchEvent>,
) -> (mpsc::UnboundedSender<Vec<String>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(resolve_loop(registry, path, rx, out));
    (tx, task)
}

async fn resolve_loop<R: Registry>(
    registry: R,
    path: String,
    mut rx: mpsc::UnboundedReceiver<Vec<String>>,
    out: mpsc::UnboundedSender<WatchEvent>,
) {
    while let Some(mut names) = rx.recv().await {
        // Coalesce: registrations arrive in bursts during deploys; only
        // the newest listing matters.
        loop {
            match time::timeout(COALESCE_WINDOW, rx.recv()).await {
                Ok(Some(newer)) => names = newer,
                Ok(None) | Err(_) => break,
            }
        }

        let map = resolve(&registry, &path, &names).await;
        tracing::debug!(children = names.len(), resolved = map.len(), "resolved membership");
        if out.send(WatchEvent::ServersChanged(map)).is_err() {
            return;
        }
    }
}

async fn resolve<R: Registry>(
    registry: &R,
    path: &str,
    names: &[String],
) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for name in names {
        let node_path = format!("{path}/{name}");
        let data = match registry.read(&node_path).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "failed to read registration node");
                continue;
            }
        };
        match serde_json::from_slice::<Registration>(&data) {
            Ok(reg) if reg.is_routable() => {
                map.insert(name.clone(), reg.backend_address());
            }
            Ok(reg) => {
                tracing::debug!(node = %node_path, kind = %reg.kind, "skipping non-routable registration");
            }
            Err(e) => {
                tracing::warn!(node = %node_path, error = %e, "malformed registration node");
            }
        }
    }
    map
}
