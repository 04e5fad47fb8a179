//! Directory-backed registration tree.
//!
//! A registration path maps to a directory and each child node to a file
//! holding the registration JSON. This is the built-in `Registry` used for
//! local deployments and tests; remote coordination clients implement the
//! same trait and plug in at the same seam.
//!
//! Changes are detected by polling the directory listing; polling doubles
//! as the change notification the watcher consumes, so no file-event
//! machinery is needed.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::core::events::WatchEvent;
use crate::watch::Registry;

#[derive(Clone)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    /// Open the registration tree rooted at `root`, verifying it is a
    /// readable directory. Failure here is a setup error and retried by
    /// the top-level supervisor.
    pub async fn connect(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    fn node_dir(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Poll the child listing under `path`, emitting `ChildrenChanged`
    /// whenever it differs from the last one seen (including the first).
    pub fn watch(
        &self,
        path: String,
        poll: Duration,
        events: mpsc::UnboundedSender<WatchEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<BTreeSet<String>> = None;

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {}
                }

                let names = match registry.children(&path).await {
                    Ok(names) => names,
                    Err(e) => {
                        tracing::warn!(path = %path, error = %e, "failed to list registration nodes");
                        continue;
                    }
                };

                let current: BTreeSet<String> = names.iter().cloned().collect();
                if last.as_ref() != Some(&current) {
                    last = Some(current);
                    if events.send(WatchEvent::ChildrenChanged(names)).is_err() {
                        return;
                    }
                }
            }
        })
    }
}

async fn list_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

impl Registry for DirRegistry {
    type Error = io::Error;

    async fn children(&self, path: &str) -> io::Result<Vec<String>> {
        list_dir(&self.node_dir(path)).await
    }

    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.node_dir(path)).await
    }
}
