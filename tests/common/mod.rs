//! Shared utilities for integration testing: fake collaborators and a
//! controller harness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use haproxy_sync::core::audit::ServerStat;
use haproxy_sync::core::backend::BackendSet;
use haproxy_sync::core::controller::Controller;
use haproxy_sync::core::events::{SessionEvent, WatchEvent};
use haproxy_sync::core::{MembershipWatch, Patcher, Reloader};
use haproxy_sync::lifecycle::Shutdown;

#[derive(Debug, thiserror::Error)]
#[error("injected failure")]
pub struct InjectedFailure;

/// Simulated live load balancer shared between the fake reloader and
/// patcher, so audits observe what reloads and patches actually did.
#[derive(Default)]
pub struct LbState {
    /// name -> (address, in maintenance)
    pub live: BTreeMap<String, (String, bool)>,
    pub reloads: Vec<BackendSet>,
    pub syncs: Vec<BackendSet>,
    /// Extra rows appended to every stats reply (for unknown-server
    /// scenarios).
    pub extra_stats: Vec<ServerStat>,
}

#[derive(Clone, Default)]
pub struct FakeLb {
    pub state: Arc<Mutex<LbState>>,
    pub fail_reload: Arc<AtomicBool>,
    pub fail_sync: Arc<AtomicBool>,
    pub fail_stats: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl FakeLb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reload_count(&self) -> usize {
        self.state.lock().unwrap().reloads.len()
    }

    pub fn sync_count(&self) -> usize {
        self.state.lock().unwrap().syncs.len()
    }

    pub fn last_reload(&self) -> Option<BackendSet> {
        self.state.lock().unwrap().reloads.last().cloned()
    }

    pub fn last_sync(&self) -> Option<BackendSet> {
        self.state.lock().unwrap().syncs.last().cloned()
    }

    pub fn inject_stat(&self, stat: ServerStat) {
        self.state.lock().unwrap().extra_stats.push(stat);
    }

    pub fn clear_injected(&self) {
        self.state.lock().unwrap().extra_stats.clear();
    }

    /// Force a live server into maintenance behind the controller's back.
    pub fn force_maint(&self, name: &str, maint: bool) {
        if let Some(entry) = self.state.lock().unwrap().live.get_mut(name) {
            entry.1 = maint;
        }
    }

    pub fn live_maint(&self, name: &str) -> Option<bool> {
        self.state.lock().unwrap().live.get(name).map(|e| e.1)
    }
}

impl Reloader for FakeLb {
    type Error = InjectedFailure;

    async fn reload(
        &self,
        _trusted_ip: &str,
        _untrusted_ips: &[String],
        servers: &BackendSet,
    ) -> Result<(), InjectedFailure> {
        let mut state = self.state.lock().unwrap();
        state.reloads.push(servers.clone());
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(InjectedFailure);
        }
        state.live = servers
            .iter()
            .map(|(name, b)| (name.clone(), (b.address.clone(), !b.enabled)))
            .collect();
        Ok(())
    }
}

impl Patcher for FakeLb {
    type Error = InjectedFailure;

    async fn sync_server_state(&self, servers: &BackendSet) -> Result<(), InjectedFailure> {
        let mut state = self.state.lock().unwrap();
        state.syncs.push(servers.clone());
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(InjectedFailure);
        }
        for (name, backend) in servers.iter() {
            match state.live.get_mut(name) {
                Some(entry) => entry.1 = !backend.enabled,
                // A slot the lb does not have is a rejected command.
                None => return Err(InjectedFailure),
            }
        }
        Ok(())
    }

    async fn server_stats(&self) -> Result<Vec<ServerStat>, InjectedFailure> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(InjectedFailure);
        }
        let state = self.state.lock().unwrap();
        let mut stats: Vec<ServerStat> = state
            .live
            .iter()
            .map(|(name, (address, maint))| ServerStat {
                pxname: "servers".into(),
                svname: name.clone(),
                status: if *maint { "MAINT" } else { "UP" }.into(),
                addr: Some(address.clone()),
            })
            .collect();
        stats.extend(state.extra_stats.iter().cloned());
        Ok(stats)
    }
}

/// Watcher handle that only records what the controller asked of it.
#[derive(Clone, Default)]
pub struct FakeWatch {
    pub forwarded: Arc<Mutex<Vec<Vec<String>>>>,
    pub rebuilds: Arc<AtomicUsize>,
}

impl MembershipWatch for FakeWatch {
    fn children_changed(&self, names: Vec<String>) {
        self.forwarded.lock().unwrap().push(names);
    }

    fn rebuild(&mut self) {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }
}

/// A controller running against fakes, driven through its event channels.
pub struct Harness {
    pub lb: FakeLb,
    pub watch: FakeWatch,
    pub events: mpsc::UnboundedSender<WatchEvent>,
    pub sessions: mpsc::UnboundedSender<SessionEvent>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

#[allow(dead_code)]
impl Harness {
    pub fn spawn() -> Self {
        let lb = FakeLb::new();
        let watch = FakeWatch::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let shutdown = Shutdown::new();

        let controller = Controller::new(
            "10.77.77.7",
            vec!["192.0.2.10".to_string()],
            watch.clone(),
            lb.clone(),
            lb.clone(),
            events_rx,
            sessions_rx,
        );
        let task = tokio::spawn(controller.run(shutdown.subscribe()));

        Self {
            lb,
            watch,
            events: events_tx,
            sessions: sessions_tx,
            shutdown,
            task,
        }
    }

    pub fn servers_changed(&self, entries: &[(&str, &str)]) {
        let map: BTreeMap<String, String> = entries
            .iter()
            .map(|(n, a)| (n.to_string(), a.to_string()))
            .collect();
        self.events
            .send(WatchEvent::ServersChanged(map))
            .expect("controller gone");
    }

    /// Let the controller loop drain pending events. Time is paused in
    /// these tests, so this only yields, it does not really wait.
    pub async fn settle(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
