//! End-to-end reconciliation scenarios driven through the controller's
//! event channels, with time paused so interval and budget timers can be
//! stepped deterministically.

use std::sync::atomic::Ordering;
use std::time::Duration;

use haproxy_sync::core::audit::ServerStat;
use haproxy_sync::core::events::{SessionEvent, WatchEvent};

mod common;
use common::Harness;

#[tokio::test(start_paused = true)]
async fn test_new_backend_forces_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;

    assert_eq!(h.lb.reload_count(), 1);
    let set = h.lb.last_reload().unwrap();
    assert!(set.get("a.example.com").unwrap().enabled);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_removal_only_patches_without_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    // The whole membership goes away: tombstone, patch, no reload.
    h.servers_changed(&[]);
    h.settle().await;

    assert_eq!(h.lb.reload_count(), 1);
    assert_eq!(h.lb.sync_count(), 1);
    let synced = h.lb.last_sync().unwrap();
    assert!(!synced.get("a.example.com").unwrap().enabled);
    assert_eq!(h.lb.live_maint("a.example.com"), Some(true));

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_new_name_with_simultaneous_removal_still_reloads() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;

    // a leaves, b arrives: the new name wins and a reload runs; the
    // departed a is pruned on the way.
    h.servers_changed(&[("b.example.com", "10.0.0.2")]);
    h.settle().await;

    assert_eq!(h.lb.reload_count(), 2);
    let set = h.lb.last_reload().unwrap();
    assert!(set.get("a.example.com").is_none());
    assert!(set.get("b.example.com").unwrap().enabled);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_flapped_backend_reenabled_without_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1"), ("b.example.com", "10.0.0.2")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.live_maint("b.example.com"), Some(true));

    // b comes back before the dirty budget expires: patched back in,
    // never reloaded.
    h.servers_changed(&[("a.example.com", "10.0.0.1"), ("b.example.com", "10.0.0.2")]);
    h.settle().await;
    assert_eq!(h.lb.live_maint("b.example.com"), Some(false));
    assert_eq!(h.lb.reload_count(), 1);

    // And with the dirty state resolved, budget expiry has nothing to do.
    tokio::time::sleep(Duration::from_secs(7 * 3600)).await;
    assert_eq!(h.lb.reload_count(), 1);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_dirty_budget_expiry_forces_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1"), ("b.example.com", "10.0.0.2")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.sync_count(), 1);

    // b stays gone past the budget: the deadline fires and the reload
    // finally compacts it away.
    tokio::time::sleep(Duration::from_secs(6 * 3600 + 120)).await;

    assert_eq!(h.lb.reload_count(), 2);
    let set = h.lb.last_reload().unwrap();
    assert!(set.get("b.example.com").is_none());
    assert!(set.get("a.example.com").unwrap().enabled);
    // The deadline went straight to reload; no extra patching happened.
    assert_eq!(h.lb.sync_count(), 1);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_audit_unknown_server_forces_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    h.lb.inject_stat(ServerStat {
        pxname: "servers".into(),
        svname: "c.example.com".into(),
        status: "UP".into(),
        addr: Some("10.0.0.9:80".into()),
    });

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(h.lb.reload_count() >= 2, "structural mismatch must reload");
    h.lb.clear_injected();

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_audit_enablement_mismatch_patches() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    let reloads = h.lb.reload_count();

    // Someone put a in maintenance behind our back.
    h.lb.force_maint("a.example.com", true);
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.lb.live_maint("a.example.com"), Some(false));
    assert!(h.lb.sync_count() >= 1);
    assert_eq!(h.lb.reload_count(), reloads, "enablement fix needs no reload");

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_audit_query_failure_downgrades_to_patch() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    let reloads = h.lb.reload_count();
    let syncs = h.lb.sync_count();

    h.lb.fail_stats.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert!(h.lb.sync_count() > syncs, "stats failure re-syncs via patch");
    assert_eq!(h.lb.reload_count(), reloads);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_patch_failure_escalates_to_reload() {
    let h = Harness::spawn();

    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    h.lb.fail_sync.store(true, Ordering::SeqCst);
    h.servers_changed(&[]);
    h.settle().await;

    // The cheap path failed, the authoritative one ran; the tombstoned
    // backend went with the reload.
    assert_eq!(h.lb.reload_count(), 2);
    assert!(h.lb.last_reload().unwrap().is_empty());

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_failed_reload_retried_by_audit() {
    let h = Harness::spawn();

    h.lb.fail_reload.store(true, Ordering::SeqCst);
    h.servers_changed(&[("a.example.com", "10.0.0.1")]);
    h.settle().await;
    assert_eq!(h.lb.reload_count(), 1);

    // The backend never made it into the live config, so each audit
    // keeps trying the reload.
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert!(h.lb.reload_count() >= 2);

    h.lb.fail_reload.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.lb.live_maint("a.example.com"), Some(false));

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_session_renewal_rebuilds_watcher() {
    let h = Harness::spawn();

    h.sessions.send(SessionEvent).unwrap();
    h.settle().await;
    assert_eq!(h.watch.rebuilds.load(Ordering::SeqCst), 1);

    h.sessions.send(SessionEvent).unwrap();
    h.settle().await;
    assert_eq!(h.watch.rebuilds.load(Ordering::SeqCst), 2);

    h.shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_children_changed_forwarded_not_acted_on() {
    let h = Harness::spawn();

    h.events
        .send(WatchEvent::ChildrenChanged(vec!["a.example.com".into()]))
        .unwrap();
    h.settle().await;

    assert_eq!(
        h.watch.forwarded.lock().unwrap().as_slice(),
        &[vec!["a.example.com".to_string()]]
    );
    assert_eq!(h.lb.reload_count(), 0);
    assert_eq!(h.lb.sync_count(), 0);

    h.shutdown.trigger();
}
