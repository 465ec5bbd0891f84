use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use aircheck_core::{
    NewProxy, ProxyEndpoint, ProxyProber, ProxyRotationService, SqliteProxyStore,
};

fn open_store(dir: &tempfile::TempDir) -> SqliteProxyStore {
    let store = SqliteProxyStore::builder()
        .path(dir.path().join("proxies.sqlite"))
        .build()
        .expect("store builds");
    store.initialize().expect("schema applies");
    store
}

fn proxy(address: &str) -> NewProxy {
    NewProxy {
        address: address.to_string(),
        port: 3128,
        protocol: "http".to_string(),
        username: None,
        password: None,
    }
}

#[test]
fn selection_prefers_the_proven_proxy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let weak = store.add(&proxy("10.0.0.1")).expect("weak");
    let strong = store.add(&proxy("10.0.0.2")).expect("strong");

    for _ in 0..8 {
        store
            .record_usage(strong.id, "warmup", true, None, Some(120))
            .expect("success");
    }
    for _ in 0..8 {
        store
            .record_usage(weak.id, "warmup", false, Some("timeout"), None)
            .expect("failure");
    }

    // Both are past their cooldown with a zero window.
    let best = store
        .select_best(Duration::ZERO)
        .expect("select")
        .expect("one available");
    assert_eq!(best.id, strong.id);
}

#[test]
fn cooldown_hides_the_winner_from_the_next_caller() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    store.add(&proxy("10.0.0.1")).expect("only proxy");

    let cooldown = Duration::from_secs(30);
    let first = store.select_best(cooldown).expect("select");
    assert!(first.is_some());

    // Selection stamped last_used_at, so the pool is now in cooldown.
    let second = store.select_best(cooldown).expect("select again");
    assert!(second.is_none());

    // A zero cooldown sees it again.
    let third = store.select_best(Duration::ZERO).expect("zero cooldown");
    assert!(third.is_some());
}

#[test]
fn never_used_proxies_are_eligible_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    store.add(&proxy("10.0.0.7")).expect("fresh proxy");

    let selected = store
        .select_best(Duration::from_secs(3600))
        .expect("select")
        .expect("fresh proxy eligible");
    assert_eq!(selected.address, "10.0.0.7");
    assert!(selected.last_used_at.is_some());
}

#[test]
fn usage_updates_counters_and_appends_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let record = store.add(&proxy("10.0.0.3")).expect("added");

    store
        .record_usage(record.id, "cap-1", true, None, Some(250))
        .expect("success");
    store
        .record_usage(record.id, "cap-2", false, Some("connection refused"), None)
        .expect("failure");

    let updated = store.get(record.id).expect("get").expect("present");
    assert_eq!(updated.success_count, 1);
    assert_eq!(updated.fail_count, 1);
    assert!(updated.last_used_at.is_some());

    let usages = store.usages(record.id, 10).expect("usages");
    assert_eq!(usages.len(), 2);
    assert!(usages.iter().any(|u| u.capture_id == "cap-1" && u.success));
    assert!(usages
        .iter()
        .any(|u| u.error.as_deref() == Some("connection refused")));
}

#[test]
fn inactive_proxies_are_never_selected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let record = store.add(&proxy("10.0.0.4")).expect("added");
    store
        .mark_checked(record.id, false, Some("unreachable"))
        .expect("disabled");

    let selected = store.select_best(Duration::ZERO).expect("select");
    assert!(selected.is_none());
}

struct SplitProber;

#[async_trait]
impl ProxyProber for SplitProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<Duration, String> {
        if endpoint.address.ends_with(".1") {
            Ok(Duration::from_millis(80))
        } else {
            Err("proxy refused the check".to_string())
        }
    }
}

#[tokio::test]
async fn revalidation_splits_the_pool_by_probe_result() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir);
    let good = store.add(&proxy("10.0.0.1")).expect("good");
    let bad = store.add(&proxy("10.0.0.2")).expect("bad");

    let service = ProxyRotationService::new(store, Arc::new(SplitProber), Duration::from_secs(30));
    let report = service.revalidate_pool().await.expect("revalidation");
    assert_eq!(report.checked, 2);
    assert_eq!(report.active, 1);
    assert_eq!(report.disabled, 1);

    let pool = service.store().list().expect("list");
    let good_row = pool.iter().find(|p| p.id == good.id).expect("good row");
    let bad_row = pool.iter().find(|p| p.id == bad.id).expect("bad row");
    assert!(good_row.is_active);
    assert!(good_row.last_checked_at.is_some());
    assert!(!bad_row.is_active);
    assert_eq!(bad_row.last_error.as_deref(), Some("proxy refused the check"));
}
