//! End-to-end accounting behavior against an in-memory store and a scripted
//! counter source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use xpanel_config::{Settings, SettingsHandle};
use xpanel_core::{InboundId, Protocol, Result};
use xpanel_notify::{NotificationKind, NotificationQueue};
use xpanel_store::{NewInbound, NewUser, Store};
use xpanel_traffic::{CounterSample, TrafficEngine, TrafficSource};

/// Cumulative counters the test can move at will.
#[derive(Default)]
struct ScriptedSource {
    counters: Mutex<HashMap<InboundId, (i64, i64)>>,
}

impl ScriptedSource {
    fn set(&self, id: InboundId, up: i64, down: i64) {
        self.counters.lock().unwrap().insert(id, (up, down));
    }
}

#[async_trait]
impl TrafficSource for ScriptedSource {
    async fn snapshot(&self) -> Result<Vec<CounterSample>> {
        Ok(self
            .counters
            .lock()
            .unwrap()
            .iter()
            .map(|(&inbound_id, &(upstream, downstream))| CounterSample {
                inbound_id,
                upstream,
                downstream,
            })
            .collect())
    }
}

struct Harness {
    store: Store,
    source: Arc<ScriptedSource>,
    queue: NotificationQueue,
    engine: Arc<TrafficEngine>,
    reconcile_rx: tokio::sync::mpsc::Receiver<()>,
}

async fn harness() -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let source = Arc::new(ScriptedSource::default());
    let queue = NotificationQueue::new(32);
    let (reconcile_tx, reconcile_rx) = tokio::sync::mpsc::channel(1);

    let mut settings = Settings::default();
    settings.admin.email = "admin@example.com".into();
    settings.admin.notify_on_quota = true;

    let engine = TrafficEngine::new(
        store.clone(),
        SettingsHandle::ephemeral(settings),
        queue.clone(),
        source.clone(),
        reconcile_tx,
    );
    Harness { store, source, queue, engine, reconcile_rx }
}

async fn seed_user(store: &Store, name: &str, quota: i64) -> i64 {
    store
        .create_user(NewUser {
            username: name.into(),
            email: format!("{name}@example.com"),
            password_hash: "h".into(),
            password_salt: "s".into(),
            is_admin: false,
            quota_bytes: quota,
            expires_at: None,
        })
        .await
        .unwrap()
        .id
}

async fn seed_inbound(store: &Store, user_id: i64, port: u16, quota: i64) -> i64 {
    store
        .create_inbound(NewInbound {
            user_id,
            name: format!("in-{port}"),
            protocol: Protocol::Vmess,
            port,
            settings: serde_json::json!({}),
            enabled: true,
            quota_bytes: quota,
            expires_at: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn deltas_accumulate_into_stats_and_used() {
    let mut h = harness().await;
    let uid = seed_user(&h.store, "u", 0).await;
    let iid = seed_inbound(&h.store, uid, 10001, 0).await;

    h.source.set(iid, 100, 200);
    h.engine.sample_once().await.unwrap();
    h.source.set(iid, 150, 260);
    h.engine.sample_once().await.unwrap();

    let stats = h.store.inbound_stats(iid).await.unwrap();
    assert_eq!(stats.upstream_bytes, 150);
    assert_eq!(stats.downstream_bytes, 260);
    assert_eq!(h.store.inbound_by_id(iid).await.unwrap().used_bytes, 410);
    assert_eq!(h.store.user_by_id(uid).await.unwrap().used_bytes, 410);
    assert!(h.reconcile_rx.try_recv().is_err());
}

#[tokio::test]
async fn counter_reset_treated_as_absolute() {
    let h = harness().await;
    let uid = seed_user(&h.store, "u", 0).await;
    let iid = seed_inbound(&h.store, uid, 10002, 0).await;

    h.source.set(iid, 1000, 1000);
    h.engine.sample_once().await.unwrap();
    // The engine restarted: cumulative counters went backwards.
    h.source.set(iid, 30, 40);
    h.engine.sample_once().await.unwrap();

    let stats = h.store.inbound_stats(iid).await.unwrap();
    assert_eq!(stats.upstream_bytes, 1030);
    assert_eq!(stats.downstream_bytes, 1040);
}

#[tokio::test]
async fn quota_crossing_disables_notifies_and_schedules_reconcile() {
    let mut h = harness().await;
    let uid = seed_user(&h.store, "u", 0).await;
    let iid = seed_inbound(&h.store, uid, 10003, 1000).await;

    // Ten samples, each adding (100 up, 100 down). The fifth reaches the
    // 1000-byte quota.
    for tick in 1..=10 {
        h.source.set(iid, tick * 100, tick * 100);
        h.engine.sample_once().await.unwrap();
    }

    let inbound = h.store.inbound_by_id(iid).await.unwrap();
    assert!(!inbound.enabled);
    // Enforcement stopped metering at the crossing tick: 5 × 200 bytes.
    assert_eq!(inbound.used_bytes, 1000);

    let kinds: Vec<NotificationKind> =
        std::iter::from_fn(|| h.queue.try_pop()).map(|n| n.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == NotificationKind::TrafficLimitExceeded).count(),
        1,
        "exactly one limit notification, got {kinds:?}"
    );
    h.reconcile_rx.try_recv().expect("reconcile must be scheduled");
}

#[tokio::test]
async fn warning_fires_once_per_interval() {
    let h = harness().await;
    let uid = seed_user(&h.store, "u", 0).await;
    let iid = seed_inbound(&h.store, uid, 10004, 1000).await;

    let t0 = Utc::now();
    h.source.set(iid, 400, 400); // 800 = 80% of 1000
    h.engine.sample_once_at(t0).await.unwrap();
    h.source.set(iid, 450, 400); // 850, still above the ratio, below quota
    h.engine.sample_once_at(t0 + Duration::seconds(1)).await.unwrap();

    let warnings: Vec<_> = std::iter::from_fn(|| h.queue.try_pop())
        .filter(|n| n.kind == NotificationKind::TrafficWarning)
        .collect();
    assert_eq!(warnings.len(), 1);

    // Past the warning interval the warning may fire again.
    h.source.set(iid, 460, 400);
    h.engine.sample_once_at(t0 + Duration::seconds(3601)).await.unwrap();
    let again: Vec<_> = std::iter::from_fn(|| h.queue.try_pop())
        .filter(|n| n.kind == NotificationKind::TrafficWarning)
        .collect();
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn user_quota_disables_all_owned_inbounds() {
    let mut h = harness().await;
    let uid = seed_user(&h.store, "capped", 1500).await;
    let first = seed_inbound(&h.store, uid, 10005, 0).await;
    let second = seed_inbound(&h.store, uid, 10006, 0).await;

    h.source.set(first, 500, 500);
    h.source.set(second, 300, 300);
    h.engine.sample_once().await.unwrap();

    assert!(!h.store.inbound_by_id(first).await.unwrap().enabled);
    assert!(!h.store.inbound_by_id(second).await.unwrap().enabled);
    assert_eq!(h.store.user_by_id(uid).await.unwrap().used_bytes, 1600);

    let kinds: Vec<NotificationKind> =
        std::iter::from_fn(|| h.queue.try_pop()).map(|n| n.kind).collect();
    assert!(kinds.contains(&NotificationKind::UserTrafficLimitExceeded));
    h.reconcile_rx.try_recv().expect("reconcile scheduled");
}

#[tokio::test]
async fn expired_inbound_comes_down_without_traffic() {
    let mut h = harness().await;
    let uid = seed_user(&h.store, "u", 0).await;
    let iid = seed_inbound(&h.store, uid, 10007, 0).await;

    let mut inbound = h.store.inbound_by_id(iid).await.unwrap();
    inbound.expires_at = Some(Utc::now() - Duration::hours(1));
    h.store.update_inbound(&inbound).await.unwrap();

    h.engine.sample_once().await.unwrap();
    assert!(!h.store.inbound_by_id(iid).await.unwrap().enabled);
    h.reconcile_rx.try_recv().expect("reconcile scheduled");
}

#[tokio::test]
async fn rollup_buckets_previous_date_and_zeroes_counters() {
    let h = harness().await;
    let uid = seed_user(&h.store, "seven", 0).await;
    let iid = seed_inbound(&h.store, uid, 10008, 0).await;

    h.source.set(iid, 1_000_000, 2_000_000);
    h.engine.sample_once().await.unwrap();

    let yesterday = Utc::now().date_naive() - Duration::days(1);
    h.engine.set_last_rollup_date(yesterday).await;
    h.engine.rollup_once().await.unwrap();

    let today = Utc::now().date_naive();
    let rows = h.store.daily_stats_by_user(uid, yesterday, today).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].date, yesterday);
    assert_eq!(rows[0].upstream_bytes, 1_000_000);
    assert_eq!(rows[0].downstream_bytes, 2_000_000);
    assert_eq!(rows[0].total_bytes, 3_000_000);

    let stats = h.store.inbound_stats(iid).await.unwrap();
    assert_eq!(stats.upstream_bytes, 0);
    assert_eq!(stats.downstream_bytes, 0);

    // Same day again: no second bucket.
    h.engine.rollup_once().await.unwrap();
    let rows = h.store.daily_stats_by_user(uid, yesterday, today).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn accounting_conserves_deltas_across_rollup() {
    let h = harness().await;
    let uid = seed_user(&h.store, "conserve", 0).await;
    let iid = seed_inbound(&h.store, uid, 10009, 0).await;

    let mut expected_total = 0i64;
    for tick in 1..=4 {
        h.source.set(iid, tick * 111, tick * 222);
        h.engine.sample_once().await.unwrap();
    }
    expected_total += 4 * 111 + 4 * 222;

    let yesterday = Utc::now().date_naive() - Duration::days(1);
    h.engine.set_last_rollup_date(yesterday).await;
    h.engine.rollup_once().await.unwrap();

    let rows = h
        .store
        .daily_stats_by_user(uid, NaiveDate::MIN, Utc::now().date_naive())
        .await
        .unwrap();
    let bucketed: i64 = rows.iter().map(|r| r.total_bytes).sum();
    assert_eq!(bucketed, expected_total);
    assert_eq!(h.store.inbound_by_id(iid).await.unwrap().used_bytes, expected_total);
}
