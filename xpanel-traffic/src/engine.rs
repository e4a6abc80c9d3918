use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use xpanel_config::SettingsHandle;
use xpanel_core::{InboundId, Result, UserId, format_bytes};
use xpanel_notify::{Notification, NotificationKind, NotificationQueue};
use xpanel_store::{Inbound, Store, User};

use crate::{CounterSample, ReconcileTx, TrafficSource};

pub(crate) struct SampleState {
    /// Last cumulative `(up, down)` seen per inbound.
    pub last: HashMap<InboundId, (i64, i64)>,
    pub warned_inbounds: HashMap<InboundId, DateTime<Utc>>,
    pub warned_users: HashMap<UserId, DateTime<Utc>>,
    pub last_rollup_date: chrono::NaiveDate,
}

pub struct TrafficEngine {
    store: Store,
    settings: SettingsHandle,
    queue: NotificationQueue,
    source: Arc<dyn TrafficSource>,
    reconcile: ReconcileTx,
    pub(crate) state: Mutex<SampleState>,
}

impl TrafficEngine {
    pub fn new(
        store: Store,
        settings: SettingsHandle,
        queue: NotificationQueue,
        source: Arc<dyn TrafficSource>,
        reconcile: ReconcileTx,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings,
            queue,
            source,
            reconcile,
            state: Mutex::new(SampleState {
                last: HashMap::new(),
                warned_inbounds: HashMap::new(),
                warned_users: HashMap::new(),
                last_rollup_date: Utc::now().date_naive(),
            }),
        })
    }

    /// One control tick: read cumulative counters, apply deltas under
    /// per-inbound transactions, enforce quotas, then settle per-user totals
    /// at most once per owner.
    pub async fn sample_once(&self) -> Result<()> {
        self.sample_once_at(Utc::now()).await
    }

    pub async fn sample_once_at(&self, now: DateTime<Utc>) -> Result<()> {
        let inbounds = self.store.list_enabled_inbounds().await?;
        if inbounds.is_empty() {
            return Ok(());
        }

        let samples: HashMap<InboundId, CounterSample> = self
            .source
            .snapshot()
            .await?
            .into_iter()
            .map(|s| (s.inbound_id, s))
            .collect();

        let mut state = self.state.lock().await;
        let mut touched_users: Vec<UserId> = Vec::new();

        for inbound in &inbounds {
            // Expired inbounds come down regardless of traffic.
            if inbound.expires_at.is_some_and(|e| e <= now) {
                let mut tx = self.store.begin().await?;
                tx.set_inbound_enabled(inbound.id, false).await?;
                tx.commit().await?;
                tracing::info!(inbound = inbound.id, name = %inbound.name, "inbound expired, disabled");
                self.request_reconcile();
                continue;
            }

            let Some(sample) = samples.get(&inbound.id) else {
                continue;
            };

            let (du, dd) = match state.last.get(&inbound.id) {
                // Counter reset: the cumulative values ARE the deltas.
                Some(&(lu, ld)) if sample.upstream < lu || sample.downstream < ld => {
                    (sample.upstream, sample.downstream)
                }
                Some(&(lu, ld)) => (sample.upstream - lu, sample.downstream - ld),
                None => (sample.upstream, sample.downstream),
            };
            state.last.insert(inbound.id, (sample.upstream, sample.downstream));

            if du == 0 && dd == 0 {
                continue;
            }

            // Delta append and quota enforcement commit as one unit.
            let mut tx = self.store.begin().await?;
            tx.add_inbound_stats_delta(inbound.id, inbound.user_id, du, dd, now).await?;
            tx.add_inbound_used(inbound.id, du + dd).await?;
            let updated = tx.inbound_by_id(inbound.id).await?;

            let crossed = updated.quota_bytes > 0 && updated.used_bytes >= updated.quota_bytes;
            if crossed {
                tx.set_inbound_enabled(inbound.id, false).await?;
            }
            tx.commit().await?;

            if crossed {
                tracing::warn!(
                    inbound = inbound.id,
                    name = %inbound.name,
                    used = updated.used_bytes,
                    quota = updated.quota_bytes,
                    "inbound quota exceeded, disabled"
                );
                self.notify_inbound_limit(&updated).await;
                self.request_reconcile();
            } else if updated.quota_bytes > 0 {
                let ratio = self.settings.get().traffic.warning_ratio;
                let threshold = (updated.quota_bytes as f64 * ratio) as i64;
                if updated.used_bytes >= threshold && self.should_warn_inbound(&mut state, inbound.id, now) {
                    self.notify_inbound_warning(&updated).await;
                }
            }

            if !touched_users.contains(&inbound.user_id) {
                touched_users.push(inbound.user_id);
            }
        }

        for user_id in touched_users {
            if let Err(e) = self.settle_user(&mut state, user_id, now).await {
                tracing::error!(user = user_id, error = %e, "per-user quota pass failed");
            }
        }
        Ok(())
    }

    /// Aggregate one owner's usage and enforce the account-level quota.
    async fn settle_user(
        &self,
        state: &mut SampleState,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let user = self.store.user_by_id(user_id).await?;

        let mut tx = self.store.begin().await?;
        let total = tx.user_total_used(user_id).await?;
        tx.set_user_used(user_id, total).await?;

        let crossed = user.quota_bytes > 0 && total >= user.quota_bytes;
        if crossed {
            let taken_down = tx.disable_user_inbounds(user_id).await?;
            tx.commit().await?;
            tracing::warn!(
                user = %user.username,
                used = total,
                quota = user.quota_bytes,
                inbounds = taken_down,
                "user quota exceeded, all inbounds disabled"
            );
            self.notify_user_limit(&user, total).await;
            self.request_reconcile();
            return Ok(());
        }
        tx.commit().await?;

        if user.quota_bytes > 0 {
            let ratio = self.settings.get().traffic.warning_ratio;
            if total >= (user.quota_bytes as f64 * ratio) as i64
                && self.should_warn_user(state, user_id, now)
            {
                self.notify_user_warning(&user, total).await;
            }
        }
        Ok(())
    }

    fn should_warn_inbound(&self, state: &mut SampleState, id: InboundId, now: DateTime<Utc>) -> bool {
        let gap = chrono::Duration::seconds(self.settings.get().traffic.warning_interval_secs as i64);
        match state.warned_inbounds.get(&id) {
            Some(&last) if now - last < gap => false,
            _ => {
                state.warned_inbounds.insert(id, now);
                true
            }
        }
    }

    fn should_warn_user(&self, state: &mut SampleState, id: UserId, now: DateTime<Utc>) -> bool {
        let gap = chrono::Duration::seconds(self.settings.get().traffic.warning_interval_secs as i64);
        match state.warned_users.get(&id) {
            Some(&last) if now - last < gap => false,
            _ => {
                state.warned_users.insert(id, now);
                true
            }
        }
    }

    fn request_reconcile(&self) {
        if self.reconcile.try_send(()).is_err() {
            tracing::debug!("reconcile already pending");
        }
    }

    async fn notify_inbound_limit(&self, inbound: &Inbound) {
        let Some(recipients) = self.recipients_for(inbound.user_id).await else { return };
        self.queue.enqueue(Notification::new(
            NotificationKind::TrafficLimitExceeded,
            recipients,
            format!("Traffic limit reached on '{}'", inbound.name),
            format!(
                "<p>Inbound <b>{}</b> (port {}) used {} of its {} quota and has been disabled.</p>",
                inbound.name,
                inbound.port,
                format_bytes(inbound.used_bytes.max(0) as u64),
                format_bytes(inbound.quota_bytes.max(0) as u64),
            ),
        ));
    }

    async fn notify_inbound_warning(&self, inbound: &Inbound) {
        let Some(recipients) = self.recipients_for(inbound.user_id).await else { return };
        self.queue.enqueue(Notification::new(
            NotificationKind::TrafficWarning,
            recipients,
            format!("Traffic warning on '{}'", inbound.name),
            format!(
                "<p>Inbound <b>{}</b> (port {}) has used {} of its {} quota.</p>",
                inbound.name,
                inbound.port,
                format_bytes(inbound.used_bytes.max(0) as u64),
                format_bytes(inbound.quota_bytes.max(0) as u64),
            ),
        ));
    }

    async fn notify_user_limit(&self, user: &User, total: i64) {
        let Some(recipients) = self.recipients_for(user.id).await else { return };
        self.queue.enqueue(Notification::new(
            NotificationKind::UserTrafficLimitExceeded,
            recipients,
            "Account traffic limit reached".to_string(),
            format!(
                "<p>Account <b>{}</b> used {} of its {} quota; all inbounds have been disabled.</p>",
                user.username,
                format_bytes(total.max(0) as u64),
                format_bytes(user.quota_bytes.max(0) as u64),
            ),
        ));
    }

    async fn notify_user_warning(&self, user: &User, total: i64) {
        let Some(recipients) = self.recipients_for(user.id).await else { return };
        self.queue.enqueue(Notification::new(
            NotificationKind::UserTrafficWarning,
            recipients,
            "Account traffic warning".to_string(),
            format!(
                "<p>Account <b>{}</b> has used {} of its {} quota.</p>",
                user.username,
                format_bytes(total.max(0) as u64),
                format_bytes(user.quota_bytes.max(0) as u64),
            ),
        ));
    }

    /// The owner's address, plus the admin's when so configured.
    async fn recipients_for(&self, user_id: UserId) -> Option<Vec<String>> {
        let mut recipients = Vec::new();
        if let Ok(user) = self.store.user_by_id(user_id).await {
            if !user.email.is_empty() {
                recipients.push(user.email);
            }
        }
        let settings = self.settings.get();
        if settings.admin.notify_on_quota && !settings.admin.email.is_empty() {
            recipients.push(settings.admin.email);
        }
        if recipients.is_empty() { None } else { Some(recipients) }
    }

    /// Sampling loop; interval re-read every tick for live reconfiguration.
    pub async fn run_sample_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("traffic sample loop started");
        loop {
            let interval = self.settings.get().traffic.sampling_interval_secs.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.sample_once().await {
                        tracing::error!(error = %e, "traffic sample tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("traffic sample loop stopped");
    }

    pub async fn run_rollup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("traffic rollup loop started");
        loop {
            let interval = self.settings.get().traffic.rollup_interval_secs.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    if let Err(e) = self.rollup_once().await {
                        tracing::error!(error = %e, "traffic rollup tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("traffic rollup loop stopped");
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn settings(&self) -> &SettingsHandle {
        &self.settings
    }
}
