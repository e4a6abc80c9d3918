use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::watch;
use xpanel_config::{NotificationSettings, SettingsHandle};
use xpanel_core::{Error, Result};
use xpanel_store::{NewAuditEvent, Store};

use crate::{Notification, NotificationQueue};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;

/// Transport seam so the worker is testable without a relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, settings: &NotificationSettings, n: &Notification) -> Result<()>;
}

/// Real SMTP delivery through lettre. One authenticated session per message;
/// the relay connection itself is pooled by the transport.
pub struct SmtpMailer;

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, settings: &NotificationSettings, n: &Notification) -> Result<()> {
        let from = format!("{} <{}>", settings.from_name, settings.from_address)
            .parse()
            .map_err(|e| Error::bad_request(format!("from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(&n.subject)
            .header(ContentType::TEXT_HTML);
        for recipient in &n.to {
            builder = builder.to(recipient
                .parse()
                .map_err(|e| Error::bad_request(format!("recipient '{recipient}': {e}")))?);
        }
        let message = builder
            .body(n.html_body.clone())
            .map_err(|e| Error::internal(format!("mail build: {e}")))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)
            .map_err(|e| Error::upstream(format!("smtp relay: {e}")))?
            .port(settings.smtp_port)
            .credentials(Credentials::new(
                settings.smtp_user.clone(),
                settings.smtp_password.clone(),
            ))
            .build();

        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| Error::upstream(format!("smtp send: {e}")))
    }
}

/// Drains the queue until shutdown. Backoff schedule: 2s, 4s, 8s.
pub struct NotifyWorker {
    queue: NotificationQueue,
    settings: SettingsHandle,
    store: Store,
    transport: Arc<dyn MailTransport>,
}

impl NotifyWorker {
    pub fn new(
        queue: NotificationQueue,
        settings: SettingsHandle,
        store: Store,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self { queue, settings, store, transport }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("notifier worker started");
        loop {
            let notification = tokio::select! {
                n = self.queue.pop() => n,
                _ = shutdown.changed() => break,
            };
            self.deliver(notification).await;
        }
        // Flush whatever is already queued before returning.
        while let Some(n) = self.queue.try_pop() {
            self.deliver(n).await;
        }
        tracing::info!("notifier worker stopped");
    }

    async fn deliver(&self, n: Notification) {
        let settings = self.settings.get().notification;
        if !settings.enabled {
            tracing::debug!(kind = n.kind.as_str(), subject = %n.subject, "smtp disabled, notification skipped");
            return;
        }
        if n.to.is_empty() {
            tracing::debug!(kind = n.kind.as_str(), "notification has no recipients, skipped");
            return;
        }

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = BACKOFF_BASE_SECS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self.transport.send(&settings, &n).await {
                Ok(()) => {
                    tracing::info!(
                        kind = n.kind.as_str(),
                        recipients = n.to.len(),
                        "notification delivered"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        kind = n.kind.as_str(),
                        attempt = attempt + 1,
                        error = %e,
                        "notification delivery failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
        tracing::error!(kind = n.kind.as_str(), subject = %n.subject, "notification dropped after retries");
        let audit = NewAuditEvent {
            action: "notification.failed".to_string(),
            target: n.kind.as_str().to_string(),
            detail: reason,
            ..Default::default()
        };
        if let Err(e) = self.store.create_audit_event(audit).await {
            tracing::error!(error = %e, "failed to audit dropped notification");
        }
    }
}
