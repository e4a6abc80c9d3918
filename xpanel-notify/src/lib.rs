//! Outbound notifications.
//!
//! A single-producer-friendly bounded queue of email notifications drained by
//! a background worker. Enqueue never blocks: when the queue is full the
//! OLDEST entry is dropped with a warning so fresh alerts win. Transport
//! failures retry with bounded exponential backoff; terminal failures are
//! recorded as audit events and dropped.

mod queue;
mod worker;

pub use queue::{NotificationQueue, QUEUE_CAPACITY};
pub use worker::{MailTransport, NotifyWorker, SmtpMailer};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TrafficWarning,
    TrafficLimitExceeded,
    UserTrafficWarning,
    UserTrafficLimitExceeded,
    CertExpiry,
    CertRenewFailure,
    PasswordReset,
    SystemAlert,
    Test,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TrafficWarning => "traffic_warning",
            NotificationKind::TrafficLimitExceeded => "traffic_limit_exceeded",
            NotificationKind::UserTrafficWarning => "user_traffic_warning",
            NotificationKind::UserTrafficLimitExceeded => "user_traffic_limit_exceeded",
            NotificationKind::CertExpiry => "cert_expiry",
            NotificationKind::CertRenewFailure => "cert_renew_failure",
            NotificationKind::PasswordReset => "password_reset",
            NotificationKind::SystemAlert => "system_alert",
            NotificationKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        to: Vec<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
    ) -> Self {
        Self { kind, to, subject: subject.into(), html_body: html_body.into() }
    }
}
