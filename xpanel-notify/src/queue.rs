use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::Notification;

pub const QUEUE_CAPACITY: usize = 256;

/// Bounded notification queue with drop-oldest overflow.
///
/// `enqueue` is synchronous and never blocks, so quota evaluation and cert
/// loops can fire notifications from any context. The worker side awaits
/// `pop`.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Inner>,
}

struct Inner {
    items: Mutex<VecDeque<Notification>>,
    notify: Notify,
    capacity: usize,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    pub fn enqueue(&self, n: Notification) {
        {
            let mut items = self.inner.items.lock().expect("notification queue poisoned");
            if items.len() >= self.inner.capacity {
                if let Some(dropped) = items.pop_front() {
                    tracing::warn!(
                        kind = dropped.kind.as_str(),
                        subject = %dropped.subject,
                        "notification queue full, dropping oldest"
                    );
                }
            }
            items.push_back(n);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next queued notification.
    pub async fn pop(&self) -> Notification {
        loop {
            if let Some(n) = self.try_pop() {
                return n;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Notification> {
        self.inner.items.lock().expect("notification queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().expect("notification queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}
