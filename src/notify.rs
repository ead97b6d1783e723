//! Outbound notifications. Delivery is best-effort: the engine enqueues and
//! moves on, a worker task drains the queue into a [`Notifier`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::observability::{NOTIFY_DROPPED_TOTAL, NOTIFY_FAILURES_TOTAL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl NotifyOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Outbound message dispatch (SMS, chat, ...). Never retried by the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, phone: &str, date: NaiveDate, name: &str) -> NotifyOutcome;
}

/// Writes each message to the log. Used when no dispatch service is wired in.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, phone: &str, date: NaiveDate, name: &str) -> NotifyOutcome {
        info!("notify {phone}: {name} on {date}");
        NotifyOutcome::delivered()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Booked,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub phone: String,
    pub date: NaiveDate,
    pub name: String,
}

/// Bounded queue in front of a [`Notifier`]. A full queue drops the message.
#[derive(Clone)]
pub struct Outbox {
    tx: Option<mpsc::Sender<Notification>>,
}

impl Outbox {
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(run_outbox(notifier, rx));
        (Self { tx: Some(tx) }, handle)
    }

    /// Outbox that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn enqueue(&self, notification: Notification) -> bool {
        let Some(tx) = &self.tx else {
            debug!("notifications disabled, dropping {:?} for {}", notification.kind, notification.phone);
            return false;
        };
        match tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                warn!("notification queue full, dropping {:?} for {}", n.kind, n.phone);
                metrics::counter!(NOTIFY_DROPPED_TOTAL).increment(1);
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!("notification worker gone, dropping {:?} for {}", n.kind, n.phone);
                metrics::counter!(NOTIFY_DROPPED_TOTAL).increment(1);
                false
            }
        }
    }
}

async fn run_outbox(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Notification>) {
    while let Some(n) = rx.recv().await {
        let outcome = notifier.send(&n.phone, n.date, &n.name).await;
        if !outcome.success {
            metrics::counter!(NOTIFY_FAILURES_TOTAL).increment(1);
            warn!(
                "{:?} notification to {} failed: {}",
                n.kind,
                n.phone,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    debug!("notification outbox closed");
}
