//! User-facing problem reports.
//!
//! Components publish [`Alert`]s here instead of failing the caller when a
//! problem concerns individual files or needs user attention. Every alert is
//! logged; subscribers (a UI, the test harness) receive them over a
//! broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::types::{FilePath, FileResult};

const ALERT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Notice,
    Warning,
    /// Needs the user before work can continue, e.g. a login.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub files: Vec<FilePath>,
}

/// Broadcasts alerts to subscribers.
#[derive(Debug)]
pub struct AlertManager {
    tx: broadcast::Sender<Alert>,
    published: AtomicU64,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Total alerts published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn publish(&self, alert: Alert) {
        let files = alert.files.len();
        match alert.level {
            AlertLevel::Notice => info!(title = %alert.title, files, "{}", alert.message),
            AlertLevel::Warning => warn!(title = %alert.title, files, "{}", alert.message),
            AlertLevel::Critical => error!(title = %alert.title, files, "{}", alert.message),
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.tx.send(alert);
    }

    pub fn notice(&self, title: impl Into<String>, message: impl Into<String>, files: Vec<FilePath>) {
        self.publish(Alert {
            level: AlertLevel::Notice,
            title: title.into(),
            message: message.into(),
            files,
        });
    }

    pub fn warning(&self, title: impl Into<String>, message: impl Into<String>, files: Vec<FilePath>) {
        self.publish(Alert {
            level: AlertLevel::Warning,
            title: title.into(),
            message: message.into(),
            files,
        });
    }

    pub fn critical(&self, title: impl Into<String>, message: impl Into<String>) {
        self.publish(Alert {
            level: AlertLevel::Critical,
            title: title.into(),
            message: message.into(),
            files: Vec::new(),
        });
    }

    /// Publish one warning per failed file. Returns the number of failures.
    pub fn file_results(&self, title: &str, results: &[FileResult]) -> usize {
        let mut failed = 0;
        for result in results {
            if let Some(error) = &result.error {
                failed += 1;
                self.warning(title, error.clone(), vec![result.file.clone()]);
            }
        }
        failed
    }
}
