//! Periodic clipboard change detection

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ClipboardProvider;
use crate::transport::protocol::now_millis;

/// Default polling cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const CHANGE_CHANNEL_CAPACITY: usize = 32;

/// The clipboard text changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardChange {
    pub content: String,
    /// Epoch milliseconds
    pub observed_at: i64,
}

/// Polls a provider and reports text changes
pub struct ClipboardPoller {
    provider: Arc<dyn ClipboardProvider>,
    period: Duration,
}

impl ClipboardPoller {
    pub fn new(provider: Arc<dyn ClipboardProvider>, period: Duration) -> Self {
        Self { provider, period }
    }

    /// Start polling on a background task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> mpsc::Receiver<ClipboardChange> {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        tokio::spawn(self.run(tx, cancel));
        rx
    }

    /// Poll loop. The text present at startup is the baseline and is not
    /// reported.
    pub async fn run(self, tx: mpsc::Sender<ClipboardChange>, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last: Option<String> = None;
        let mut primed = false;
        let mut failing = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = match self.provider.get_text().await {
                Ok(text) => {
                    failing = false;
                    text
                }
                Err(e) => {
                    if !failing {
                        warn!(provider = self.provider.name(), "Clipboard read failed: {}", e);
                        failing = true;
                    }
                    continue;
                }
            };

            if !primed {
                primed = true;
                last = current;
                continue;
            }

            if current.is_some() && current != last {
                last = current.clone();
                let Some(content) = current else { continue };
                debug!(bytes = content.len(), "Clipboard changed");

                let change = ClipboardChange {
                    content,
                    observed_at: now_millis(),
                };
                if tx.send(change).await.is_err() {
                    break;
                }
            }
        }

        debug!("Clipboard poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;

    #[tokio::test(start_paused = true)]
    async fn test_reports_changes_after_baseline() {
        let clipboard = Arc::new(MemoryClipboard::new());
        clipboard.set_text("before start").await.unwrap();

        let cancel = CancellationToken::new();
        let mut rx = ClipboardPoller::new(clipboard.clone(), DEFAULT_POLL_INTERVAL)
            .spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(600)).await;
        clipboard.set_text("copied").await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.content, "copied");

        clipboard.set_text("again").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "again");

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_clipboard_is_quiet() {
        let clipboard = Arc::new(MemoryClipboard::new());
        clipboard.set_text("steady").await.unwrap();

        let cancel = CancellationToken::new();
        let mut rx = ClipboardPoller::new(clipboard, DEFAULT_POLL_INTERVAL).spawn(cancel.clone());

        let waited = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(waited.is_err());
        cancel.cancel();
    }
}
