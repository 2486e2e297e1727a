//! Clipboard collaborator: items, history, and OS clipboard access
//!
//! The sync engine only needs plain text, so providers expose `get_text` and
//! `set_text`. Change detection is a separate polling task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::protocol::now_millis;

pub mod history;
pub mod poller;

pub use history::{ClipboardHistory, DEFAULT_HISTORY_SIZE};
pub use poller::{ClipboardChange, ClipboardPoller, DEFAULT_POLL_INTERVAL};

/// Item type for text content
pub const TEXT_ITEM_TYPE: &str = "text";

/// A clipboard snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardItem {
    pub id: String,
    pub content: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub item_type: String,
}

impl ClipboardItem {
    /// New text item stamped with the current time
    pub fn text(content: impl Into<String>) -> Self {
        Self::text_at(content, now_millis())
    }

    /// New text item with an explicit timestamp
    pub fn text_at(content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            timestamp,
            item_type: TEXT_ITEM_TYPE.to_string(),
        }
    }
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Background task failed
    #[error("Clipboard task failed: {0}")]
    Task(String),
}

/// Text clipboard access
#[async_trait]
pub trait ClipboardProvider: Send + Sync {
    /// Current clipboard text, `None` when the clipboard holds no text
    async fn get_text(&self) -> Result<Option<String>, ClipboardError>;

    /// Replace the clipboard text
    async fn set_text(&self, text: &str) -> Result<(), ClipboardError>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// The OS clipboard via `arboard`
pub struct SystemClipboard {
    inner: Arc<Mutex<arboard::Clipboard>>,
}

impl SystemClipboard {
    pub fn new() -> Result<Self, ClipboardError> {
        let clipboard =
            arboard::Clipboard::new().map_err(|e| ClipboardError::Platform(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(clipboard)),
        })
    }
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn get_text(&self) -> Result<Option<String>, ClipboardError> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut clipboard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            match clipboard.get_text() {
                Ok(text) => Ok(Some(text)),
                Err(arboard::Error::ContentNotAvailable) => Ok(None),
                Err(e) => Err(ClipboardError::Platform(e.to_string())),
            }
        })
        .await
        .map_err(|e| ClipboardError::Task(e.to_string()))?
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        let inner = self.inner.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut clipboard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            clipboard
                .set_text(text)
                .map_err(|e| ClipboardError::Platform(e.to_string()))
        })
        .await
        .map_err(|e| ClipboardError::Task(e.to_string()))?
    }

    fn name(&self) -> &str {
        "system (arboard)"
    }
}

/// In-process clipboard for headless use and tests
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents without going through the async trait
    pub fn contents(&self) -> Option<String> {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ClipboardProvider for MemoryClipboard {
    async fn get_text(&self) -> Result<Option<String>, ClipboardError> {
        Ok(self.contents())
    }

    async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
