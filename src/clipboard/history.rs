//! Bounded most-recent-first clipboard history

use std::collections::VecDeque;

use super::ClipboardItem;

/// Default number of items kept
pub const DEFAULT_HISTORY_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ClipboardHistory {
    items: VecDeque<ClipboardItem>,
    capacity: usize,
}

impl Default for ClipboardHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl ClipboardHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend `item`, evicting the oldest entry when full.
    ///
    /// Returns false when the newest entry already has the same content.
    pub fn push(&mut self, item: ClipboardItem) -> bool {
        if self
            .items
            .front()
            .is_some_and(|latest| latest.content == item.content)
        {
            return false;
        }

        self.items.push_front(item);
        self.items.truncate(self.capacity);
        true
    }

    pub fn latest(&self) -> Option<&ClipboardItem> {
        self.items.front()
    }

    /// Items, newest first
    pub fn iter(&self) -> impl Iterator<Item = &ClipboardItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
