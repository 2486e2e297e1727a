//! Clipboard sync orchestration
//!
//! [`SyncEngine`] turns local clipboard changes into encrypted
//! `clipboard_update` envelopes, one per paired device, and applies inbound
//! envelopes to the local clipboard and history.

pub mod codec;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use codec::{decode_clipboard_envelope, encode_clipboard_envelope, DecodeError, EncodeError};

use crate::clipboard::{ClipboardChange, ClipboardHistory, ClipboardItem, ClipboardProvider};
use crate::pairing::PairingStore;
use crate::transport::{ConnectionEngine, MessageType, SyncMessage};

/// Where an applied clipboard item came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSource {
    Local,
    Remote(String),
}

#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub source: SyncSource,
    pub item: ClipboardItem,
}

/// Outbound envelope sink
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Send one envelope, false when it could not be handed to a transport
    async fn send_message(&self, message: &SyncMessage) -> bool;
}

#[async_trait]
impl MessageSink for ConnectionEngine {
    async fn send_message(&self, message: &SyncMessage) -> bool {
        ConnectionEngine::send_message(self, message).await
    }
}

pub struct SyncEngine {
    device_id: String,
    pairing: Arc<PairingStore>,
    clipboard: Arc<dyn ClipboardProvider>,
    sink: Arc<dyn MessageSink>,
    history: Mutex<ClipboardHistory>,
    last_remote_content: Mutex<Option<String>>,
    event_sender: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        device_id: impl Into<String>,
        pairing: Arc<PairingStore>,
        clipboard: Arc<dyn ClipboardProvider>,
        sink: Arc<dyn MessageSink>,
        history: ClipboardHistory,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);

        Self {
            device_id: device_id.into(),
            pairing,
            clipboard,
            sink,
            history: Mutex::new(history),
            last_remote_content: Mutex::new(None),
            event_sender,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_sender.subscribe()
    }

    /// History snapshot, newest first
    pub async fn history(&self) -> Vec<ClipboardItem> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Send a local clipboard change to every paired device.
    ///
    /// Returns the number of envelopes handed to the transport.
    pub async fn publish_local_change(&self, change: ClipboardChange) -> usize {
        if change.content.is_empty() {
            return 0;
        }

        let last_remote = self.last_remote_content.lock().await.take();
        if last_remote.as_deref() == Some(change.content.as_str()) {
            debug!("Skipping echo of remote clipboard content");
            return 0;
        }

        let item = ClipboardItem::text_at(change.content, change.observed_at);
        self.record(SyncSource::Local, item.clone()).await;

        let devices = self.pairing.paired_devices().await;
        if devices.is_empty() {
            debug!("No paired devices, clipboard change stays local");
            return 0;
        }

        let mut sent = 0;
        for device in &devices {
            let message = match encode_clipboard_envelope(
                &item,
                &self.device_id,
                &device.remote_device_id,
                &device.shared_key,
            ) {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        remote_device_id = %device.remote_device_id,
                        "Failed to encode clipboard update: {}",
                        e
                    );
                    continue;
                }
            };

            if self.sink.send_message(&message).await {
                sent += 1;
            } else {
                debug!(
                    remote_device_id = %device.remote_device_id,
                    "Clipboard update not sent, no connection"
                );
            }
        }

        debug!(sent, paired = devices.len(), "Published local clipboard change");
        sent
    }

    /// Apply one inbound envelope; returns the item written to the clipboard
    pub async fn handle_incoming(&self, message: SyncMessage) -> Option<ClipboardItem> {
        if !message.is_addressed_to(&self.device_id) {
            debug!(
                to = message.to_device_id.as_deref().unwrap_or_default(),
                "Dropping envelope addressed to another device"
            );
            return None;
        }

        match &message.message_type {
            MessageType::ClipboardUpdate => self.apply_remote_update(&message).await,
            MessageType::Handshake => {
                info!(from = %message.from_device_id, "Peer handshake received");
                None
            }
            MessageType::Ping => {
                debug!(from = %message.from_device_id, "Ping received");
                None
            }
            MessageType::Unknown(other) => {
                debug!(message_type = %other, "Ignoring unknown message type");
                None
            }
        }
    }

    async fn apply_remote_update(&self, message: &SyncMessage) -> Option<ClipboardItem> {
        let Some(key) = self.pairing.resolve_key(&message.from_device_id).await else {
            warn!(from = %message.from_device_id, "Dropping clipboard update from unpaired device");
            return None;
        };

        let item = match decode_clipboard_envelope(message, &key) {
            Ok(item) => item,
            Err(e) => {
                warn!(from = %message.from_device_id, "Dropping clipboard update: {}", e);
                return None;
            }
        };

        *self.last_remote_content.lock().await = Some(item.content.clone());
        if let Err(e) = self.clipboard.set_text(&item.content).await {
            error!("Failed to update local clipboard: {}", e);
        }

        info!(
            from = %message.from_device_id,
            bytes = item.content.len(),
            "Applied remote clipboard update"
        );
        self.record(SyncSource::Remote(message.from_device_id.clone()), item.clone())
            .await;
        Some(item)
    }

    async fn record(&self, source: SyncSource, item: ClipboardItem) {
        if !self.history.lock().await.push(item.clone()) {
            return;
        }
        // No subscribers is fine
        let _ = self.event_sender.send(SyncEvent { source, item });
    }

    /// Drive both streams until `cancel` fires or the envelope stream ends.
    ///
    /// Inbound envelopes are applied one at a time, in arrival order, on a
    /// dedicated task so a slow clipboard write never delays local changes.
    pub async fn run(
        self: Arc<Self>,
        incoming: mpsc::UnboundedReceiver<SyncMessage>,
        mut changes: mpsc::Receiver<ClipboardChange>,
        cancel: CancellationToken,
    ) {
        let inbound_cancel = cancel.child_token();
        let mut inbound = tokio::spawn(
            Arc::clone(&self).apply_incoming(incoming, inbound_cancel.clone()),
        );
        let mut inbound_done = false;
        let mut changes_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = &mut inbound => {
                    inbound_done = true;
                    if let Err(e) = result {
                        error!("Inbound envelope task failed: {}", e);
                    }
                    break;
                }
                change = changes.recv(), if changes_open => {
                    match change {
                        Some(change) => {
                            self.publish_local_change(change).await;
                        }
                        None => changes_open = false,
                    }
                }
            }
        }

        if !inbound_done {
            inbound_cancel.cancel();
            if let Err(e) = inbound.await {
                error!("Inbound envelope task failed: {}", e);
            }
        }

        info!("Sync engine stopped");
    }

    /// Apply inbound envelopes sequentially until the stream ends
    async fn apply_incoming(
        self: Arc<Self>,
        mut incoming: mpsc::UnboundedReceiver<SyncMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = incoming.recv() => message,
            };

            match message {
                Some(message) => {
                    self.handle_incoming(message).await;
                }
                None => {
                    debug!("Envelope stream closed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::{ClipboardError, MemoryClipboard};
    use crate::crypto::SharedKey;
    use crate::pairing::MemoryPersistence;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<SyncMessage>>,
        offline: AtomicBool,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<SyncMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_message(&self, message: &SyncMessage) -> bool {
            if self.offline.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push(message.clone());
            true
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        clipboard: Arc<MemoryClipboard>,
        sink: Arc<RecordingSink>,
        peer_key: SharedKey,
    }

    async fn paired_engine(
        clipboard: Arc<dyn ClipboardProvider>,
        sink: Arc<RecordingSink>,
    ) -> (Arc<SyncEngine>, SharedKey) {
        let persistence = Arc::new(MemoryPersistence::with_identity("me"));
        let pairing = Arc::new(PairingStore::open(persistence).await.unwrap());
        let peer_key = SharedKey::from_bytes([7u8; 32]);
        pairing
            .add_paired_device(&format!("peer|0|{}", peer_key.to_hex()))
            .await
            .unwrap();

        let engine = Arc::new(SyncEngine::new(
            "me",
            pairing,
            clipboard,
            sink,
            ClipboardHistory::default(),
        ));
        (engine, peer_key)
    }

    async fn fixture() -> Fixture {
        let clipboard = Arc::new(MemoryClipboard::new());
        let sink = Arc::new(RecordingSink::default());
        let (engine, peer_key) = paired_engine(clipboard.clone(), sink.clone()).await;

        Fixture {
            engine,
            clipboard,
            sink,
            peer_key,
        }
    }

    /// Clipboard whose writes take longer for some contents
    #[derive(Default)]
    struct SlowClipboard {
        inner: MemoryClipboard,
    }

    #[async_trait]
    impl ClipboardProvider for SlowClipboard {
        async fn get_text(&self) -> Result<Option<String>, ClipboardError> {
            self.inner.get_text().await
        }

        async fn set_text(&self, text: &str) -> Result<(), ClipboardError> {
            let delay = if text == "first" { 200 } else { 10 };
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.inner.set_text(text).await
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn change(content: &str) -> ClipboardChange {
        ClipboardChange {
            content: content.to_string(),
            observed_at: 1_000,
        }
    }

    fn update_from_peer(content: &str, key: &SharedKey) -> SyncMessage {
        encode_clipboard_envelope(&ClipboardItem::text(content), "peer", "me", key).unwrap()
    }

    #[tokio::test]
    async fn test_publish_sends_to_each_paired_device() {
        let f = fixture().await;

        assert_eq!(f.engine.publish_local_change(change("hello")).await, 1);

        let sent = f.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_device_id.as_deref(), Some("peer"));
        let item = decode_clipboard_envelope(&sent[0], &f.peer_key).unwrap();
        assert_eq!(item.content, "hello");
        assert_eq!(item.timestamp, 1_000);
        assert_eq!(f.engine.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_skips_empty_content() {
        let f = fixture().await;
        assert_eq!(f.engine.publish_local_change(change("")).await, 0);
        assert!(f.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_publish_offline_counts_nothing() {
        let f = fixture().await;
        f.sink.offline.store(true, Ordering::SeqCst);
        assert_eq!(f.engine.publish_local_change(change("hello")).await, 0);
        assert_eq!(f.engine.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_update_is_applied() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();

        let applied = f
            .engine
            .handle_incoming(update_from_peer("from peer", &f.peer_key))
            .await
            .unwrap();

        assert_eq!(applied.content, "from peer");
        assert_eq!(f.clipboard.contents(), Some("from peer".to_string()));
        let event = events.recv().await.unwrap();
        assert_eq!(event.source, SyncSource::Remote("peer".to_string()));
    }

    #[tokio::test]
    async fn test_remote_content_is_not_echoed() {
        let f = fixture().await;
        f.engine
            .handle_incoming(update_from_peer("from peer", &f.peer_key))
            .await
            .unwrap();

        assert_eq!(f.engine.publish_local_change(change("from peer")).await, 0);
        assert!(f.sink.sent().is_empty());

        assert_eq!(f.engine.publish_local_change(change("typed locally")).await, 1);
    }

    #[tokio::test]
    async fn test_wrong_key_is_dropped() {
        let f = fixture().await;
        let message = update_from_peer("nope", &SharedKey::generate());

        assert!(f.engine.handle_incoming(message).await.is_none());
        assert_eq!(f.clipboard.contents(), None);
        assert!(f.engine.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_unpaired_sender_is_dropped() {
        let f = fixture().await;
        let message =
            encode_clipboard_envelope(&ClipboardItem::text("x"), "stranger", "me", &f.peer_key)
                .unwrap();
        assert!(f.engine.handle_incoming(message).await.is_none());
    }

    #[tokio::test]
    async fn test_envelope_for_other_device_is_dropped() {
        let f = fixture().await;
        let message =
            encode_clipboard_envelope(&ClipboardItem::text("x"), "peer", "someone-else", &f.peer_key)
                .unwrap();
        assert!(f.engine.handle_incoming(message).await.is_none());
        assert_eq!(f.clipboard.contents(), None);
    }

    #[tokio::test]
    async fn test_control_and_unknown_types_are_ignored() {
        let f = fixture().await;
        assert!(f.engine.handle_incoming(SyncMessage::ping("peer")).await.is_none());
        assert!(f.engine.handle_incoming(SyncMessage::handshake("peer")).await.is_none());

        let unknown = SyncMessage::new(
            MessageType::Unknown("file_offer".to_string()),
            "peer",
            None,
            String::new(),
        );
        assert!(f.engine.handle_incoming(unknown).await.is_none());
    }

    #[tokio::test]
    async fn test_run_routes_both_streams() {
        let f = fixture().await;
        let mut events = f.engine.subscribe();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (changes_tx, changes_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&f.engine).run(incoming_rx, changes_rx, cancel.clone()));

        changes_tx.send(change("local")).await.unwrap();
        assert_eq!(events.recv().await.unwrap().source, SyncSource::Local);

        incoming_tx
            .send(update_from_peer("remote", &f.peer_key))
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.item.content, "remote");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(f.sink.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_updates_in_arrival_order() {
        let clipboard = Arc::new(SlowClipboard::default());
        let (engine, peer_key) =
            paired_engine(clipboard.clone(), Arc::new(RecordingSink::default())).await;
        let mut events = engine.subscribe();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (_changes_tx, changes_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&engine).run(incoming_rx, changes_rx, cancel.clone()));

        incoming_tx.send(update_from_peer("first", &peer_key)).unwrap();
        incoming_tx.send(update_from_peer("second", &peer_key)).unwrap();

        assert_eq!(events.recv().await.unwrap().item.content, "first");
        assert_eq!(events.recv().await.unwrap().item.content, "second");
        assert_eq!(clipboard.inner.contents(), Some("second".to_string()));

        let history: Vec<String> = engine
            .history()
            .await
            .into_iter()
            .map(|item| item.content)
            .collect();
        assert_eq!(history, vec!["second".to_string(), "first".to_string()]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_envelope_stream_ends() {
        let f = fixture().await;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SyncMessage>();
        let (_changes_tx, changes_rx) = mpsc::channel(4);

        let task = tokio::spawn(Arc::clone(&f.engine).run(
            incoming_rx,
            changes_rx,
            CancellationToken::new(),
        ));
        drop(incoming_tx);

        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
