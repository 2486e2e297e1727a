//! The long-running `run` command

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clipboard::{
    ClipboardChange, ClipboardHistory, ClipboardPoller, ClipboardProvider, MemoryClipboard,
    SystemClipboard,
};
use crate::config::Config;
use crate::pairing::PairingStore;
use crate::sync::{SyncEngine, SyncSource};
use crate::transport::protocol::now_millis;
use crate::transport::ConnectionEngine;

pub struct RunOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Take clipboard changes from stdin lines and print received items
    pub use_stdin: bool,
}

/// Connect to the peer and mirror the clipboard until Ctrl-C
pub async fn run_session(config: &Config, store: PairingStore, options: RunOptions) -> Result<()> {
    let host = options
        .host
        .or_else(|| config.peer.host.clone())
        .context("No peer host configured. Pass --host or set [peer].host in the config file.")?;
    let port = options.port.unwrap_or(config.peer.port);

    let device_id = store.device_id().await?;
    let paired = store.paired_devices().await.len();
    if paired == 0 {
        warn!("No paired devices; received updates will be dropped and nothing is sent");
    }
    info!(device_id = %device_id, paired, "Starting ClipMirror");

    let cancel = CancellationToken::new();
    let (engine, incoming) = ConnectionEngine::new(device_id.clone(), config.transport_config());

    let clipboard: Arc<dyn ClipboardProvider> = if options.use_stdin {
        Arc::new(MemoryClipboard::new())
    } else {
        Arc::new(SystemClipboard::new()?)
    };

    let changes = if options.use_stdin {
        spawn_stdin_reader(cancel.child_token())
    } else {
        ClipboardPoller::new(clipboard.clone(), config.poll_interval()).spawn(cancel.child_token())
    };

    let sync = Arc::new(SyncEngine::new(
        device_id,
        Arc::new(store),
        clipboard,
        Arc::new(engine.clone()),
        ClipboardHistory::new(config.clipboard.history_size),
    ));

    if options.use_stdin {
        tokio::spawn(print_remote_items(sync.subscribe(), cancel.child_token()));
    }
    tokio::spawn(log_state_changes(engine.clone(), cancel.child_token()));

    engine.connect(host, port);
    let sync_task = tokio::spawn(Arc::clone(&sync).run(incoming, changes, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    engine.disconnect();
    cancel.cancel();
    if let Err(e) = sync_task.await {
        warn!("Sync task ended abnormally: {}", e);
    }

    Ok(())
}

fn spawn_stdin_reader(cancel: CancellationToken) -> mpsc::Receiver<ClipboardChange> {
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(content)) => {
                    let change = ClipboardChange {
                        content,
                        observed_at: now_millis(),
                    };
                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    rx
}

async fn print_remote_items(
    mut events: broadcast::Receiver<crate::sync::SyncEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                if let SyncSource::Remote(from) = event.source {
                    println!("[{}] {}", from, event.item.content);
                }
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!("Missed {} clipboard events", count);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_state_changes(engine: ConnectionEngine, cancel: CancellationToken) {
    let mut states = engine.subscribe_state();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                info!("Connection state: {}", state);
            }
        }
    }
}
