//! # ClipMirror
//!
//! Clipboard mirroring between two paired devices over a persistent TCP
//! link. Clipboard snapshots travel as AES-256-GCM sealed JSON envelopes
//! keyed by a secret exchanged once through a pairing code.
//!
//! The pieces, leaf first:
//!
//! - [`crypto`]: stateless AES-256-GCM sealing and the [`crypto::SharedKey`] type
//! - [`pairing`]: device identity and the paired-device set
//! - [`transport`]: framing, the wire envelope, and the reconnecting
//!   [`transport::ConnectionEngine`]
//! - [`sync`]: envelope codec and the [`sync::SyncEngine`] orchestrator
//! - [`clipboard`]: clipboard providers, history, and change polling

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod crypto;
pub mod pairing;
pub mod sync;
pub mod transport;

pub use config::Config;

/// Result type alias for ClipMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ClipMirror operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cipher error
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    /// Pairing rejected or pairing data unavailable
    #[error("Pairing error: {0}")]
    Pairing(#[from] pairing::PairingError),

    /// Persistence backend error
    #[error("Storage error: {0}")]
    Storage(#[from] pairing::StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard operation error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Outbound envelope could not be built
    #[error("Encode error: {0}")]
    Encode(#[from] sync::EncodeError),

    /// Inbound envelope could not be opened
    #[error("Decode error: {0}")]
    Decode(#[from] sync::DecodeError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the file-backed pairing store in `config.data_dir`
pub async fn open_pairing_store(config: &Config) -> Result<pairing::PairingStore> {
    let persistence = std::sync::Arc::new(pairing::FilePersistence::new(&config.data_dir));
    Ok(pairing::PairingStore::open(persistence).await?)
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
