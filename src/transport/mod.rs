//! Network transport layer for clipboard mirroring
//!
//! This module provides the persistent TCP client used to reach a paired
//! device: length-prefixed framing, the JSON envelope, and a connection
//! engine with keep-alive and automatic reconnection.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod connection;
pub mod framing;
pub mod protocol;
pub mod reconnect;

pub use connection::{ConnectionEngine, TransportEvent};
pub use framing::{FrameError, MAX_FRAME_LEN};
pub use protocol::{MessageType, SyncMessage, DEFAULT_PORT};
pub use reconnect::ReconnectPolicy;

/// Transport layer errors with user-friendly messages
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection error
    #[error("CM001: Connection failed: {message}. Check that the paired device is online and reachable.")]
    Connection { message: String },

    /// Framing violation on the byte stream
    #[error("CM002: Invalid data on the connection: {0}")]
    Frame(#[from] FrameError),

    /// Message serialization/deserialization error
    #[error("CM003: Data format error: {0}. The message format may be corrupted or incompatible.")]
    Serialization(#[from] serde_json::Error),

    /// Timeout error
    #[error("CM004: Operation timed out after {0:?}. Check your network connection and try again.")]
    Timeout(Duration),
}

/// Connection state of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no reconnect pending
    Disconnected,

    /// A connection attempt is in flight
    Connecting,

    /// Transport attached and handshake sent
    Connected,

    /// The last attempt or connection failed; a reconnect may be scheduled
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

/// Configuration for the connection engine
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum frame body size in either direction (default: 1,000,000 bytes)
    pub max_frame_len: usize,

    /// Connection timeout (default: 10 seconds)
    pub connect_timeout: Duration,

    /// Keep-alive interval (default: 30 seconds)
    pub keepalive_interval: Duration,

    /// Bound on a single framed write (default: 10 seconds)
    pub write_timeout: Duration,

    /// Reconnection backoff
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
