//! Radio stack abstraction
//! The engine talks to the Bluetooth stack only through these traits, so the
//! same connection logic drives the `bluest` backend and the scripted mock radio.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("device not connected")]
    NotConnected,
    #[error("characteristic {0} not offered by device")]
    UnknownCharacteristic(Uuid),
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("{0}")]
    Radio(String),
}

/// One advertising peripheral seen during discovery.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Canonical address.
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Stream of raw notification payloads from one characteristic.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Device discovery and link creation.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Lists peripherals advertising within `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Creates a transport handle for a previously discovered address.
    async fn open(&self, address: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// Transport handle for a single peripheral.
#[async_trait]
pub trait Link: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    /// Enables notifications; the stream ends when the subscription does.
    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, TransportError>;

    /// Resolves once the peer drops the link on its own. A dropped sender means
    /// the watch ended without a disconnect being observed.
    async fn watch_disconnect(&self) -> Result<oneshot::Receiver<()>, TransportError>;
}
