//! Contract between the ingestion core and the radio stack.
//!
//! Sessions only ever talk to a [`Radio`] and the [`Link`]s it opens, so the
//! BlueZ backend can be swapped for an in-memory one in tests.

use async_trait::async_trait;
use bluer::Uuid;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::error::TransportError;

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    pub address: String,
}

/// Raw notification payloads, in arrival order. The stream ends when the
/// link drops or the peripheral stops notifying.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait Radio: Send + Sync {
    /// Scan for `timeout` and report every named device that was seen
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Open a connection to the device at `address`
    async fn open_link(&self, address: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// An open connection to one peripheral
#[async_trait]
pub trait Link: Send + Sync {
    /// Start notifications on `channel`
    async fn subscribe(&self, channel: Uuid) -> Result<NotificationStream, TransportError>;

    async fn write(&self, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// Release the connection. Must be safe to call on an already dropped link.
    async fn close(&self);
}
