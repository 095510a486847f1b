//! Device layer: the generic contract between the connection supervisor and
//! concrete device drivers.
//!
//! A driver implements [`DeviceController`] (create, enumerate, validate)
//! and hands out [`Device`] handles. The [`adapter::DeviceAdapter`] owns the
//! connect/disconnect/reconnect lifecycle so drivers and business logic
//! never deal with it directly; drivers report physical connection loss
//! through the [`adapter::LossHandle`] given to them at creation time.

pub mod adapter;
pub mod mock;

pub use adapter::{AdapterOptions, AdapterPhase, DeviceAdapter, LossHandle};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Enumeration entry for a connectable device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Driver-specific address (serial port path, IP, bus id).
    pub address: String,
    /// Optional human-readable label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A connected device handle.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable logical identifier.
    fn id(&self) -> &str;

    /// Human-readable label.
    fn label(&self) -> &str {
        self.id()
    }

    /// Addressable sub-points exposed by this device.
    fn nodes(&self) -> Vec<String> {
        Vec::new()
    }

    /// Release the underlying physical connection.
    async fn close(&self) -> Result<()>;
}

/// Driver-side factory and validation hooks consumed by the adapter.
///
/// The connection-event hooks are optional; the default implementations do
/// nothing.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Try to create a device at `address`. `Ok(None)` means no device
    /// answered there; `Err` means the attempt itself failed. The returned
    /// device must call `on_close.lost()` when it detects that the physical
    /// connection dropped.
    async fn create_device(
        &self,
        address: &str,
        on_close: LossHandle,
    ) -> Result<Option<Arc<dyn Device>>>;

    /// Enumerate candidate devices for address-less connection.
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Validate a freshly created device (identity or serial-number check).
    async fn test_device(&self, device: &Arc<dyn Device>) -> Result<bool>;

    /// Fired after a successful connection.
    async fn on_connection(&self, _reconnection: bool) {}

    /// Fired after a failed connection attempt.
    async fn on_connection_fail(&self, _reconnection: bool) {}

    /// Fired exactly once per disconnection; `lost` distinguishes
    /// device-initiated loss from an explicit stop.
    async fn on_disconnection(&self, _lost: bool) {}
}
