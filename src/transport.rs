//! The Bluetooth capability a poll session drives.
//!
//! [`BleTransport`] is the narrow seam between the poll state machine and a BLE stack:
//! connect, subscribe a characteristic into a [`NotificationSlot`], unsubscribe,
//! disconnect. [`BluestTransport`] implements it on top of `bluest`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::Adapter;
use bluest::Characteristic;
use bluest::Device;
use bluest::Uuid;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio::time::Duration;

use crate::error::TransportError;

/// The service holding the BM2 notify characteristic
pub const BM2_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// The characteristic on which BM2 monitors push their encrypted reading
pub const BM2_NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

/// Advertised names of the supported monitors
pub const DEFAULT_DEVICE_NAMES: [&str; 3] = ["Battery Monitor", "Li Battery Monitor", "ZX-1689"];

/// Where a subscription drops the bytes of incoming notifications.
///
/// A later notification replaces an earlier one that has not been taken yet.
#[derive(Debug, Clone, Default)]
pub struct NotificationSlot(Arc<Mutex<Option<Vec<u8>>>>);

impl NotificationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&self, data: Vec<u8>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(data);
        }
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// A link to one BLE peripheral.
///
/// Implementations only perform single attempts; timeouts and retries belong to the
/// caller.
#[async_trait]
pub trait BleTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Start delivering notifications of `characteristic` into `slot`.
    async fn subscribe(
        &mut self,
        characteristic: Uuid,
        slot: NotificationSlot,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// [`BleTransport`] backed by `bluest`.
pub struct BluestTransport {
    adapter: Adapter,
    device: Device,
    name: String,
    subscription: Option<JoinHandle<()>>,
}

impl BluestTransport {
    /// Scan on the default adapter until a device advertising one of `names` appears.
    pub async fn discover(names: &[String], scan_timeout: Duration) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        adapter.wait_available().await?;

        let (device, name) = timeout(scan_timeout, Self::scan_for(&adapter, names))
            .await
            .map_err(|_| TransportError::DeviceNotFound(format!("nothing found within {scan_timeout:?}")))??;

        log::info!("Found battery monitor {name} ({:?})", device.id());
        Ok(Self { adapter, device, name, subscription: None })
    }

    async fn scan_for(adapter: &Adapter, names: &[String]) -> Result<(Device, String), TransportError> {
        let mut adapter_events = adapter.scan(&[]).await?;
        while let Some(found) = adapter_events.next().await {
            let name = match found.adv_data.local_name.clone() {
                Some(name) => name,
                None => found.device.name_async().await.unwrap_or_default(),
            };
            log::debug!("Advertisement from {name:?} ({:?})", found.device.id());
            if names.iter().any(|n| *n == name) {
                return Ok((found.device, name));
            }
        }
        Err(TransportError::DeviceNotFound("scan ended".to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        let service = self
            .device
            .discover_services_with_uuid(BM2_SERVICE)
            .await?
            .first()
            .ok_or(TransportError::MissingCharacteristic(uuid))?
            .clone();
        let characteristic = service
            .discover_characteristics_with_uuid(uuid)
            .await?
            .first()
            .ok_or(TransportError::MissingCharacteristic(uuid))?
            .clone();
        Ok(characteristic)
    }
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if !self.device.is_connected().await {
            self.adapter.connect_device(&self.device).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        characteristic: Uuid,
        slot: NotificationSlot,
    ) -> Result<(), TransportError> {
        let characteristic = self.find_characteristic(characteristic).await?;
        let (started_tx, started_rx) = oneshot::channel();

        // The notification stream borrows the characteristic, so both live in the task.
        // Dropping the stream (aborting the task) ends the subscription.
        let task = tokio::spawn(async move {
            let mut reader = match characteristic.notify().await {
                Ok(reader) => {
                    let _ = started_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = started_tx.send(Err(err));
                    return;
                }
            };
            while let Some(notification) = reader.next().await {
                match notification {
                    Ok(data) => {
                        log::debug!("RX notification: 0x{}", hex::encode(&data));
                        slot.fill(data);
                    }
                    Err(err) => log::warn!("Notification error: {err}"),
                }
            }
        });

        match started_rx.await {
            Ok(Ok(())) => {
                self.subscription = Some(task);
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(TransportError::Other(
                "notification task ended before subscribing".to_string(),
            )),
        }
    }

    async fn unsubscribe(&mut self, _characteristic: Uuid) -> Result<(), TransportError> {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}

#[test]
fn test_notification_slot() {
    let slot = NotificationSlot::new();
    assert_eq!(slot.take(), None);

    let producer = slot.clone();
    producer.fill(vec![1, 2, 3]);
    producer.fill(vec![4, 5, 6]);
    assert_eq!(slot.take(), Some(vec![4, 5, 6]));
    assert_eq!(slot.take(), None);
}

#[test]
fn test_characteristic_uuid() {
    assert_eq!(
        BM2_NOTIFY_CHARACTERISTIC.to_string(),
        "0000fff4-0000-1000-8000-00805f9b34fb"
    );
}
