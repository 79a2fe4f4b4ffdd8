//! Windows Runtime Transport Backend
//!
//! Implements the [`Transport`] capability set over the WinRT Bluetooth LE
//! APIs: advertisement watching for discovery and reconnection, GATT
//! connect with a maintained session, characteristic resolution, and
//! notify delivery through `ValueChanged` / `ConnectionStatusChanged`
//! handlers.

use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::transport::{
    CancelToken, Characteristic, GattLink, NotifyEvent, NotifySubscription, Transport,
    TransportError,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// How long the interactive device request scans before treating the
/// prompt as dismissed.
const REQUEST_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport over the Windows runtime BLE stack.
///
/// The platform has no queryable per-application authorization list, so
/// the set of previously authorized devices is supplied by the embedder
/// (from the settings file) at construction.
pub struct WinRtTransport {
    service_uuid: String,
    known_devices: Vec<DeviceHandle>,
}

impl WinRtTransport {
    pub fn new(service_uuid: impl Into<String>, known_devices: Vec<DeviceHandle>) -> Self {
        Self {
            service_uuid: service_uuid.into(),
            known_devices,
        }
    }

    /// Run one advertisement scan until `accept` matches, `cancel` fires,
    /// or `timeout` elapses (`Ok(None)`).
    async fn scan(
        &self,
        accept: impl Fn(&BluetoothLEAdvertisementReceivedEventArgs) -> bool + Send + 'static,
        cancel: Option<&CancelToken>,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceHandle>, TransportError> {
        let watcher = BluetoothLEAdvertisementWatcher::new()
            .map_err(|e| TransportError::PermissionDenied(e.to_string()))?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(|e| TransportError::PermissionDenied(e.to_string()))?;

        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if accept(args) {
                        let name = args
                            .Advertisement()
                            .and_then(|a| a.LocalName())
                            .map(|n| n.to_string())
                            .unwrap_or_default();
                        let address = args.BluetoothAddress()?;
                        if let Some(sender) = sender.lock().unwrap().take() {
                            let _ = sender.send(DeviceHandle::new(
                                address,
                                if name.is_empty() {
                                    "Unknown".to_string()
                                } else {
                                    name
                                },
                            ));
                        }
                    }
                }
                Ok(())
            },
        );
        watcher
            .Received(&handler)
            .map_err(|e| TransportError::PermissionDenied(e.to_string()))?;
        watcher
            .Start()
            .map_err(|e| TransportError::PermissionDenied(e.to_string()))?;

        let found = match (cancel, timeout) {
            (Some(cancel), _) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                device = receiver => device.ok(),
            },
            (None, Some(timeout)) => tokio::select! {
                _ = tokio::time::sleep(timeout) => None,
                device = receiver => device.ok(),
            },
            (None, None) => receiver.await.ok(),
        };

        if let Err(e) = watcher.Stop() {
            warn!(error = %e, "failed to stop advertisement watcher");
        }

        match (found, cancel) {
            (Some(device), _) => Ok(Some(device)),
            (None, Some(_)) => Err(TransportError::Cancelled),
            (None, None) => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    async fn authorized_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self.known_devices.clone())
    }

    async fn request_device(&self) -> Result<DeviceHandle, TransportError> {
        info!(service = %self.service_uuid, "scanning for a rig to pair");
        let target = parse_uuid(&self.service_uuid)
            .map_err(|e| TransportError::NotFound(e.to_string()))?;
        let accept = move |args: &BluetoothLEAdvertisementReceivedEventArgs| {
            let Ok(advertisement) = args.Advertisement() else {
                return false;
            };
            let Ok(uuids) = advertisement.ServiceUuids() else {
                return false;
            };
            let Ok(size) = uuids.Size() else {
                return false;
            };
            (0..size).any(|i| uuids.GetAt(i).is_ok_and(|uuid| uuid == target))
        };
        match self.scan(accept, None, Some(REQUEST_DEVICE_TIMEOUT)).await? {
            Some(device) => Ok(device),
            None => Err(TransportError::UserCancelled),
        }
    }

    async fn watch_advertisements(
        &self,
        device: &DeviceHandle,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        debug!(device = %device, "watching advertisements");
        let address = device.address;
        let accept = move |args: &BluetoothLEAdvertisementReceivedEventArgs| {
            args.BluetoothAddress().is_ok_and(|a| a == address)
        };
        self.scan(accept, Some(cancel), None).await?;
        Ok(())
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<Box<dyn GattLink>, TransportError> {
        info!(device = %device, "connecting to GATT server");
        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(device.address)
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        // A maintained GattSession keeps Windows from silently dropping
        // the link between operations.
        let session = match le_device
            .BluetoothDeviceId()
            .and_then(|id| GattSession::FromDeviceIdAsync(&id))
        {
            Ok(operation) => match operation.await {
                Ok(session) => {
                    if let Err(e) = session.SetMaintainConnection(true) {
                        warn!(error = %e, "could not maintain GATT session");
                    }
                    Some(session)
                }
                Err(e) => {
                    warn!(error = %e, "failed to create GattSession, continuing anyway");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to create GattSession, continuing anyway");
                None
            }
        };

        Ok(Box::new(WinRtLink {
            device: le_device,
            _session: session,
        }))
    }
}

struct WinRtLink {
    device: BluetoothLEDevice,
    _session: Option<GattSession>,
}

#[async_trait]
impl GattLink for WinRtLink {
    async fn resolve_characteristic(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<Arc<dyn Characteristic>, TransportError> {
        let service_guid =
            parse_uuid(service_uuid).map_err(|e| TransportError::NotFound(e.to_string()))?;
        let characteristic_guid =
            parse_uuid(characteristic_uuid).map_err(|e| TransportError::NotFound(e.to_string()))?;

        let services_result = self
            .device
            .GetGattServicesForUuidAsync(service_guid)
            .map_err(|e| TransportError::NotFound(e.to_string()))?
            .await
            .map_err(|e| TransportError::NotFound(e.to_string()))?;
        if services_result
            .Status()
            .map_err(|e| TransportError::NotFound(e.to_string()))?
            != GattCommunicationStatus::Success
        {
            return Err(TransportError::NotFound(
                "failed to enumerate GATT services".to_string(),
            ));
        }

        let service = {
            let services = services_result
                .Services()
                .map_err(|e| TransportError::NotFound(e.to_string()))?;
            if services
                .Size()
                .map_err(|e| TransportError::NotFound(e.to_string()))?
                == 0
            {
                return Err(TransportError::NotFound(format!(
                    "service {service_uuid} not present"
                )));
            }
            services
                .GetAt(0)
                .map_err(|e| TransportError::NotFound(e.to_string()))?
        };
        debug!("rig service found");

        if let Ok(operation) = service.RequestAccessAsync() {
            match operation.await {
                Ok(status) => debug!(?status, "service access requested"),
                Err(e) => warn!(error = %e, "service access request failed"),
            }
        }

        let characteristics_result = service
            .GetCharacteristicsAsync()
            .map_err(|e| TransportError::NotFound(e.to_string()))?
            .await
            .map_err(|e| TransportError::NotFound(e.to_string()))?;
        if characteristics_result
            .Status()
            .map_err(|e| TransportError::NotFound(e.to_string()))?
            != GattCommunicationStatus::Success
        {
            return Err(TransportError::NotFound(
                "failed to enumerate characteristics".to_string(),
            ));
        }

        let characteristics = characteristics_result
            .Characteristics()
            .map_err(|e| TransportError::NotFound(e.to_string()))?;
        let size = characteristics
            .Size()
            .map_err(|e| TransportError::NotFound(e.to_string()))?;
        for i in 0..size {
            let candidate = characteristics
                .GetAt(i)
                .map_err(|e| TransportError::NotFound(e.to_string()))?;
            if candidate
                .Uuid()
                .map_err(|e| TransportError::NotFound(e.to_string()))?
                == characteristic_guid
            {
                debug!("command characteristic found");
                return Ok(Arc::new(WinRtCharacteristic {
                    device: self.device.clone(),
                    characteristic: candidate,
                }));
            }
        }
        Err(TransportError::NotFound(format!(
            "characteristic {characteristic_uuid} not present"
        )))
    }

    fn close(&self) {
        if let Err(e) = self.device.Close() {
            warn!(error = %e, "error closing BLE device");
        }
    }
}

struct WinRtCharacteristic {
    device: BluetoothLEDevice,
    characteristic: GattCharacteristic,
}

#[async_trait]
impl Characteristic for WinRtCharacteristic {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let writer = DataWriter::new().map_err(|e| TransportError::Write(e.to_string()))?;
        writer
            .WriteBytes(frame)
            .map_err(|e| TransportError::Write(e.to_string()))?;
        let buffer = writer
            .DetachBuffer()
            .map_err(|e| TransportError::Write(e.to_string()))?;
        let status = self
            .characteristic
            .WriteValueAsync(&buffer)
            .map_err(|e| TransportError::Write(e.to_string()))?
            .await
            .map_err(|e| TransportError::Write(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Write(format!(
                "write returned {status:?}"
            )));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        sink: mpsc::UnboundedSender<NotifyEvent>,
    ) -> Result<NotifySubscription, TransportError> {
        // Value handler first, so nothing notified after the CCCD write is
        // lost.
        let value_sink = sink.clone();
        let value_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(value) = args.CharacteristicValue() {
                        if let Ok(reader) = DataReader::FromBuffer(&value) {
                            let length = reader.UnconsumedBufferLength().unwrap_or(0) as usize;
                            let mut bytes = vec![0u8; length];
                            if reader.ReadBytes(&mut bytes).is_ok() {
                                let _ = value_sink.send(NotifyEvent::Value(bytes));
                            }
                        }
                    }
                }
                Ok(())
            },
        );
        let value_token = self
            .characteristic
            .ValueChanged(&value_handler)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let status_sink = sink;
        let status_handler =
            TypedEventHandler::new(move |device: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(device) = device.as_ref() {
                    if let Ok(status) = device.ConnectionStatus() {
                        if status == BluetoothConnectionStatus::Disconnected {
                            let _ = status_sink.send(NotifyEvent::Disconnected);
                        }
                    }
                }
                Ok(())
            });
        let status_token = self
            .device
            .ConnectionStatusChanged(&status_handler)
            .map_err(|e| {
                let _ = self.characteristic.RemoveValueChanged(value_token);
                TransportError::Subscribe(e.to_string())
            })?;

        // CCCD write enabling notifications, retried a few times: some
        // stacks need a moment after pairing before they accept it.
        let mut enabled = false;
        for attempt in 1..=3 {
            match self
                .characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::Notify,
                ) {
                Ok(operation) => match operation.await {
                    Ok(status) if status == GattCommunicationStatus::Success => {
                        enabled = true;
                        break;
                    }
                    Ok(status) => {
                        warn!(?status, attempt, "notify subscription not accepted");
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "notify subscription attempt failed");
                    }
                },
                Err(e) => {
                    warn!(error = %e, attempt, "notify subscription attempt failed");
                }
            }
            if attempt < 3 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        if !enabled {
            let _ = self.characteristic.RemoveValueChanged(value_token);
            let _ = self.device.RemoveConnectionStatusChanged(status_token);
            return Err(TransportError::Subscribe(
                "failed to enable notifications".to_string(),
            ));
        }
        info!("notifications enabled");

        let characteristic = self.characteristic.clone();
        let device = self.device.clone();
        Ok(NotifySubscription::new(move || {
            let _ = characteristic.RemoveValueChanged(value_token);
            let _ = device.RemoveConnectionStatusChanged(status_token);
            // Disabling the CCCD is best-effort; the link is usually on
            // its way down already.
            if let Ok(operation) = characteristic
                .WriteClientCharacteristicConfigurationDescriptorAsync(
                    GattClientCharacteristicConfigurationDescriptorValue::None,
                )
            {
                tokio::spawn(async move {
                    let _ = operation.await;
                });
            }
        }))
    }
}

/// Parse a UUID string into a Windows GUID
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<GUID> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    let d1 = u32::from_str_radix(&uuid_str[0..8], 16)?;
    let d2 = u16::from_str_radix(&uuid_str[8..12], 16)?;
    let d3 = u16::from_str_radix(&uuid_str[12..16], 16)?;

    let mut d4 = [0u8; 8];
    for i in 0..8 {
        d4[i] = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16)?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol;

    #[test]
    fn test_parse_uuid() {
        let guid = parse_uuid(protocol::SERVICE_UUID).unwrap();
        assert_eq!(guid.data1, 0x4fafc201);
    }

    #[test]
    fn test_parse_uuid_rejects_short_input() {
        assert!(parse_uuid("4fafc201").is_err());
    }
}
