//! WinRT Transport Module
//!
//! `GattConnector`, `GattLink` and `AdapterMonitor` on top of
//! `Windows.Devices.Bluetooth`.

use crate::domain::models::{AdapterEvent, DeviceIdentity};
use crate::infrastructure::bluetooth::error::TransportError;
use crate::infrastructure::bluetooth::service::AdapterMonitor;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicHandle, CharacteristicProperties, ConnectOptions, DiscoveredCharacteristic,
    DiscoveredService, GattConnector, GattLink, LinkEvent, ValueHandler, WriteType,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::{IInspectable, Ref, GUID, HSTRING};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Enumeration::{DeviceInformation, DeviceInformationUpdate, DeviceWatcher};
use windows::Devices::Radios::{Radio, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// ATT header bytes that do not carry payload.
const ATT_HEADER_SIZE: u16 = 3;

fn platform(e: windows::core::Error) -> TransportError {
    TransportError::Platform(e.message().to_string())
}

fn status(s: GattCommunicationStatus) -> Result<(), TransportError> {
    if s == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Status { status: s.0 })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Convert a UUID string to a GUID
#[cfg(test)]
fn parse_guid(uuid: &str) -> Result<GUID, TransportError> {
    let hex: String = uuid
        .chars()
        .filter(|c| !matches!(c, '-' | '{' | '}'))
        .collect();
    let invalid = || TransportError::Platform(format!("invalid UUID {}", uuid));
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(invalid());
    }

    let d1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let d2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let d3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;
    let mut d4 = [0u8; 8];
    for (i, byte) in d4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(GUID {
        data1: d1,
        data2: d2,
        data3: d3,
        data4: d4,
    })
}

fn guid_string(guid: &GUID) -> String {
    format!("{:?}", guid).to_lowercase()
}

fn properties(flags: GattCharacteristicProperties) -> CharacteristicProperties {
    let has = |bit: GattCharacteristicProperties| flags.0 & bit.0 != 0;
    CharacteristicProperties {
        read: has(GattCharacteristicProperties::Read),
        write: has(GattCharacteristicProperties::Write),
        write_without_response: has(GattCharacteristicProperties::WriteWithoutResponse),
        notify: has(GattCharacteristicProperties::Notify),
        indicate: has(GattCharacteristicProperties::Indicate),
    }
}

/// Event registrations made on WinRT objects, kept so they can be undone.
struct Registrations<T> {
    entries: Mutex<Vec<(T, i64)>>,
}

impl<T> Default for Registrations<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Registrations<T> {
    fn push(&self, source: T, token: i64) {
        lock(&self.entries).push((source, token));
    }

    fn take(&self) -> Vec<(T, i64)> {
        lock(&self.entries).drain(..).collect()
    }
}

/// Paired devices seen by the watcher, keyed by WinRT device id.
///
/// An id is tracked as soon as it is added, before its address is known, so
/// a removal that overtakes the lookup still cancels the pending bond.
#[derive(Default)]
struct PairedDevices {
    devices: HashMap<String, Option<DeviceIdentity>>,
}

impl PairedDevices {
    fn added(&mut self, id: &str) {
        self.devices.entry(id.to_string()).or_insert(None);
    }

    /// Record the address lookup for `id`. Yields the bond event unless the
    /// device was removed in the meantime.
    fn resolved(&mut self, id: &str, identity: DeviceIdentity) -> Option<AdapterEvent> {
        let slot = self.devices.get_mut(id)?;
        *slot = Some(identity.clone());
        Some(AdapterEvent::Bonded(identity))
    }

    fn removed(&mut self, id: &str) -> Option<AdapterEvent> {
        match self.devices.remove(id)? {
            Some(identity) => Some(AdapterEvent::Unbonded(identity)),
            None => {
                debug!("Paired device {} removed before it was resolved", id);
                None
            }
        }
    }
}

/// Opens links with `BluetoothLEDevice::FromBluetoothAddressAsync`.
#[derive(Default)]
pub struct WinRtConnector;

#[async_trait]
impl GattConnector for WinRtConnector {
    async fn connect(
        &self,
        device: &DeviceIdentity,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn GattLink>, TransportError> {
        let address = device
            .to_address()
            .ok_or_else(|| TransportError::Platform(format!("not a Bluetooth address: {}", device)))?;

        let le_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(platform)?
            .await
            .map_err(platform)?;

        let device_id = le_device.BluetoothDeviceId().map_err(platform)?;
        let session = GattSession::FromDeviceIdAsync(&device_id)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        session
            .SetMaintainConnection(options.auto_reconnect)
            .map_err(platform)?;
        info!(device = %device, "GattSession opened, MaintainConnection = {}", options.auto_reconnect);

        let link = Arc::new(WinRtLink {
            device: le_device,
            session,
            characteristics: Mutex::new(HashMap::new()),
            handlers: Registrations::default(),
            device_tokens: Mutex::new(Vec::new()),
        });
        link.watch_device(events)?;
        Ok(link)
    }
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    session: GattSession,
    characteristics: Mutex<HashMap<CharacteristicHandle, GattCharacteristic>>,
    /// Live ValueChanged registrations. At most one after every call.
    handlers: Registrations<GattCharacteristic>,
    device_tokens: Mutex<Vec<i64>>,
}

impl WinRtLink {
    fn watch_device(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        let tx = events.clone();
        let services_changed = TypedEventHandler::new(
            move |_: Ref<BluetoothLEDevice>, _: Ref<IInspectable>| {
                let _ = tx.send(LinkEvent::ServicesInvalidated);
                Ok(())
            },
        );
        let services_token = self
            .device
            .GattServicesChanged(&services_changed)
            .map_err(platform)?;

        let session = self.session.clone();
        let status_changed = TypedEventHandler::new(
            move |dev: Ref<BluetoothLEDevice>, _: Ref<IInspectable>| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? != BluetoothConnectionStatus::Disconnected {
                        return Ok(());
                    }
                    if session.MaintainConnection()? {
                        debug!("Link dropped, waiting for the system to reconnect");
                    } else {
                        let _ = events.send(LinkEvent::Disconnected);
                    }
                }
                Ok(())
            },
        );
        let status_token = self
            .device
            .ConnectionStatusChanged(&status_changed)
            .map_err(platform)?;

        lock(&self.device_tokens).extend([services_token, status_token]);
        Ok(())
    }

    fn clear_value_handlers(&self) {
        for (c, token) in self.handlers.take() {
            let _ = c.RemoveValueChanged(token);
        }
    }

    fn characteristic(&self, handle: &CharacteristicHandle) -> Result<GattCharacteristic, TransportError> {
        lock(&self.characteristics)
            .get(handle)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl GattLink for WinRtLink {
    async fn discover_services(&self) -> Result<Vec<DiscoveredService>, TransportError> {
        // Characteristics from an earlier discovery are about to be replaced.
        self.clear_value_handlers();
        let result = self
            .device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        status(result.Status().map_err(platform)?)?;

        let services = result.Services().map_err(platform)?;
        let services = (0..services.Size().map_err(platform)?)
            .map(|i| services.GetAt(i))
            .collect::<windows::core::Result<Vec<_>>>()
            .map_err(platform)?;

        let mut discovered = Vec::new();
        let mut handles = HashMap::new();
        for service in services {
            let service_uuid = guid_string(&service.Uuid().map_err(platform)?);

            let chars_result = service
                .GetCharacteristicsAsync()
                .map_err(platform)?
                .await
                .map_err(platform)?;
            if chars_result.Status().map_err(platform)? != GattCommunicationStatus::Success {
                debug!("Skipping service {}: characteristics unavailable", service_uuid);
                continue;
            }

            let mut characteristics = Vec::new();
            let chars = chars_result.Characteristics().map_err(platform)?;
            for j in 0..chars.Size().map_err(platform)? {
                let c = chars.GetAt(j).map_err(platform)?;
                let handle = CharacteristicHandle {
                    service_uuid: service_uuid.clone(),
                    uuid: guid_string(&c.Uuid().map_err(platform)?),
                };
                characteristics.push(DiscoveredCharacteristic {
                    handle: handle.clone(),
                    properties: properties(c.CharacteristicProperties().map_err(platform)?),
                });
                handles.insert(handle, c);
            }

            discovered.push(DiscoveredService {
                uuid: service_uuid,
                characteristics,
            });
        }

        *lock(&self.characteristics) = handles;
        Ok(discovered)
    }

    async fn negotiate_payload_size(&self, mtu: u16) -> Result<usize, TransportError> {
        // WinRT negotiates the MTU itself; report what it settled on.
        let pdu = self.session.MaxPduSize().map_err(platform)?;
        debug!("Requested MTU {}, session MaxPduSize {}", mtu, pdu);
        Ok(pdu.saturating_sub(ATT_HEADER_SIZE) as usize)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        let writer = DataWriter::new().map_err(platform)?;
        writer.WriteBytes(value).map_err(platform)?;
        let buffer = writer.DetachBuffer().map_err(platform)?;
        let option = match write_type {
            WriteType::WithResponse => GattWriteOption::WriteWithResponse,
            WriteType::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };

        let result = c
            .WriteValueWithOptionAsync(&buffer, option)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        status(result)
    }

    async fn enable_notifications(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        let result = c
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(platform)?
            .await
            .map_err(platform)?;
        status(result)
    }

    fn set_notification_handler(
        &self,
        characteristic: &CharacteristicHandle,
        handler: ValueHandler,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        self.clear_value_handlers();
        let value_changed = TypedEventHandler::new(
            move |_: Ref<GattCharacteristic>, args: Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut bytes)?;
                    handler(&bytes);
                }
                Ok(())
            },
        );
        let token = c.ValueChanged(&value_changed).map_err(platform)?;
        self.handlers.push(c, token);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.device
            .ConnectionStatus()
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }

    async fn disconnect(&self) {
        self.clear_value_handlers();
        let tokens: Vec<i64> = lock(&self.device_tokens).drain(..).collect();
        if let [services_token, status_token, ..] = tokens[..] {
            let _ = self.device.RemoveGattServicesChanged(services_token);
            let _ = self.device.RemoveConnectionStatusChanged(status_token);
        }
        lock(&self.characteristics).clear();
        let _ = self.session.SetMaintainConnection(false);
        let _ = self.session.Close();
        let _ = self.device.Close();
        info!("Link closed");
    }
}

/// Watches the radio and the set of paired BLE devices.
#[derive(Default)]
pub struct WinRtAdapterMonitor {
    watcher: Mutex<Option<DeviceWatcher>>,
    radio: Mutex<Option<(Radio, i64)>>,
}

impl WinRtAdapterMonitor {
    fn paired_selector() -> Result<HSTRING, TransportError> {
        BluetoothLEDevice::GetDeviceSelectorFromPairingState(true).map_err(platform)
    }

    async fn radio() -> Result<Option<Radio>, TransportError> {
        let adapter = match BluetoothAdapter::GetDefaultAsync().map_err(platform)?.await {
            Ok(adapter) => adapter,
            Err(_) => return Ok(None),
        };
        Ok(Some(
            adapter
                .GetRadioAsync()
                .map_err(platform)?
                .await
                .map_err(platform)?,
        ))
    }

    async fn identity_for(id: &HSTRING) -> Result<DeviceIdentity, TransportError> {
        let device = BluetoothLEDevice::FromIdAsync(id)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        Ok(DeviceIdentity::from_address(
            device.BluetoothAddress().map_err(platform)?,
        ))
    }
}

#[async_trait]
impl AdapterMonitor for WinRtAdapterMonitor {
    async fn is_enabled(&self) -> Result<bool, TransportError> {
        Ok(match Self::radio().await? {
            Some(radio) => radio.State().map_err(platform)? == RadioState::On,
            None => false,
        })
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceIdentity>, TransportError> {
        let infos = DeviceInformation::FindAllAsyncAqsFilter(&Self::paired_selector()?)
            .map_err(platform)?
            .await
            .map_err(platform)?;

        let ids = (0..infos.Size().map_err(platform)?)
            .map(|i| infos.GetAt(i)?.Id())
            .collect::<windows::core::Result<Vec<_>>>()
            .map_err(platform)?;

        let mut bonded = Vec::new();
        for id in ids {
            match Self::identity_for(&id).await {
                Ok(identity) => bonded.push(identity),
                Err(e) => warn!("Skipping paired device: {}", e),
            }
        }
        Ok(bonded)
    }

    async fn watch(&self, events: mpsc::UnboundedSender<AdapterEvent>) -> Result<(), TransportError> {
        let runtime = tokio::runtime::Handle::current();

        if let Some(radio) = Self::radio().await? {
            let tx = events.clone();
            let state_changed = TypedEventHandler::new(move |r: Ref<Radio>, _: Ref<IInspectable>| {
                if let Some(r) = r.as_ref() {
                    let event = if r.State()? == RadioState::On {
                        AdapterEvent::Enabled
                    } else {
                        AdapterEvent::Disabled
                    };
                    let _ = tx.send(event);
                }
                Ok(())
            });
            let token = radio.StateChanged(&state_changed).map_err(platform)?;
            *lock(&self.radio) = Some((radio, token));
        }

        let known: Arc<Mutex<PairedDevices>> = Arc::default();
        let watcher =
            DeviceInformation::CreateWatcherAqsFilter(&Self::paired_selector()?).map_err(platform)?;

        let tx = events.clone();
        let added_known = known.clone();
        let added = TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, info: Ref<DeviceInformation>| {
                if let Some(info) = info.as_ref() {
                    let id = info.Id()?;
                    lock(&added_known).added(&id.to_string());
                    let tx = tx.clone();
                    let known = added_known.clone();
                    runtime.spawn(async move {
                        match Self::identity_for(&id).await {
                            Ok(identity) => {
                                if let Some(event) = lock(&known).resolved(&id.to_string(), identity) {
                                    let _ = tx.send(event);
                                }
                            }
                            Err(e) => {
                                lock(&known).removed(&id.to_string());
                                warn!("Could not resolve paired device: {}", e);
                            }
                        }
                    });
                }
                Ok(())
            },
        );
        watcher.Added(&added).map_err(platform)?;

        // The watcher only reports devices paired later if Updated is handled too.
        let updated = TypedEventHandler::new(
            |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    debug!("Paired device updated: {}", update.Id()?);
                }
                Ok(())
            },
        );
        watcher.Updated(&updated).map_err(platform)?;

        let removed = TypedEventHandler::new(
            move |_: Ref<DeviceWatcher>, update: Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    let id = update.Id()?.to_string();
                    if let Some(event) = lock(&known).removed(&id) {
                        let _ = events.send(event);
                    }
                }
                Ok(())
            },
        );
        watcher.Removed(&removed).map_err(platform)?;

        watcher.Start().map_err(platform)?;
        info!("Watching paired devices");
        *lock(&self.watcher) = Some(watcher);
        Ok(())
    }
}

impl Drop for WinRtAdapterMonitor {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            let _ = watcher.Stop();
        }
        if let Some((radio, token)) = lock(&self.radio).take() {
            let _ = radio.RemoveStateChanged(token);
        }
    }
}
