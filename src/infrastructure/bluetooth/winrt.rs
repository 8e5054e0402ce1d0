//! WinRT adapter backend
//!
//! Discovery uses `BluetoothLEAdvertisementWatcher` in active mode;
//! connections are kept alive with a `GattSession` per device.

use crate::domain::address::MacAddress;
use crate::domain::models::{AdapterId, Advertisement};
use crate::error::AdapterError;
use crate::infrastructure::bluetooth::adapter::{BleAdapter, DiscoveryEvent, DiscoveryStream};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{GattCommunicationStatus, GattSession};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothError, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataReader;

fn hardware(e: windows::core::Error) -> AdapterError {
    AdapterError::Hardware(e.to_string())
}

struct Link {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
}

#[derive(Default)]
pub struct WinRtAdapter {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    links: Mutex<HashMap<MacAddress, Link>>,
}

impl WinRtAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn watcher(&self) -> MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<MacAddress, Link>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self, address: &MacAddress) -> Result<BluetoothLEDevice, AdapterError> {
        self.links()
            .get(address)
            .map(|link| link.device.clone())
            .ok_or_else(|| AdapterError::Hardware(format!("{} is not connected", address)))
    }
}

fn to_advertisement(
    args: &BluetoothLEAdvertisementReceivedEventArgs,
) -> windows::core::Result<Advertisement> {
    let address = MacAddress::from_u64(args.BluetoothAddress()?);
    let adv = args.Advertisement()?;

    let mut advertisement = Advertisement::new(address)
        .with_name(adv.LocalName()?.to_string())
        .with_rssi(args.RawSignalStrengthInDBm()?);

    if let Ok(tx_power) = args.TransmitPowerLevelInDBm().and_then(|r| r.Value()) {
        advertisement = advertisement.with_tx_power(tx_power);
    }

    let service_uuids = adv.ServiceUuids()?;
    for i in 0..service_uuids.Size()? {
        let uuid = Uuid::from_u128(service_uuids.GetAt(i)?.to_u128());
        advertisement = advertisement.with_service(uuid);
    }

    let manufacturer_data = adv.ManufacturerData()?;
    for i in 0..manufacturer_data.Size()? {
        let entry = manufacturer_data.GetAt(i)?;
        let buffer = entry.Data()?;
        let reader = DataReader::FromBuffer(&buffer)?;
        let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
        reader.ReadBytes(&mut bytes)?;
        advertisement = advertisement.with_manufacturer_data(entry.CompanyId()?, bytes);
    }

    Ok(advertisement)
}

#[async_trait]
impl BleAdapter for WinRtAdapter {
    async fn list_adapters(&self) -> Result<Vec<AdapterId>, AdapterError> {
        let adapter = BluetoothAdapter::GetDefaultAsync()
            .map_err(hardware)?
            .await
            .map_err(|e| AdapterError::NotFound(e.to_string()))?;
        let address = adapter.BluetoothAddress().map_err(hardware)?;
        Ok(vec![AdapterId::new(MacAddress::from_u64(address).to_string())])
    }

    async fn start_discovery(&self, adapter: &AdapterId) -> Result<DiscoveryStream, AdapterError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(hardware)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(hardware)?;

        let sender = tx.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match to_advertisement(args) {
                        Ok(advertisement) => {
                            let _ = sender.send(DiscoveryEvent::Advertisement(advertisement));
                        }
                        Err(e) => warn!("Unreadable advertisement: {}", e),
                    }
                }
                Ok(())
            },
        );

        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        let message = format!("watcher stopped: {:?}", error);
                        let _ = tx.send(DiscoveryEvent::Error(message));
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&received).map_err(hardware)?;
        watcher.Stopped(&stopped).map_err(hardware)?;
        watcher.Start().map_err(hardware)?;
        info!("Advertisement watcher started on {}", adapter);
        *self.watcher() = Some(watcher);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn stop_discovery(&self, adapter: &AdapterId) -> Result<(), AdapterError> {
        let watcher = self.watcher().take();
        if let Some(watcher) = watcher {
            info!("Stopping advertisement watcher on {}", adapter);
            watcher.Stop().map_err(hardware)?;
        }
        Ok(())
    }

    async fn connect(&self, address: &MacAddress) -> Result<(), AdapterError> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.to_u64())
            .map_err(hardware)?
            .await
            .map_err(hardware)?;

        // A session with MaintainConnection keeps the link up between GATT calls.
        let session = match device.BluetoothDeviceId() {
            Ok(id) => match GattSession::FromDeviceIdAsync(&id) {
                Ok(pending) => pending.await.ok(),
                Err(_) => None,
            },
            Err(_) => None,
        };
        match &session {
            Some(session) => {
                let _ = session.SetMaintainConnection(true);
            }
            None => warn!(%address, "No GATT session, link may drop while idle"),
        }

        self.links().insert(*address, Link { device, session });
        Ok(())
    }

    async fn disconnect(&self, address: &MacAddress) -> Result<(), AdapterError> {
        let link = self.links().remove(address);
        if let Some(link) = link {
            if let Some(session) = link.session {
                let _ = session.Close();
            }
            link.device.Close().map_err(hardware)?;
        }
        Ok(())
    }

    async fn discover_services(&self, address: &MacAddress) -> Result<Vec<Uuid>, AdapterError> {
        let device = self.device(address)?;
        let result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(hardware)?
            .await
            .map_err(hardware)?;

        let status = result.Status().map_err(hardware)?;
        if status != GattCommunicationStatus::Success {
            return Err(AdapterError::Hardware(format!(
                "GATT service query failed: {:?}",
                status
            )));
        }

        let services = result.Services().map_err(hardware)?;
        let mut uuids = Vec::new();
        for i in 0..services.Size().map_err(hardware)? {
            let service = services.GetAt(i).map_err(hardware)?;
            uuids.push(Uuid::from_u128(service.Uuid().map_err(hardware)?.to_u128()));
        }
        Ok(uuids)
    }
}
