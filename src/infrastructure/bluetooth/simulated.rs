//! In-process adapter backend
//!
//! Behaves like a radio stack without touching hardware: discovery streams
//! are fed by [`SimulatedAdapter::emit`] (or a scripted beacon loop in demo
//! mode), and connections follow per-device delays and outcomes. Call
//! counters make hardware traffic observable in tests.

use crate::domain::address::MacAddress;
use crate::domain::models::{AdapterId, Advertisement};
use crate::error::AdapterError;
use crate::infrastructure::bluetooth::adapter::{BleAdapter, DiscoveryEvent, DiscoveryStream};
use crate::infrastructure::bluetooth::protocol::uuid_from_u16;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// A peripheral the simulated radio can connect to.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub address: MacAddress,
    pub services: Vec<Uuid>,
    pub connect_delay: Duration,
    pub connect_error: Option<AdapterError>,
    pub discovery_delay: Duration,
    pub discovery_error: Option<AdapterError>,
}

impl SimulatedDevice {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            services: Vec::new(),
            connect_delay: Duration::from_millis(50),
            connect_error: None,
            discovery_delay: Duration::from_millis(20),
            discovery_error: None,
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.services.extend(services);
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn failing_connect(mut self, error: AdapterError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn failing_discovery(mut self, error: AdapterError) -> Self {
        self.discovery_error = Some(error);
        self
    }
}

#[derive(Default)]
struct CallCounts {
    start_discovery: usize,
    stop_discovery: usize,
    connect: HashMap<MacAddress, usize>,
    disconnect: HashMap<MacAddress, usize>,
}

struct SimState {
    adapters: Vec<AdapterId>,
    devices: HashMap<MacAddress, SimulatedDevice>,
    discovery: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    start_error: Option<AdapterError>,
    stop_delay: Duration,
    beacons: Vec<Advertisement>,
    beacon_interval: Duration,
    calls: CallCounts,
}

#[derive(Clone)]
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAdapter {
    pub fn new(adapters: impl IntoIterator<Item = AdapterId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                adapters: adapters.into_iter().collect(),
                devices: HashMap::new(),
                discovery: None,
                start_error: None,
                stop_delay: Duration::ZERO,
                beacons: Vec::new(),
                beacon_interval: Duration::from_millis(500),
                calls: CallCounts::default(),
            })),
        }
    }

    /// One adapter named `sim0`.
    pub fn single() -> Self {
        Self::new([AdapterId::new("sim0")])
    }

    /// A handful of beacons re-advertising on a loop while discovery runs.
    pub fn demo() -> Self {
        let sim = Self::single();
        let beacons = [
            ("B8:27:EB:11:22:33", "Thermometer", -58, vec![0x1809, 0x180F]),
            ("DC:A6:32:44:55:66", "HR Strap", -71, vec![0x180D, 0x180A]),
            ("F0:99:19:AB:CD:EF", "", -83, vec![0x181A]),
        ];
        for (addr, name, rssi, services) in beacons {
            let Ok(address) = MacAddress::parse(addr) else {
                continue;
            };
            let services: Vec<Uuid> = services.into_iter().map(uuid_from_u16).collect();
            sim.add_device(SimulatedDevice::new(address).with_services(services.clone()));
            sim.add_beacon(
                Advertisement::new(address)
                    .with_name(name)
                    .with_rssi(rssi)
                    .with_services(services),
            );
        }
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        self.lock().devices.insert(device.address, device);
    }

    pub fn add_beacon(&self, advertisement: Advertisement) {
        self.lock().beacons.push(advertisement);
    }

    pub fn set_adapters(&self, adapters: impl IntoIterator<Item = AdapterId>) {
        self.lock().adapters = adapters.into_iter().collect();
    }

    pub fn set_start_error(&self, error: Option<AdapterError>) {
        self.lock().start_error = error;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        self.lock().stop_delay = delay;
    }

    /// Deliver an advertisement to the running discovery stream.
    pub fn emit(&self, advertisement: Advertisement) -> bool {
        self.send(DiscoveryEvent::Advertisement(advertisement))
    }

    /// Report a radio failure and end the stream.
    pub fn fail_discovery(&self, message: &str) -> bool {
        let sent = self.send(DiscoveryEvent::Error(message.to_string()));
        self.lock().discovery = None;
        sent
    }

    /// End the stream as if the adapter vanished.
    pub fn end_discovery(&self) {
        self.lock().discovery = None;
    }

    pub fn start_calls(&self) -> usize {
        self.lock().calls.start_discovery
    }

    pub fn stop_calls(&self) -> usize {
        self.lock().calls.stop_discovery
    }

    pub fn connect_calls(&self, address: &MacAddress) -> usize {
        self.lock().calls.connect.get(address).copied().unwrap_or(0)
    }

    pub fn disconnect_calls(&self, address: &MacAddress) -> usize {
        self.lock().calls.disconnect.get(address).copied().unwrap_or(0)
    }

    fn send(&self, event: DiscoveryEvent) -> bool {
        match &self.lock().discovery {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    fn device(&self, address: &MacAddress) -> Result<SimulatedDevice, AdapterError> {
        self.lock()
            .devices
            .get(address)
            .cloned()
            .ok_or_else(|| AdapterError::Hardware(format!("{} is out of range", address)))
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn list_adapters(&self) -> Result<Vec<AdapterId>, AdapterError> {
        Ok(self.lock().adapters.clone())
    }

    async fn start_discovery(&self, adapter: &AdapterId) -> Result<DiscoveryStream, AdapterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (beacons, interval) = {
            let mut state = self.lock();
            state.calls.start_discovery += 1;
            if !state.adapters.contains(adapter) {
                return Err(AdapterError::NotFound(adapter.to_string()));
            }
            if let Some(error) = state.start_error.clone() {
                return Err(error);
            }
            state.discovery = Some(tx.clone());
            (state.beacons.clone(), state.beacon_interval)
        };
        info!("Simulated discovery started on {}", adapter);

        if !beacons.is_empty() {
            tokio::spawn(async move {
                loop {
                    for beacon in &beacons {
                        let mut advertisement = beacon.clone();
                        advertisement.seen_at = chrono::Utc::now();
                        if tx.send(DiscoveryEvent::Advertisement(advertisement)).is_err() {
                            return;
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            });
        } else {
            drop(tx);
        }

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }

    async fn stop_discovery(&self, adapter: &AdapterId) -> Result<(), AdapterError> {
        let delay = {
            let mut state = self.lock();
            state.calls.stop_discovery += 1;
            state.discovery = None;
            state.stop_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!("Simulated discovery stopped on {}", adapter);
        Ok(())
    }

    async fn connect(&self, address: &MacAddress) -> Result<(), AdapterError> {
        *self.lock().calls.connect.entry(*address).or_default() += 1;
        let device = self.device(address)?;
        tokio::time::sleep(device.connect_delay).await;
        match device.connect_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, address: &MacAddress) -> Result<(), AdapterError> {
        *self.lock().calls.disconnect.entry(*address).or_default() += 1;
        Ok(())
    }

    async fn discover_services(&self, address: &MacAddress) -> Result<Vec<Uuid>, AdapterError> {
        let device = self.device(address)?;
        tokio::time::sleep(device.discovery_delay).await;
        match device.discovery_error {
            Some(error) => Err(error),
            None => Ok(device.services),
        }
    }
}
