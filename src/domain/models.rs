use crate::domain::address::MacAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Identifier of a local Bluetooth adapter (e.g. `hci0` or its address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdapterId(pub String);

impl AdapterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which radio path has observed a device.
///
/// Ordered so that `ActiveScan` and `PassiveSniff` both sit below `Both`;
/// a record only ever moves up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceSource {
    #[default]
    ActiveScan,
    PassiveSniff,
    Both,
}

impl DeviceSource {
    /// Combine the current provenance with a new observation's source.
    pub fn escalate(self, observed: DeviceSource) -> DeviceSource {
        if self == observed {
            self
        } else {
            DeviceSource::Both
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    Disconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::DiscoveringServices => "discovering services",
            Self::Disconnecting => "disconnecting",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything the engine knows about one device address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub address: MacAddress,
    pub display_name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub vendor: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub advertised_services: BTreeSet<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub connection_state: ConnectionState,
    pub source: DeviceSource,
    pub persisted: bool,
    /// Resolver generation the cached `vendor` was computed against.
    #[serde(skip)]
    pub(crate) vendor_generation: u64,
}

impl DeviceRecord {
    pub fn new(address: MacAddress, source: DeviceSource, seen_at: DateTime<Utc>) -> Self {
        Self {
            address,
            display_name: None,
            rssi: None,
            tx_power: None,
            vendor: None,
            first_seen: seen_at,
            last_seen: seen_at,
            advertised_services: BTreeSet::new(),
            manufacturer_data: BTreeMap::new(),
            connection_state: ConnectionState::Disconnected,
            source,
            persisted: false,
            vendor_generation: 0,
        }
    }

    /// Name to show in lists; falls back to the address.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

/// Name carried by an observation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameObservation {
    /// The packet carried no name.
    #[default]
    Absent,
    Present(String),
    /// The adapter explicitly reported that the device has no name anymore.
    Cleared,
}

/// A single observation of a device, from a scan or a sniffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub name: NameObservation,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub services: BTreeSet<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub seen_at: DateTime<Utc>,
}

impl Advertisement {
    pub fn new(address: MacAddress) -> Self {
        Self::at(address, Utc::now())
    }

    pub fn at(address: MacAddress, seen_at: DateTime<Utc>) -> Self {
        Self {
            address,
            name: NameObservation::Absent,
            rssi: None,
            tx_power: None,
            services: BTreeSet::new(),
            manufacturer_data: BTreeMap::new(),
            seen_at,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = if name.trim().is_empty() {
            NameObservation::Absent
        } else {
            NameObservation::Present(name)
        };
        self
    }

    pub fn with_cleared_name(mut self) -> Self {
        self.name = NameObservation::Cleared;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_tx_power(mut self, tx_power: i16) -> Self {
        self.tx_power = Some(tx_power);
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.insert(service);
        self
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.services.extend(services);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.insert(company_id, data);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Starting,
    Scanning,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEndReason {
    /// `stop()` was requested.
    Stopped,
    /// The requested duration elapsed.
    Timeout,
    /// The adapter failed or disappeared mid-scan.
    AdapterError(String),
}

/// Notifications delivered to the presentation shell.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ScanStarted {
        adapter: AdapterId,
        generation: u64,
    },
    ScanEnded {
        generation: u64,
        reason: ScanEndReason,
    },
    DeviceUpdated(DeviceRecord),
    DeviceRemoved(MacAddress),
    ConnectionStateChanged {
        address: MacAddress,
        state: ConnectionState,
    },
    VendorTableLoadFailure(String),
    PersistenceCorruption {
        discarded_lines: usize,
    },
    SnifferUnavailable(String),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
