//! BLE device discovery and state engine.
//!
//! [`DeviceManager`] is the entry point: it keeps a registry of every device
//! seen (restored from history at startup), drives scans and connections
//! through a [`BleAdapter`] backend and reports progress as [`EngineEvent`]s.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::address::MacAddress;
pub use domain::models::{
    AdapterId, Advertisement, ConnectionState, DeviceRecord, DeviceSource, EngineEvent,
    ScanEndReason, ScanState,
};
pub use error::{AdapterError, EngineError};
pub use infrastructure::bluetooth::adapter::BleAdapter;
pub use infrastructure::bluetooth::DeviceManager;
