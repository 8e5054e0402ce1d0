//! Error types for the discovery engine.
//!
//! State-conflict and lookup failures are returned synchronously from the
//! controller that rejected the request. Hardware failures that happen after
//! a request was accepted are reported as events instead (see
//! [`EngineEvent`](crate::domain::models::EngineEvent)).

use crate::domain::address::MacAddress;
use thiserror::Error;

/// Errors returned by the engine's public operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// No adapter present, or the requested one is not listed.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("A scan is already in progress")]
    AlreadyScanning,

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Device is already connected")]
    AlreadyConnected,

    /// The address has no entry in the device registry.
    #[error("Unknown device: {0}")]
    UnknownDevice(MacAddress),

    /// Failure reported by the adapter while an operation was in flight.
    #[error("Bluetooth hardware error: {0}")]
    HardwareError(String),

    /// The attempt was superseded by `disconnect` or `forget`.
    #[error("Connection attempt to {0} was cancelled")]
    ConnectionCancelled(MacAddress),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    /// The engine task that owned the request is gone.
    #[error("Device manager has shut down")]
    Shutdown,
}

/// Errors reported by an adapter backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("adapter not found: {0}")]
    NotFound(String),

    #[error("hardware failure: {0}")]
    Hardware(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl From<AdapterError> for EngineError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::NotFound(id) => EngineError::AdapterUnavailable(id),
            other => EngineError::HardwareError(other.to_string()),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
