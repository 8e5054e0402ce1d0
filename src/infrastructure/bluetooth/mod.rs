//! Bluetooth Module
//!
//! Device discovery and state engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DeviceManager                        │
//! │   (public façade - the only type the shell talks to)     │
//! └──────┬──────────────┬──────────────┬──────────────┬─────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//! ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌────────────┐
//! │  Scanner   │ │ Connection │ │  Sniffer   │ │ Persistence│
//! │            │ │            │ │            │ │   writer   │
//! │ - discovery│ │ - per-dev  │ │ - passive  │ │ - debounced│
//! │ - timeout  │ │   slots    │ │   capture  │ │   commits  │
//! │ - gen tags │ │ - services │ │            │ │            │
//! └─────┬──────┘ └─────┬──────┘ └─────┬──────┘ └─────▲──────┘
//!       │              │              │              │
//!       └──────────────┴──────┬───────┘              │
//!                             ▼                      │
//!                      ┌────────────┐   changes      │
//!                      │  Registry  │────────────────┘
//!                      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`adapter`] - Capability trait every radio backend implements
//! - [`protocol`] - UUID helpers, service names, advertising data parsing
//! - [`scanner`] - Scan state machine and generation filtering
//! - [`connection`] - Per-device connection state machines
//! - [`sniffer`] - Passive capture bridge
//! - [`ubertooth`] - Ubertooth One capture source
//! - [`simulated`] - In-process backend for demos and tests
//! - [`manager`] - Public façade

pub mod adapter;
pub mod connection;
pub mod manager;
pub mod protocol;
pub mod scanner;
pub mod simulated;
pub mod sniffer;
pub mod ubertooth;
#[cfg(windows)]
pub mod winrt;

// Re-export main façade for convenience
pub use manager::DeviceManager;
