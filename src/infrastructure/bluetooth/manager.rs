//! Device Manager
//!
//! Public façade over the engine: owns the registry and wires the scan,
//! connection, sniffing and persistence parts together. The shell only
//! talks to this type and listens on the [`EngineEvent`] channel.

use crate::domain::address::MacAddress;
use crate::domain::models::{
    AdapterId, ConnectionState, DeviceRecord, EngineEvent, MessageSeverity, ScanState,
    StatusMessage,
};
use crate::domain::registry::{DeviceSnapshot, Registry};
use crate::domain::settings::EngineSettings;
use crate::domain::vendor::{VendorResolver, VendorTableError};
use crate::error::{EngineError, Result};
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use crate::infrastructure::bluetooth::connection::{ConnectionController, ConnectionTimeouts};
use crate::infrastructure::bluetooth::scanner::ScanController;
use crate::infrastructure::bluetooth::sniffer::{SniffSource, SnifferBridge, SnifferStatus};
use crate::infrastructure::persistence::{PersistenceStore, PersistenceWriter};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

pub struct DeviceManager {
    settings: EngineSettings,
    adapter: Arc<dyn BleAdapter>,
    vendors: Arc<VendorResolver>,
    registry: Arc<Registry>,
    scanner: ScanController,
    connections: ConnectionController,
    sniffer: Mutex<SnifferBridge>,
    writer: Mutex<PersistenceWriter>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl DeviceManager {
    /// Load history, report startup problems and start the background tasks.
    pub async fn new(
        settings: EngineSettings,
        adapter: Arc<dyn BleAdapter>,
        vendors: Arc<VendorResolver>,
        mut store: PersistenceStore,
        sniff_source: Option<Arc<dyn SniffSource>>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        if let Some(failure) = vendors.take_load_failure() {
            let _ = event_sender.send(EngineEvent::VendorTableLoadFailure(failure));
        }

        let registry = Arc::new(Registry::new(Arc::clone(&vendors), event_sender.clone()));

        match store.load() {
            Ok(report) => {
                if report.discarded_lines > 0 {
                    let _ = event_sender.send(EngineEvent::PersistenceCorruption {
                        discarded_lines: report.discarded_lines,
                    });
                    // Rewrite the clean prefix so the bad tail is gone for good.
                    if let Err(e) = store.commit() {
                        warn!("Could not rewrite device history: {}", e);
                    }
                }
                let restored = registry.restore(
                    report
                        .records
                        .into_iter()
                        .map(|record| record.into_device_record()),
                );
                info!("Restored {} known device(s)", restored);
            }
            Err(e) => {
                error!("Device history {:?} unreadable: {}", store.path(), e);
                let _ = event_sender.send(EngineEvent::LogMessage(StatusMessage {
                    message: format!("Device history unavailable: {}", e),
                    severity: MessageSeverity::Warning,
                }));
            }
        }

        let (writer, change_sink) = PersistenceWriter::spawn(
            store,
            Arc::downgrade(&registry),
            settings.persistence_debounce(),
            event_sender.clone(),
        );
        registry.attach_change_sink(change_sink);

        let scanner = ScanController::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            event_sender.clone(),
            settings.stop_timeout(),
        );
        let connections = ConnectionController::new(
            Arc::clone(&adapter),
            Arc::clone(&registry),
            event_sender.clone(),
            ConnectionTimeouts {
                connect: settings.connect_timeout(),
                service_discovery: settings.service_discovery_timeout(),
                disconnect: settings.disconnect_timeout(),
            },
        );
        let sniffer =
            SnifferBridge::start(sniff_source, Arc::clone(&registry), event_sender.clone()).await;

        Self {
            settings,
            adapter,
            vendors,
            registry,
            scanner,
            connections,
            sniffer: Mutex::new(sniffer),
            writer: Mutex::new(writer),
            event_sender,
        }
    }

    pub async fn available_adapters(&self) -> Result<Vec<AdapterId>> {
        Ok(self.adapter.list_adapters().await?)
    }

    /// Start a scan. Without an explicit adapter the configured one is used,
    /// then the first one listed.
    pub async fn start_scan(&self, adapter: Option<AdapterId>) -> Result<u64> {
        let adapter = match adapter.or_else(|| self.settings.adapter.clone().map(AdapterId)) {
            Some(adapter) => adapter,
            None => self
                .available_adapters()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| EngineError::AdapterUnavailable("no adapter present".into()))?,
        };
        self.scanner
            .start(adapter, self.settings.scan_duration())
            .await
    }

    /// Start scanning when the settings ask for a scan at launch.
    pub async fn start_auto_scan(&self) -> Result<Option<u64>> {
        if !self.settings.scan_auto {
            return Ok(None);
        }
        self.start_scan(None).await.map(Some)
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop().await
    }

    pub fn scan_state(&self) -> ScanState {
        self.scanner.state()
    }

    pub fn scan_generation(&self) -> u64 {
        self.scanner.generation()
    }

    pub async fn connect(&self, address: MacAddress) -> Result<()> {
        self.connections.connect(address).await
    }

    pub async fn disconnect(&self, address: MacAddress) -> Result<()> {
        self.connections.disconnect(address).await
    }

    /// Return a `Failed` device to `Disconnected`.
    pub fn reset(&self, address: MacAddress) -> Result<()> {
        self.connections.reset(address)
    }

    pub fn connection_state(&self, address: &MacAddress) -> Option<ConnectionState> {
        self.connections.state(address)
    }

    /// Cancel anything in flight for `address` and drop it from the
    /// registry and from history.
    pub async fn forget(&self, address: MacAddress) -> Result<()> {
        if !self.registry.contains(&address) {
            return Err(EngineError::UnknownDevice(address));
        }
        self.connections.forget(address).await;
        self.registry.remove(&address);
        info!(%address, "Device forgotten");
        Ok(())
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.list()
    }

    pub fn device(&self, address: &MacAddress) -> Option<DeviceRecord> {
        self.registry.get(address)
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<DeviceSnapshot> {
        self.registry.subscribe()
    }

    /// Swap in a new vendor table and refresh cached vendor names. The
    /// current table stays in use if the new one cannot be read.
    pub fn reload_vendor_table(&self, path: impl AsRef<Path>) -> Result<usize, VendorTableError> {
        let count = self.vendors.reload(path)?;
        let updated = self.registry.refresh_vendors();
        info!("Vendor table reloaded, {} device(s) updated", updated);
        Ok(count)
    }

    pub async fn sniffer_status(&self) -> SnifferStatus {
        self.sniffer.lock().await.status()
    }

    /// Write pending history changes now.
    pub async fn flush(&self) {
        self.writer.lock().await.flush().await;
    }

    /// Stop scanning, drop all links and write history out.
    pub async fn shutdown(&self) {
        if let Err(e) = self.scanner.stop().await {
            warn!("Stopping scan on shutdown failed: {}", e);
        }
        self.connections.disconnect_all().await;
        self.sniffer.lock().await.stop().await;
        self.writer.lock().await.shutdown().await;
        let _ = self.event_sender.send(EngineEvent::LogMessage(StatusMessage {
            message: "Device manager stopped.".to_string(),
            severity: MessageSeverity::Info,
        }));
        info!("Device manager shut down");
    }
}
