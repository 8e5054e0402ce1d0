//! BLE Scanner Module
//!
//! Drives the adapter's discovery primitive and feeds every observation of
//! the current scan generation into the registry.
//!
//! State machine: `Idle -> Starting -> Scanning -> Stopping -> Idle`. An
//! adapter failure goes straight from `Scanning` to `Idle`.

use crate::domain::models::{
    AdapterId, Advertisement, DeviceSource, EngineEvent, MessageSeverity, ScanEndReason,
    ScanState, StatusMessage,
};
use crate::domain::registry::Registry;
use crate::error::{EngineError, Result};
use crate::infrastructure::bluetooth::adapter::{BleAdapter, DiscoveryEvent, DiscoveryStream};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ScanSession {
    state: ScanState,
    generation: u64,
    adapter: Option<AdapterId>,
    cancel: Option<CancellationToken>,
}

struct ScanShared {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<Registry>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
    stop_timeout: Duration,
    session: Mutex<ScanSession>,
    // Serializes start, stop and the timeout path.
    commands: tokio::sync::Mutex<()>,
}

/// Active-scan driver. One scan at a time per controller.
pub struct ScanController {
    shared: Arc<ScanShared>,
}

impl ScanController {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<Registry>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                adapter,
                registry,
                event_sender,
                stop_timeout,
                session: Mutex::new(ScanSession::default()),
                commands: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.shared.session().state
    }

    /// Generation of the most recently started scan; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.shared.session().generation
    }

    /// Start discovery on `adapter`, optionally bounded by `duration`.
    /// Returns the generation of the new scan.
    pub async fn start(&self, adapter: AdapterId, duration: Option<Duration>) -> Result<u64> {
        let shared = &self.shared;
        let _command = shared.commands.lock().await;

        {
            let mut session = shared.session();
            if session.state != ScanState::Idle {
                return Err(EngineError::AlreadyScanning);
            }
            session.state = ScanState::Starting;
        }

        let stream = match shared.open_discovery(&adapter).await {
            Ok(stream) => stream,
            Err(e) => {
                shared.session().state = ScanState::Idle;
                warn!("Scan on {} not started: {}", adapter, e);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let generation = {
            let mut session = shared.session();
            session.generation += 1;
            session.state = ScanState::Scanning;
            session.adapter = Some(adapter.clone());
            session.cancel = Some(cancel.clone());
            session.generation
        };

        info!(%adapter, generation, ?duration, "Scan started");
        let _ = shared.event_sender.send(EngineEvent::ScanStarted {
            adapter: adapter.clone(),
            generation,
        });
        shared.send_log(format!("Scanning on {}...", adapter), MessageSeverity::Info);

        let deadline = duration.map(|d| Instant::now() + d);
        tokio::spawn(Arc::clone(shared).pump(stream, generation, deadline, cancel));
        Ok(generation)
    }

    /// Stop the current scan. A no-op when idle.
    pub async fn stop(&self) -> Result<()> {
        let _command = self.shared.commands.lock().await;
        self.shared.stop_locked(ScanEndReason::Stopped, None).await;
        Ok(())
    }
}

impl ScanShared {
    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_discovery(&self, adapter: &AdapterId) -> Result<DiscoveryStream> {
        let adapters = self.adapter.list_adapters().await?;
        if !adapters.contains(adapter) {
            return Err(EngineError::AdapterUnavailable(adapter.to_string()));
        }
        Ok(self.adapter.start_discovery(adapter).await?)
    }

    /// Caller holds `commands`. With `only_generation` set, a scan from any
    /// other generation is left alone.
    async fn stop_locked(&self, reason: ScanEndReason, only_generation: Option<u64>) {
        let (adapter, generation) = {
            let mut session = self.session();
            if session.state != ScanState::Scanning {
                return;
            }
            if only_generation.is_some_and(|g| g != session.generation) {
                return;
            }
            session.state = ScanState::Stopping;
            if let Some(cancel) = session.cancel.take() {
                cancel.cancel();
            }
            (session.adapter.clone(), session.generation)
        };

        if let Some(adapter) = &adapter {
            match timeout(self.stop_timeout, self.adapter.stop_discovery(adapter)).await {
                Ok(Ok(())) => debug!(%adapter, "Discovery stopped"),
                Ok(Err(e)) => warn!(%adapter, "Stopping discovery failed: {}", e),
                Err(_) => warn!(%adapter, "No stop confirmation after {:?}", self.stop_timeout),
            }
        }

        {
            let mut session = self.session();
            session.state = ScanState::Idle;
            session.adapter = None;
        }

        info!(generation, ?reason, "Scan ended");
        let message = match &reason {
            ScanEndReason::Timeout => "Scan finished.",
            _ => "Scan stopped.",
        };
        let _ = self
            .event_sender
            .send(EngineEvent::ScanEnded { generation, reason });
        self.send_log(message.to_string(), MessageSeverity::Info);
    }

    /// Adapter failure: no hardware teardown, straight to `Idle`.
    fn fail(&self, generation: u64, message: String) {
        {
            let mut session = self.session();
            if session.state != ScanState::Scanning || session.generation != generation {
                return;
            }
            session.state = ScanState::Idle;
            session.adapter = None;
            session.cancel = None;
        }

        warn!(generation, "Scan aborted by adapter: {}", message);
        self.send_log(format!("Scan aborted: {}", message), MessageSeverity::Error);
        let _ = self.event_sender.send(EngineEvent::ScanEnded {
            generation,
            reason: ScanEndReason::AdapterError(message),
        });
    }

    /// Returns `false` once `generation` is no longer the live scan.
    fn merge_if_current(&self, generation: u64, event: &Advertisement) -> bool {
        // Held across the merge so a stop cannot slip in between check and apply.
        let session = self.session();
        if session.state != ScanState::Scanning || session.generation != generation {
            debug!(generation, address = %event.address, "Dropping late advertisement");
            return false;
        }
        self.registry.upsert_from_advertisement(event, DeviceSource::ActiveScan);
        true
    }

    async fn pump(
        self: Arc<Self>,
        mut stream: DiscoveryStream,
        generation: u64,
        deadline: Option<Instant>,
        cancel: CancellationToken,
    ) {
        let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(wake), if deadline.is_some() => {
                    let _command = self.commands.lock().await;
                    self.stop_locked(ScanEndReason::Timeout, Some(generation)).await;
                    break;
                }
                event = stream.next() => match event {
                    Some(DiscoveryEvent::Advertisement(advertisement)) => {
                        if !self.merge_if_current(generation, &advertisement) {
                            break;
                        }
                    }
                    Some(DiscoveryEvent::Error(message)) => {
                        self.fail(generation, message);
                        break;
                    }
                    None => {
                        self.fail(generation, "discovery stream ended".to_string());
                        break;
                    }
                },
            }
        }
        debug!(generation, "Scan pump finished");
    }

    fn send_log(&self, message: String, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(EngineEvent::LogMessage(StatusMessage { message, severity }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::address::MacAddress;
    use crate::domain::vendor::VendorResolver;
    use crate::infrastructure::bluetooth::simulated::SimulatedAdapter;

    struct Fixture {
        sim: SimulatedAdapter,
        registry: Arc<Registry>,
        scanner: ScanController,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn fixture() -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let sim = SimulatedAdapter::single();
        let registry = Arc::new(Registry::new(Arc::new(VendorResolver::empty()), tx.clone()));
        let scanner = ScanController::new(
            Arc::new(sim.clone()),
            Arc::clone(&registry),
            tx,
            Duration::from_millis(200),
        );
        Fixture {
            sim,
            registry,
            scanner,
            events,
        }
    }

    fn scan_ends(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<ScanEndReason> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ScanEnded { reason, .. } = event {
                out.push(reason);
            }
        }
        out
    }

    fn addr(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    #[tokio::test]
    async fn unknown_adapter_is_unavailable() {
        let f = fixture();
        let err = f.scanner.start(AdapterId::new("hci9"), None).await.unwrap_err();
        assert_eq!(err, EngineError::AdapterUnavailable("hci9".into()));
        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert_eq!(f.sim.start_calls(), 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let f = fixture();
        let generation = f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        assert_eq!(generation, 1);
        assert_eq!(
            f.scanner.start(AdapterId::new("sim0"), None).await,
            Err(EngineError::AlreadyScanning)
        );
        assert_eq!(f.scanner.state(), ScanState::Scanning);
    }

    #[tokio::test]
    async fn stop_while_idle_is_silent() {
        let mut f = fixture();
        f.scanner.stop().await.unwrap();
        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.sim.stop_calls(), 0);
    }

    #[tokio::test]
    async fn advertisements_reach_registry() {
        let f = fixture();
        f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        let a = addr("AA:BB:CC:00:00:01");
        assert!(f.sim.emit(Advertisement::new(a).with_name("Sensor1").with_rssi(-60)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = f.registry.get(&a).unwrap();
        assert_eq!(record.display_name.as_deref(), Some("Sensor1"));
        assert_eq!(record.source, DeviceSource::ActiveScan);
    }

    #[tokio::test]
    async fn stop_discards_queued_events_and_reports_once() {
        let mut f = fixture();
        f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        f.sim.emit(Advertisement::new(addr("AA:BB:CC:00:00:02")));
        f.scanner.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(f.registry.is_empty());
        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert_eq!(scan_ends(&mut f.events), vec![ScanEndReason::Stopped]);

        f.scanner.stop().await.unwrap();
        assert!(scan_ends(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn restart_bumps_generation() {
        let f = fixture();
        let first = f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        f.scanner.stop().await.unwrap();
        let second = f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        assert!(second > first);
        assert_eq!(f.scanner.generation(), second);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_elapses_into_timeout() {
        let mut f = fixture();
        f.scanner
            .start(AdapterId::new("sim0"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert_eq!(f.sim.stop_calls(), 1);
        assert_eq!(scan_ends(&mut f.events), vec![ScanEndReason::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_stop_still_reaches_idle() {
        let f = fixture();
        f.sim.set_stop_delay(Duration::from_secs(30));
        f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        f.scanner.stop().await.unwrap();
        assert_eq!(f.scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn adapter_failure_goes_straight_to_idle() {
        let mut f = fixture();
        f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        f.sim.fail_discovery("radio switched off");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert_eq!(f.sim.stop_calls(), 0);
        assert_eq!(
            scan_ends(&mut f.events),
            vec![ScanEndReason::AdapterError("radio switched off".into())]
        );
    }

    #[tokio::test]
    async fn stream_end_counts_as_adapter_failure() {
        let mut f = fixture();
        f.scanner.start(AdapterId::new("sim0"), None).await.unwrap();
        f.sim.end_discovery();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert!(matches!(
            scan_ends(&mut f.events).as_slice(),
            [ScanEndReason::AdapterError(_)]
        ));
    }

    #[tokio::test]
    async fn start_failure_reverts_to_idle() {
        let f = fixture();
        f.sim.set_start_error(Some(crate::error::AdapterError::Hardware("busy".into())));
        let err = f.scanner.start(AdapterId::new("sim0"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::HardwareError(_)));
        assert_eq!(f.scanner.state(), ScanState::Idle);
        assert_eq!(f.scanner.generation(), 0);
    }
}
