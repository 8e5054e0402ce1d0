//! BLE Connection Module
//!
//! Per-device connect / service discovery / disconnect lifecycles.
//!
//! Every device with connection history owns a slot in an arena keyed by
//! address. A slot carries the current state and the id of the attempt
//! that is allowed to change it; ids come from one global counter, so a
//! completion that arrives after `disconnect` or `forget` no longer matches
//! and is dropped.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> DiscoveringServices -> Connected
//!                     |                             |                  |
//!                     +-----------> Failed <--------+                  v
//!                                     |                          Disconnecting
//!                                     +--- reset/disconnect --> Disconnected
//! ```

use crate::domain::address::MacAddress;
use crate::domain::models::{ConnectionState, EngineEvent, MessageSeverity, StatusMessage};
use crate::domain::registry::Registry;
use crate::error::{EngineError, Result};
use crate::infrastructure::bluetooth::adapter::BleAdapter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Bounds for each hardware request
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub service_discovery: Duration,
    pub disconnect: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            service_discovery: Duration::from_secs(15),
            disconnect: Duration::from_secs(3),
        }
    }
}

type Waiter = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct Slot {
    state: ConnectionState,
    attempt: u64,
    waiters: Vec<Waiter>,
}

struct ConnectionShared {
    adapter: Arc<dyn BleAdapter>,
    registry: Arc<Registry>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
    timeouts: ConnectionTimeouts,
    slots: Mutex<HashMap<MacAddress, Slot>>,
    next_attempt: AtomicU64,
}

/// Owner of every per-device connection state machine
pub struct ConnectionController {
    shared: Arc<ConnectionShared>,
}

impl ConnectionController {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        registry: Arc<Registry>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                adapter,
                registry,
                event_sender,
                timeouts,
                slots: Mutex::new(HashMap::new()),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Current state, `None` for addresses the registry does not know.
    pub fn state(&self, address: &MacAddress) -> Option<ConnectionState> {
        let slots = self.shared.slots();
        match slots.get(address) {
            Some(slot) => Some(slot.state),
            None => self
                .shared
                .registry
                .contains(address)
                .then_some(ConnectionState::Disconnected),
        }
    }

    /// Connect and wait for the link. A call made while an attempt is in
    /// flight joins it and gets the same result.
    pub async fn connect(&self, address: MacAddress) -> Result<()> {
        let shared = &self.shared;
        let receiver = {
            let mut slots = shared.slots();
            if !slots.contains_key(&address) && !shared.registry.contains(&address) {
                return Err(EngineError::UnknownDevice(address));
            }
            let slot = slots.entry(address).or_default();
            match slot.state {
                ConnectionState::Connecting => {
                    debug!(%address, "Joining in-flight connection attempt");
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    rx
                }
                ConnectionState::Connected | ConnectionState::DiscoveringServices => {
                    return Err(EngineError::AlreadyConnected);
                }
                ConnectionState::Disconnecting => return Err(EngineError::AlreadyConnecting),
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    let attempt = shared.next_attempt();
                    slot.attempt = attempt;
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push(tx);
                    shared.transition(&address, slot, ConnectionState::Connecting);
                    info!(%address, attempt, "Connecting");
                    tokio::spawn(Arc::clone(shared).run_attempt(address, attempt));
                    rx
                }
            }
        };
        receiver.await.unwrap_or(Err(EngineError::Shutdown))
    }

    /// Tear the link down from any state; always ends `Disconnected`.
    pub async fn disconnect(&self, address: MacAddress) -> Result<()> {
        let shared = &self.shared;
        let (attempt, waiters) = {
            let mut slots = shared.slots();
            let known = shared.registry.contains(&address);
            let Some(slot) = slots.get_mut(&address) else {
                return if known {
                    Ok(())
                } else {
                    Err(EngineError::UnknownDevice(address))
                };
            };
            if matches!(
                slot.state,
                ConnectionState::Disconnected | ConnectionState::Disconnecting
            ) {
                return Ok(());
            }
            let attempt = shared.next_attempt();
            slot.attempt = attempt;
            let waiters = std::mem::take(&mut slot.waiters);
            shared.transition(&address, slot, ConnectionState::Disconnecting);
            (attempt, waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(Err(EngineError::ConnectionCancelled(address)));
        }

        shared.teardown(&address).await;

        let mut slots = shared.slots();
        if let Some(slot) = slots.get_mut(&address) {
            if slot.attempt == attempt {
                shared.transition(&address, slot, ConnectionState::Disconnected);
            }
        }
        info!(%address, "Disconnected");
        Ok(())
    }

    /// Clear `Failed` without touching hardware. Other states are left as they are.
    pub fn reset(&self, address: MacAddress) -> Result<()> {
        let shared = &self.shared;
        let mut slots = shared.slots();
        match slots.get_mut(&address) {
            Some(slot) if slot.state == ConnectionState::Failed => {
                slot.attempt = shared.next_attempt();
                shared.transition(&address, slot, ConnectionState::Disconnected);
                Ok(())
            }
            Some(_) => Ok(()),
            None if shared.registry.contains(&address) => Ok(()),
            None => Err(EngineError::UnknownDevice(address)),
        }
    }

    /// Drop the slot, cancel anything in flight and tear the link down.
    /// Late completions for the address are ignored afterwards.
    pub async fn forget(&self, address: MacAddress) {
        let removed = self.shared.slots().remove(&address);
        let Some(slot) = removed else {
            return;
        };
        for waiter in slot.waiters {
            let _ = waiter.send(Err(EngineError::ConnectionCancelled(address)));
        }
        if slot.state != ConnectionState::Disconnected {
            self.shared.teardown(&address).await;
        }
        debug!(%address, "Connection slot released");
    }

    /// Disconnect every device that is not already idle.
    pub async fn disconnect_all(&self) {
        let active: Vec<MacAddress> = self
            .shared
            .slots()
            .iter()
            .filter(|(_, slot)| slot.state != ConnectionState::Disconnected)
            .map(|(address, _)| *address)
            .collect();
        for address in active {
            if let Err(e) = self.disconnect(address).await {
                warn!(%address, "Disconnect on shutdown failed: {}", e);
            }
        }
    }
}

impl ConnectionShared {
    fn slots(&self) -> MutexGuard<'_, HashMap<MacAddress, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_attempt(&self) -> u64 {
        self.next_attempt.fetch_add(1, Ordering::SeqCst)
    }

    /// Caller holds the slot lock, which keeps transitions for one address ordered.
    fn transition(&self, address: &MacAddress, slot: &mut Slot, state: ConnectionState) {
        if slot.state == state {
            return;
        }
        debug!(%address, from = %slot.state, to = %state, "Connection state");
        slot.state = state;
        self.registry.set_connection_state(address, state);
        let _ = self.event_sender.send(EngineEvent::ConnectionStateChanged {
            address: *address,
            state,
        });
    }

    async fn run_attempt(self: Arc<Self>, address: MacAddress, attempt: u64) {
        let outcome = match timeout(self.timeouts.connect, self.adapter.connect(&address)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::HardwareError(e.to_string())),
            Err(_) => Err(EngineError::HardwareError(format!(
                "connect timed out after {:?}",
                self.timeouts.connect
            ))),
        };

        // None when this attempt still owns the slot, otherwise whether the
        // late link has to be dropped.
        let superseded = {
            let mut slots = self.slots();
            match slots.get_mut(&address) {
                Some(slot) if slot.attempt == attempt => {
                    let waiters = std::mem::take(&mut slot.waiters);
                    match &outcome {
                        Ok(()) => {
                            self.transition(&address, slot, ConnectionState::Connected);
                            info!(%address, "Connected");
                            self.send_log(
                                format!("Connected to {}", address),
                                MessageSeverity::Success,
                            );
                        }
                        Err(e) => {
                            self.transition(&address, slot, ConnectionState::Failed);
                            error!(%address, "Connection failed: {}", e);
                            self.send_log(
                                format!("Connection to {} failed: {}", address, e),
                                MessageSeverity::Error,
                            );
                        }
                    }
                    for waiter in waiters {
                        let _ = waiter.send(outcome.clone());
                    }
                    None
                }
                // A newer attempt owns the address; its link is the live one.
                Some(slot) if !matches!(
                    slot.state,
                    ConnectionState::Disconnected | ConnectionState::Failed
                ) =>
                {
                    Some(false)
                }
                _ => Some(outcome.is_ok()),
            }
        };

        if let Some(teardown) = superseded {
            debug!(%address, attempt, "Ignoring completion of superseded attempt");
            if teardown {
                // The link came up after it was no longer wanted.
                self.teardown(&address).await;
            }
            return;
        }

        if outcome.is_ok() {
            self.discover_services(address, attempt).await;
        }
    }

    async fn discover_services(&self, address: MacAddress, attempt: u64) {
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&address) else {
                return;
            };
            if slot.attempt != attempt || slot.state != ConnectionState::Connected {
                return;
            }
            self.transition(&address, slot, ConnectionState::DiscoveringServices);
        }

        let result = timeout(
            self.timeouts.service_discovery,
            self.adapter.discover_services(&address),
        )
        .await;

        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&address) else {
            return;
        };
        if slot.attempt != attempt || slot.state != ConnectionState::DiscoveringServices {
            return;
        }
        match result {
            Ok(Ok(services)) => {
                info!(%address, count = services.len(), "Services discovered");
                self.registry.merge_services(&address, services);
                self.transition(&address, slot, ConnectionState::Connected);
            }
            Ok(Err(e)) => {
                error!(%address, "Service discovery failed: {}", e);
                self.transition(&address, slot, ConnectionState::Failed);
                self.send_log(
                    format!("Service discovery on {} failed: {}", address, e),
                    MessageSeverity::Error,
                );
            }
            Err(_) => {
                error!(%address, "Service discovery timed out");
                self.transition(&address, slot, ConnectionState::Failed);
                self.send_log(
                    format!("Service discovery on {} timed out", address),
                    MessageSeverity::Error,
                );
            }
        }
    }

    /// Best-effort hardware disconnect bounded by the disconnect timeout.
    async fn teardown(&self, address: &MacAddress) {
        match timeout(self.timeouts.disconnect, self.adapter.disconnect(address)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%address, "Hardware disconnect failed: {}", e),
            Err(_) => warn!(
                %address,
                "No disconnect confirmation after {:?}", self.timeouts.disconnect
            ),
        }
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
    use crate::domain::models::{Advertisement, DeviceSource};
    use crate::domain::vendor::VendorResolver;
    use crate::error::AdapterError;
    use crate::infrastructure::bluetooth::protocol::uuid_from_u16;
    use crate::infrastructure::bluetooth::simulated::{SimulatedAdapter, SimulatedDevice};

    struct Fixture {
        sim: SimulatedAdapter,
        registry: Arc<Registry>,
        controller: Arc<ConnectionController>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
    }

    fn fixture() -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let sim = SimulatedAdapter::single();
        let registry = Arc::new(Registry::new(Arc::new(VendorResolver::empty()), tx.clone()));
        let controller = Arc::new(ConnectionController::new(
            Arc::new(sim.clone()),
            Arc::clone(&registry),
            tx,
            ConnectionTimeouts {
                connect: Duration::from_secs(2),
                service_discovery: Duration::from_secs(2),
                disconnect: Duration::from_millis(500),
            },
        ));
        Fixture {
            sim,
            registry,
            controller,
            events,
        }
    }

    fn known(f: &Fixture, device: SimulatedDevice) -> MacAddress {
        let address = device.address;
        f.sim.add_device(device);
        f.registry
            .upsert_from_advertisement(&Advertisement::new(address), DeviceSource::ActiveScan);
        address
    }

    fn addr(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    fn states(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<ConnectionState> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ConnectionStateChanged { state, .. } = event {
                out.push(state);
            }
        }
        out
    }

    #[tokio::test]
    async fn unknown_device_creates_no_slot() {
        let f = fixture();
        let a = addr("AA:BB:CC:00:00:01");
        assert_eq!(
            f.controller.connect(a).await,
            Err(EngineError::UnknownDevice(a))
        );
        assert_eq!(f.controller.state(&a), None);
        assert_eq!(f.sim.connect_calls(&a), 0);
    }

    #[tokio::test]
    async fn connect_runs_service_discovery() {
        let mut f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:01"))
                .with_services([uuid_from_u16(0x180F)]),
        );

        f.controller.connect(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.controller.state(&a), Some(ConnectionState::Connected));
        let record = f.registry.get(&a).unwrap();
        assert!(record.advertised_services.contains(&uuid_from_u16(0x180F)));
        assert_eq!(record.source, DeviceSource::ActiveScan);
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert_eq!(
            states(&mut f.events),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::DiscoveringServices,
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn successful_connect_is_reported_as_success() {
        let mut f = fixture();
        let a = known(&f, SimulatedDevice::new(addr("AA:BB:CC:00:00:0B")));

        f.controller.connect(a).await.unwrap();
        let mut successes = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let EngineEvent::LogMessage(message) = event {
                if message.severity == MessageSeverity::Success {
                    successes.push(message.message);
                }
            }
        }
        assert_eq!(successes, vec![format!("Connected to {}", a)]);
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_hardware_request() {
        let f = fixture();
        let a = known(&f, SimulatedDevice::new(addr("AA:BB:CC:00:00:02")));

        let (first, second) = tokio::join!(f.controller.connect(a), f.controller.connect(a));
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(f.sim.connect_calls(&a), 1);
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected() {
        let f = fixture();
        let a = known(&f, SimulatedDevice::new(addr("AA:BB:CC:00:00:03")));
        f.controller.connect(a).await.unwrap();
        assert_eq!(
            f.controller.connect(a).await,
            Err(EngineError::AlreadyConnected)
        );
    }

    #[tokio::test]
    async fn hardware_failure_lands_in_failed_until_reset() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:04"))
                .failing_connect(AdapterError::Hardware("page timeout".into())),
        );

        let err = f.controller.connect(a).await.unwrap_err();
        assert!(matches!(err, EngineError::HardwareError(_)));
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Failed));

        f.controller.reset(a).unwrap();
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Disconnected));
        assert_eq!(
            f.registry.get(&a).unwrap().connection_state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_fails() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:05"))
                .with_connect_delay(Duration::from_secs(60)),
        );
        let err = f.controller.connect(a).await.unwrap_err();
        assert!(matches!(err, EngineError::HardwareError(_)));
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Failed));
    }

    #[tokio::test]
    async fn discovery_failure_moves_to_failed() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:06"))
                .failing_discovery(AdapterError::Hardware("att error".into())),
        );
        f.controller.connect(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Failed));

        // Disconnect from Failed still tears the link down.
        f.controller.disconnect(a).await.unwrap();
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Disconnected));
        assert_eq!(f.sim.disconnect_calls(&a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_cancels_and_ignores_late_completion() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:07"))
                .with_connect_delay(Duration::from_secs(1)),
        );

        let controller = Arc::clone(&f.controller);
        let pending = tokio::spawn(async move { controller.connect(a).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Connecting));

        f.controller.disconnect(a).await.unwrap();
        assert_eq!(
            pending.await.unwrap(),
            Err(EngineError::ConnectionCancelled(a))
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_leaves_newer_link_alone() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:0A"))
                .with_connect_delay(Duration::from_secs(1)),
        );

        let controller = Arc::clone(&f.controller);
        let first = tokio::spawn(async move { controller.connect(a).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.controller.disconnect(a).await.unwrap();
        assert_eq!(first.await.unwrap(), Err(EngineError::ConnectionCancelled(a)));

        f.sim.add_device(
            SimulatedDevice::new(a).with_connect_delay(Duration::from_millis(10)),
        );
        f.controller.connect(a).await.unwrap();
        let before = f.sim.disconnect_calls(&a);

        // The first hardware connect finishes here.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.sim.disconnect_calls(&a), before);
        assert_eq!(f.controller.state(&a), Some(ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_during_connect_drops_slot() {
        let f = fixture();
        let a = known(
            &f,
            SimulatedDevice::new(addr("AA:BB:CC:00:00:08"))
                .with_connect_delay(Duration::from_secs(1)),
        );

        let controller = Arc::clone(&f.controller);
        let pending = tokio::spawn(async move { controller.connect(a).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        f.controller.forget(a).await;
        f.registry.remove(&a);
        assert_eq!(
            pending.await.unwrap(),
            Err(EngineError::ConnectionCancelled(a))
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.controller.state(&a), None);
        assert!(f.registry.get(&a).is_none());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_checks_address() {
        let f = fixture();
        let a = known(&f, SimulatedDevice::new(addr("AA:BB:CC:00:00:09")));
        f.controller.disconnect(a).await.unwrap();
        assert_eq!(f.sim.disconnect_calls(&a), 0);

        let stranger = addr("00:00:00:00:00:01");
        assert_eq!(
            f.controller.disconnect(stranger).await,
            Err(EngineError::UnknownDevice(stranger))
        );
    }
}
