//! Passive sniffing bridge
//!
//! Forwards observations from an optional sniffing radio into the registry
//! tagged `PassiveSniff`. A missing or failing sniffer is reported once and
//! otherwise ignored.

use crate::domain::models::{Advertisement, DeviceSource, EngineEvent};
use crate::domain::registry::Registry;
use crate::error::AdapterError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

pub type SniffStream = BoxStream<'static, Advertisement>;

/// A passive capture device.
#[async_trait]
pub trait SniffSource: Send + Sync {
    fn name(&self) -> &str;

    /// Start capturing. The stream ends when the device stops delivering.
    async fn open(&self) -> Result<SniffStream, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferStatus {
    /// No sniffer configured.
    Disabled,
    Running,
    Unavailable,
}

struct BridgeState {
    status: SnifferStatus,
    reported: bool,
}

struct BridgeShared {
    state: Mutex<BridgeState>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
}

impl BridgeShared {
    fn state(&self) -> MutexGuard<'_, BridgeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_unavailable(&self, reason: String) {
        let first = {
            let mut state = self.state();
            state.status = SnifferStatus::Unavailable;
            !std::mem::replace(&mut state.reported, true)
        };
        if first {
            warn!("Sniffer unavailable: {}", reason);
            let _ = self.event_sender.send(EngineEvent::SnifferUnavailable(reason));
        }
    }
}

pub struct SnifferBridge {
    shared: Arc<BridgeShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SnifferBridge {
    pub async fn start(
        source: Option<Arc<dyn SniffSource>>,
        registry: Arc<Registry>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let shared = Arc::new(BridgeShared {
            state: Mutex::new(BridgeState {
                status: SnifferStatus::Disabled,
                reported: false,
            }),
            event_sender,
        });
        let cancel = CancellationToken::new();
        let mut bridge = Self {
            shared,
            cancel,
            task: None,
        };

        let Some(source) = source else {
            return bridge;
        };

        match source.open().await {
            Ok(stream) => {
                info!("Sniffer {} running", source.name());
                bridge.shared.state().status = SnifferStatus::Running;
                bridge.task = Some(tokio::spawn(forward(
                    stream,
                    source.name().to_string(),
                    registry,
                    Arc::clone(&bridge.shared),
                    bridge.cancel.clone(),
                )));
            }
            Err(e) => bridge
                .shared
                .mark_unavailable(format!("{}: {}", source.name(), e)),
        }
        bridge
    }

    pub fn status(&self) -> SnifferStatus {
        self.shared.state().status
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let mut state = self.shared.state();
        if state.status == SnifferStatus::Running {
            state.status = SnifferStatus::Disabled;
        }
    }
}

async fn forward(
    mut stream: SniffStream,
    name: String,
    registry: Arc<Registry>,
    shared: Arc<BridgeShared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => match next {
                Some(advertisement) => {
                    trace!(address = %advertisement.address, "Sniffed advertisement");
                    registry.upsert_from_advertisement(&advertisement, DeviceSource::PassiveSniff);
                }
                None => break,
            },
        }
    }
    shared.mark_unavailable(format!("{} stopped delivering packets", name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::address::MacAddress;
    use crate::domain::vendor::VendorResolver;
    use futures_util::stream;
    use std::time::Duration;

    struct ListSource(Vec<Advertisement>);

    #[async_trait]
    impl SniffSource for ListSource {
        fn name(&self) -> &str {
            "list"
        }

        async fn open(&self) -> Result<SniffStream, AdapterError> {
            Ok(stream::iter(self.0.clone()).boxed())
        }
    }

    struct MissingSource;

    #[async_trait]
    impl SniffSource for MissingSource {
        fn name(&self) -> &str {
            "missing"
        }

        async fn open(&self) -> Result<SniffStream, AdapterError> {
            Err(AdapterError::NotFound("no capture device".into()))
        }
    }

    type Events = (
        mpsc::UnboundedSender<EngineEvent>,
        mpsc::UnboundedReceiver<EngineEvent>,
    );

    fn registry() -> (Arc<Registry>, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new(Arc::new(VendorResolver::empty()), tx.clone()));
        (registry, (tx, rx))
    }

    fn unavailable_count(events: &mut mpsc::UnboundedReceiver<EngineEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::SnifferUnavailable(_)) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn no_source_is_disabled() {
        let (registry, (tx, mut rx)) = registry();
        let bridge = SnifferBridge::start(None, registry, tx).await;
        assert_eq!(bridge.status(), SnifferStatus::Disabled);
        assert_eq!(unavailable_count(&mut rx), 0);
    }

    #[tokio::test]
    async fn failing_source_reports_once() {
        let (registry, (tx, mut rx)) = registry();
        let bridge = SnifferBridge::start(Some(Arc::new(MissingSource)), registry, tx).await;
        assert_eq!(bridge.status(), SnifferStatus::Unavailable);
        bridge.shared.mark_unavailable("again".into());
        assert_eq!(unavailable_count(&mut rx), 1);
    }

    #[tokio::test]
    async fn observations_are_tagged_passive() {
        let (registry, (tx, mut rx)) = registry();
        let a = MacAddress::parse("F0:99:19:AB:CD:EF").unwrap();
        let source = ListSource(vec![Advertisement::new(a).with_rssi(-80)]);
        let _bridge = SnifferBridge::start(Some(Arc::new(source)), Arc::clone(&registry), tx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let record = registry.get(&a).unwrap();
        assert_eq!(record.source, DeviceSource::PassiveSniff);
        assert_eq!(record.rssi, Some(-80));
        // The list ran dry, which counts as the sniffer going away.
        assert_eq!(unavailable_count(&mut rx), 1);
    }
}
