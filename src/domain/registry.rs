//! Device registry
//!
//! Authoritative, in-memory collection of every device seen, keyed by
//! address. All mutations go through one mutex and are applied to
//! completion before the lock is released; readers only ever get cloned
//! records or the published snapshot.

use crate::domain::address::MacAddress;
use crate::domain::models::{
    Advertisement, ConnectionState, DeviceRecord, DeviceSource, EngineEvent, NameObservation,
};
use crate::domain::vendor::VendorResolver;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

pub type DeviceSnapshot = Arc<Vec<DeviceRecord>>;

/// Durable-relevant changes, consumed by the persistence writer.
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Upserted(DeviceRecord),
    Removed(MacAddress),
}

pub struct Registry {
    devices: Mutex<HashMap<MacAddress, DeviceRecord>>,
    vendors: Arc<VendorResolver>,
    snapshot: watch::Sender<DeviceSnapshot>,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
    changes: Mutex<Option<mpsc::UnboundedSender<RegistryChange>>>,
}

impl Registry {
    pub fn new(
        vendors: Arc<VendorResolver>,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            devices: Mutex::new(HashMap::new()),
            vendors,
            snapshot,
            event_sender,
            changes: Mutex::new(None),
        }
    }

    /// Route durable changes to `sender` from now on.
    pub fn attach_change_sink(&self, sender: mpsc::UnboundedSender<RegistryChange>) {
        if let Ok(mut changes) = self.changes.lock() {
            *changes = Some(sender);
        }
    }

    /// Merge one observation into the record for its address, creating the
    /// record if needed.
    pub fn upsert_from_advertisement(
        &self,
        advertisement: &Advertisement,
        source: DeviceSource,
    ) -> DeviceRecord {
        let mut devices = self.lock();
        let is_new = !devices.contains_key(&advertisement.address);
        let record = devices
            .entry(advertisement.address)
            .or_insert_with(|| {
                DeviceRecord::new(advertisement.address, source, advertisement.seen_at)
            });

        apply_observation(record, advertisement, Some(source));
        self.refresh_vendor(record);
        let updated = record.clone();

        if is_new {
            debug!(address = %updated.address, ?source, "New device");
        } else {
            trace!(address = %updated.address, rssi = ?updated.rssi, "Device updated");
        }

        self.publish(&devices);
        self.announce(&updated);
        updated
    }

    /// Merge services found over a connection. Uses the advertisement merge
    /// path but leaves the provenance untouched.
    pub fn merge_services(
        &self,
        address: &MacAddress,
        services: impl IntoIterator<Item = Uuid>,
    ) -> Option<DeviceRecord> {
        let observation = Advertisement::at(*address, Utc::now()).with_services(services);
        let mut devices = self.lock();
        let record = devices.get_mut(address)?;
        apply_observation(record, &observation, None);
        let updated = record.clone();

        self.publish(&devices);
        self.announce(&updated);
        Some(updated)
    }

    /// Only the connection controller moves connection state.
    pub(crate) fn set_connection_state(
        &self,
        address: &MacAddress,
        state: ConnectionState,
    ) -> Option<DeviceRecord> {
        let mut devices = self.lock();
        let record = devices.get_mut(address)?;
        record.connection_state = state;
        let updated = record.clone();
        self.publish(&devices);
        Some(updated)
    }

    pub(crate) fn mark_persisted(&self, addresses: &[MacAddress]) {
        let mut devices = self.lock();
        let mut changed = false;
        for address in addresses {
            if let Some(record) = devices.get_mut(address) {
                if !record.persisted {
                    record.persisted = true;
                    changed = true;
                }
            }
        }
        if changed {
            self.publish(&devices);
        }
    }

    /// Pre-populate from history. Addresses already present are left alone.
    pub fn restore(&self, records: impl IntoIterator<Item = DeviceRecord>) -> usize {
        let mut devices = self.lock();
        let mut restored = 0;
        for mut record in records {
            if devices.contains_key(&record.address) {
                continue;
            }
            record.persisted = true;
            record.connection_state = ConnectionState::Disconnected;
            self.refresh_vendor(&mut record);
            devices.insert(record.address, record);
            restored += 1;
        }
        self.publish(&devices);
        restored
    }

    /// Recompute cached vendor names after the resolver's table changed.
    pub fn refresh_vendors(&self) -> usize {
        let mut devices = self.lock();
        let mut updated = Vec::new();
        for record in devices.values_mut() {
            let before = record.vendor.clone();
            self.refresh_vendor(record);
            if record.vendor != before {
                updated.push(record.clone());
            }
        }
        if !updated.is_empty() {
            self.publish(&devices);
            for record in &updated {
                self.announce(record);
            }
        }
        updated.len()
    }

    pub fn get(&self, address: &MacAddress) -> Option<DeviceRecord> {
        self.lock().get(address).cloned()
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.lock().contains_key(address)
    }

    /// All records, most recently seen first.
    pub fn list(&self) -> Vec<DeviceRecord> {
        sorted(&self.lock())
    }

    /// Explicit forget.
    pub fn remove(&self, address: &MacAddress) -> Option<DeviceRecord> {
        let mut devices = self.lock();
        let removed = devices.remove(address)?;
        self.publish(&devices);
        let _ = self.event_sender.send(EngineEvent::DeviceRemoved(*address));
        self.send_change(RegistryChange::Removed(*address));
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MacAddress, DeviceRecord>> {
        // Merges never leave a record half-applied.
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refresh_vendor(&self, record: &mut DeviceRecord) {
        let generation = self.vendors.generation();
        if record.vendor_generation == generation {
            return;
        }
        match self.vendors.resolve(&record.address) {
            Some(vendor) => record.vendor = Some(vendor),
            // Never resolved yet: keep the vendor restored from history.
            None if record.vendor_generation == 0 => {}
            None => record.vendor = None,
        }
        record.vendor_generation = generation;
    }

    fn publish(&self, devices: &HashMap<MacAddress, DeviceRecord>) {
        let list = sorted(devices);
        self.snapshot.send_modify(|snap| *snap = Arc::new(list));
    }

    fn announce(&self, record: &DeviceRecord) {
        let _ = self
            .event_sender
            .send(EngineEvent::DeviceUpdated(record.clone()));
        self.send_change(RegistryChange::Upserted(record.clone()));
    }

    fn send_change(&self, change: RegistryChange) {
        if let Ok(changes) = self.changes.lock() {
            if let Some(sender) = changes.as_ref() {
                let _ = sender.send(change);
            }
        }
    }
}

fn sorted(devices: &HashMap<MacAddress, DeviceRecord>) -> Vec<DeviceRecord> {
    let mut list: Vec<DeviceRecord> = devices.values().cloned().collect();
    list.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.address.cmp(&b.address))
    });
    list
}

/// Merge policy: newest non-empty scalar wins, sets union, provenance only
/// escalates.
fn apply_observation(
    record: &mut DeviceRecord,
    observation: &Advertisement,
    source: Option<DeviceSource>,
) {
    match &observation.name {
        NameObservation::Present(name) => record.display_name = Some(name.clone()),
        NameObservation::Cleared => record.display_name = None,
        NameObservation::Absent => {}
    }
    if let Some(rssi) = observation.rssi {
        record.rssi = Some(rssi);
    }
    if let Some(tx_power) = observation.tx_power {
        record.tx_power = Some(tx_power);
    }
    record
        .advertised_services
        .extend(observation.services.iter().copied());
    for (company, data) in &observation.manufacturer_data {
        record.manufacturer_data.insert(*company, data.clone());
    }
    if let Some(source) = source {
        record.source = record.source.escalate(source);
    }
    record.last_seen = observation.seen_at.max(record.first_seen);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use std::collections::BTreeSet;

    fn addr(s: &str) -> MacAddress {
        MacAddress::parse(s).unwrap()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn registry() -> (Registry, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let vendors = Arc::new(VendorResolver::from_entries([("AA:BB:CC", "Acme Sensors")]));
        (Registry::new(vendors, tx), rx)
    }

    fn service(n: u16) -> Uuid {
        Uuid::from_u128(((n as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
    }

    #[test]
    fn first_and_second_merge_scenario() {
        let (registry, _rx) = registry();
        let a = addr("AA:BB:CC:00:00:01");

        registry.upsert_from_advertisement(
            &Advertisement::at(a, t(0)).with_name("Sensor1").with_rssi(-60),
            DeviceSource::ActiveScan,
        );
        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].address, a);
        assert_eq!(list[0].display_name.as_deref(), Some("Sensor1"));
        assert_eq!(list[0].rssi, Some(-60));
        assert_eq!(list[0].first_seen, list[0].last_seen);
        assert_eq!(list[0].vendor.as_deref(), Some("Acme Sensors"));

        let second = registry.upsert_from_advertisement(
            &Advertisement::at(a, t(5)).with_rssi(-55),
            DeviceSource::ActiveScan,
        );
        assert_eq!(second.rssi, Some(-55));
        assert_eq!(second.first_seen, t(0));
        assert_eq!(second.last_seen, t(5));
        assert_eq!(second.source, DeviceSource::ActiveScan);
        assert_eq!(second.display_name.as_deref(), Some("Sensor1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn services_accumulate_and_last_seen_tracks_latest_merge() {
        let (registry, _rx) = registry();
        let a = addr("11:22:33:44:55:66");
        let batches = [vec![1u16, 2], vec![2, 3], vec![], vec![4]];
        let mut expected = BTreeSet::new();
        let mut last = None;
        for (i, batch) in batches.iter().enumerate() {
            let services: Vec<Uuid> = batch.iter().map(|n| service(*n)).collect();
            expected.extend(services.iter().copied());
            last = Some(registry.upsert_from_advertisement(
                &Advertisement::at(a, t(i as i64 * 10)).with_services(services),
                DeviceSource::ActiveScan,
            ));
        }
        let last = last.unwrap();
        assert_eq!(last.advertised_services, expected);
        assert_eq!(last.last_seen, t(30));
    }

    #[test]
    fn empty_name_never_overwrites_but_clear_does() {
        let (registry, _rx) = registry();
        let a = addr("11:22:33:44:55:66");
        registry.upsert_from_advertisement(
            &Advertisement::at(a, t(0)).with_name("Thermo"),
            DeviceSource::ActiveScan,
        );
        let r = registry.upsert_from_advertisement(
            &Advertisement::at(a, t(1)).with_name(""),
            DeviceSource::ActiveScan,
        );
        assert_eq!(r.display_name.as_deref(), Some("Thermo"));

        let r = registry.upsert_from_advertisement(
            &Advertisement::at(a, t(2)).with_cleared_name(),
            DeviceSource::ActiveScan,
        );
        assert_eq!(r.display_name, None);
    }

    #[test]
    fn source_never_demotes_from_both() {
        let (registry, _rx) = registry();
        let a = addr("11:22:33:44:55:66");
        let sources = [
            DeviceSource::PassiveSniff,
            DeviceSource::ActiveScan,
            DeviceSource::PassiveSniff,
            DeviceSource::ActiveScan,
        ];
        let mut reached_both = false;
        for (i, source) in sources.iter().enumerate() {
            let r = registry.upsert_from_advertisement(&Advertisement::at(a, t(i as i64)), *source);
            if reached_both {
                assert_eq!(r.source, DeviceSource::Both);
            }
            reached_both |= r.source == DeviceSource::Both;
        }
        assert!(reached_both);
    }

    #[test]
    fn merging_same_advertisement_twice_is_idempotent() {
        let (registry, _rx) = registry();
        let a = addr("AA:BB:CC:00:00:02");
        let adv = Advertisement::at(a, t(3))
            .with_name("Tag")
            .with_rssi(-70)
            .with_service(service(0x180F))
            .with_manufacturer_data(0x004C, vec![1, 2, 3]);
        let once = registry.upsert_from_advertisement(&adv, DeviceSource::ActiveScan);
        let twice = registry.upsert_from_advertisement(&adv, DeviceSource::ActiveScan);
        assert_eq!(once, twice);
    }

    #[test]
    fn list_orders_by_last_seen_descending() {
        let (registry, _rx) = registry();
        let old = addr("00:00:00:00:00:01");
        let new = addr("00:00:00:00:00:02");
        registry.upsert_from_advertisement(&Advertisement::at(old, t(0)), DeviceSource::ActiveScan);
        registry.upsert_from_advertisement(&Advertisement::at(new, t(9)), DeviceSource::ActiveScan);
        let order: Vec<_> = registry.list().into_iter().map(|r| r.address).collect();
        assert_eq!(order, vec![new, old]);
    }

    #[test]
    fn last_seen_never_precedes_first_seen() {
        let (registry, _rx) = registry();
        let a = addr("00:00:00:00:00:03");
        registry.upsert_from_advertisement(&Advertisement::at(a, t(10)), DeviceSource::ActiveScan);
        let r = registry.upsert_from_advertisement(
            &Advertisement::at(a, t(10) - Duration::seconds(5)),
            DeviceSource::ActiveScan,
        );
        assert!(r.last_seen >= r.first_seen);
    }

    #[test]
    fn merge_services_keeps_source_and_requires_existing_record() {
        let (registry, _rx) = registry();
        let a = addr("00:00:00:00:00:04");
        assert!(registry.merge_services(&a, [service(0x1800)]).is_none());
        assert!(registry.is_empty());

        registry.upsert_from_advertisement(&Advertisement::at(a, t(0)), DeviceSource::PassiveSniff);
        let r = registry.merge_services(&a, [service(0x1800)]).unwrap();
        assert_eq!(r.source, DeviceSource::PassiveSniff);
        assert!(r.advertised_services.contains(&service(0x1800)));
    }

    #[test]
    fn changes_are_forwarded_to_sink() {
        let (registry, _rx) = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_change_sink(tx);
        let a = addr("00:00:00:00:00:05");
        registry.upsert_from_advertisement(&Advertisement::at(a, t(0)), DeviceSource::ActiveScan);
        registry.set_connection_state(&a, ConnectionState::Connecting);
        registry.remove(&a);

        assert!(matches!(rx.try_recv(), Ok(RegistryChange::Upserted(r)) if r.address == a));
        assert!(matches!(rx.try_recv(), Ok(RegistryChange::Removed(x)) if x == a));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn restore_marks_records_persisted_and_skips_known() {
        let (registry, _rx) = registry();
        let a = addr("AA:BB:CC:00:00:07");
        registry.upsert_from_advertisement(&Advertisement::at(a, t(0)), DeviceSource::ActiveScan);

        let mut known = DeviceRecord::new(a, DeviceSource::ActiveScan, t(-100));
        known.display_name = Some("stale".into());
        let other = DeviceRecord::new(addr("00:00:00:00:00:08"), DeviceSource::ActiveScan, t(-50));

        assert_eq!(registry.restore([known, other]), 1);
        assert_eq!(registry.get(&a).unwrap().display_name, None);
        assert!(registry.get(&addr("00:00:00:00:00:08")).unwrap().persisted);
    }

    #[test]
    fn snapshot_subscribers_see_updates() {
        let (registry, _rx) = registry();
        let mut sub = registry.subscribe();
        registry.upsert_from_advertisement(
            &Advertisement::at(addr("00:00:00:00:00:09"), t(0)),
            DeviceSource::ActiveScan,
        );
        assert!(sub.has_changed().unwrap());
        assert_eq!(sub.borrow_and_update().len(), 1);
    }
}
