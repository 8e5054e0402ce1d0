//! Device history storage
//!
//! History lives in a JSON Lines file, one [`PersistenceRecord`] per line,
//! keyed by address. Every commit rewrites the whole file into a sibling
//! temp file, syncs it and renames it over the old file, so a crash leaves
//! either the old or the new file, never a mix.
//!
//! Loading keeps every line up to the first one that does not parse and
//! drops the rest.

use crate::domain::address::MacAddress;
use crate::domain::models::{DeviceRecord, DeviceSource, EngineEvent, MessageSeverity, StatusMessage};
use crate::domain::registry::{Registry, RegistryChange};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A burst of changes is written at the latest this many debounce periods
/// after its first change.
const MAX_BATCH_AGE_FACTOR: u32 = 5;

/// Durable projection of a [`DeviceRecord`]. RSSI and connection state are
/// transient and not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceRecord {
    pub address: MacAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub services: BTreeSet<Uuid>,
    #[serde(default)]
    pub source: DeviceSource,
}

impl From<&DeviceRecord> for PersistenceRecord {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            address: record.address,
            name: record.display_name.clone(),
            vendor: record.vendor.clone(),
            first_seen: Some(record.first_seen),
            last_seen: record.last_seen,
            services: record.advertised_services.clone(),
            source: record.source,
        }
    }
}

impl PersistenceRecord {
    pub fn into_device_record(self) -> DeviceRecord {
        let first_seen = self
            .first_seen
            .map_or(self.last_seen, |first| first.min(self.last_seen));
        let mut record = DeviceRecord::new(self.address, self.source, first_seen);
        record.display_name = self.name;
        record.vendor = self.vendor;
        record.last_seen = self.last_seen;
        record.advertised_services = self.services;
        record.persisted = true;
        record
    }
}

/// Outcome of [`PersistenceStore::load`].
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<PersistenceRecord>,
    /// Lines dropped from the first unreadable one onwards.
    pub discarded_lines: usize,
}

/// Sole owner of the history file.
#[derive(Debug)]
pub struct PersistenceStore {
    path: PathBuf,
    records: IndexMap<MacAddress, PersistenceRecord>,
}

impl PersistenceStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: IndexMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file into memory. A missing file is an empty history.
    pub fn load(&mut self) -> io::Result<LoadReport> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No device history at {:?}", self.path);
                self.records.clear();
                return Ok(LoadReport::default());
            }
            Err(e) => return Err(e),
        };

        let contents = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();

        let mut records = IndexMap::new();
        let mut discarded_lines = 0;
        for (index, line) in lines.iter().enumerate() {
            match serde_json::from_str::<PersistenceRecord>(line) {
                Ok(record) => {
                    records.insert(record.address, record);
                }
                Err(e) => {
                    discarded_lines = lines.len() - index;
                    warn!(
                        "Device history {:?} unreadable at line {}: {}; dropping {} line(s)",
                        self.path,
                        index + 1,
                        e,
                        discarded_lines
                    );
                    break;
                }
            }
        }

        self.records = records;
        info!(
            "Loaded {} device(s) from {:?}",
            self.records.len(),
            self.path
        );
        Ok(LoadReport {
            records: self.records.values().cloned().collect(),
            discarded_lines,
        })
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistenceRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a new address or replace the stored record for a known one.
    pub fn upsert(&mut self, record: PersistenceRecord) -> io::Result<()> {
        self.records.insert(record.address, record);
        self.commit()
    }

    pub fn upsert_many(
        &mut self,
        records: impl IntoIterator<Item = PersistenceRecord>,
    ) -> io::Result<()> {
        self.apply(records, std::iter::empty())
    }

    pub fn remove(&mut self, address: &MacAddress) -> io::Result<bool> {
        let removed = self.records.shift_remove(address).is_some();
        if removed {
            self.commit()?;
        }
        Ok(removed)
    }

    /// Apply a batch of replacements and removals with a single commit.
    pub fn apply(
        &mut self,
        upserts: impl IntoIterator<Item = PersistenceRecord>,
        removals: impl IntoIterator<Item = MacAddress>,
    ) -> io::Result<()> {
        for record in upserts {
            self.records.insert(record.address, record);
        }
        for address in removals {
            self.records.shift_remove(&address);
        }
        self.commit()
    }

    /// Rewrite the file atomically from the in-memory records.
    pub fn commit(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut buffer = Vec::new();
        for record in self.records.values() {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let tmp_path = self.temp_path();
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&buffer)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!("Committed {} device(s) to {:?}", self.records.len(), self.path);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

enum Pending {
    Upsert(PersistenceRecord),
    Remove,
}

enum WriterCommand {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background task that batches registry changes into commits.
pub struct PersistenceWriter {
    control: mpsc::UnboundedSender<WriterCommand>,
    task: Option<JoinHandle<()>>,
}

impl PersistenceWriter {
    /// Spawn the writer. Registry changes must be sent on the returned sender.
    pub fn spawn(
        store: PersistenceStore,
        registry: Weak<Registry>,
        debounce: Duration,
        event_sender: mpsc::UnboundedSender<EngineEvent>,
    ) -> (Self, mpsc::UnboundedSender<RegistryChange>) {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = WriterTask {
            store,
            registry,
            debounce,
            event_sender,
            pending: IndexMap::new(),
        };
        let handle = tokio::spawn(task.run(change_rx, control_rx));
        (
            Self {
                control: control_tx,
                task: Some(handle),
            },
            change_tx,
        )
    }

    /// Commit everything queued so far and wait for the write.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Final commit, then stop the task.
    pub async fn shutdown(&mut self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(WriterCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct WriterTask {
    store: PersistenceStore,
    registry: Weak<Registry>,
    debounce: Duration,
    event_sender: mpsc::UnboundedSender<EngineEvent>,
    pending: IndexMap<MacAddress, Pending>,
}

impl WriterTask {
    async fn run(
        mut self,
        mut changes: mpsc::UnboundedReceiver<RegistryChange>,
        mut control: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        let mut changes_open = true;
        let mut quiet_deadline: Option<Instant> = None;
        let mut batch_started: Option<Instant> = None;
        let max_age = self.debounce * MAX_BATCH_AGE_FACTOR;

        loop {
            let flush_at = match (quiet_deadline, batch_started) {
                (Some(quiet), Some(started)) => Some(quiet.min(started + max_age)),
                _ => None,
            };
            let wake = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                change = changes.recv(), if changes_open => match change {
                    Some(change) => {
                        self.queue(change);
                        let now = Instant::now();
                        quiet_deadline = Some(now + self.debounce);
                        batch_started.get_or_insert(now);
                    }
                    None => changes_open = false,
                },
                command = control.recv() => match command {
                    Some(WriterCommand::Flush(done)) => {
                        self.drain(&mut changes);
                        self.commit_pending();
                        (quiet_deadline, batch_started) = self.retry_deadline();
                        let _ = done.send(());
                    }
                    Some(WriterCommand::Shutdown(done)) => {
                        self.drain(&mut changes);
                        self.commit_pending();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.drain(&mut changes);
                        self.commit_pending();
                        break;
                    }
                },
                _ = sleep_until(wake), if flush_at.is_some() => {
                    self.commit_pending();
                    (quiet_deadline, batch_started) = self.retry_deadline();
                }
            }
        }
        debug!("Persistence writer stopped");
    }

    /// Deadlines after a commit: none when everything was written, another
    /// quiet period when a failed batch is still queued.
    fn retry_deadline(&self) -> (Option<Instant>, Option<Instant>) {
        if self.pending.is_empty() {
            (None, None)
        } else {
            let now = Instant::now();
            (Some(now + self.debounce), Some(now))
        }
    }

    fn drain(&mut self, changes: &mut mpsc::UnboundedReceiver<RegistryChange>) {
        while let Ok(change) = changes.try_recv() {
            self.queue(change);
        }
    }

    fn queue(&mut self, change: RegistryChange) {
        match change {
            RegistryChange::Upserted(record) => {
                self.pending
                    .insert(record.address, Pending::Upsert(PersistenceRecord::from(&record)));
            }
            RegistryChange::Removed(address) => {
                self.pending.insert(address, Pending::Remove);
            }
        }
    }

    fn commit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        for (address, pending) in &self.pending {
            match pending {
                Pending::Upsert(record) => upserts.push(record.clone()),
                Pending::Remove => removals.push(*address),
            }
        }
        let written: Vec<MacAddress> = upserts.iter().map(|r| r.address).collect();

        match self.store.apply(upserts, removals) {
            Ok(()) => {
                self.pending.clear();
                if let Some(registry) = self.registry.upgrade() {
                    registry.mark_persisted(&written);
                }
            }
            Err(e) => {
                // Pending entries stay queued for the next attempt.
                error!("Failed to write device history {:?}: {}", self.store.path(), e);
                let _ = self.event_sender.send(EngineEvent::LogMessage(StatusMessage {
                    message: format!("Could not save device history: {}", e),
                    severity: MessageSeverity::Error,
                }));
            }
        }
    }
}
