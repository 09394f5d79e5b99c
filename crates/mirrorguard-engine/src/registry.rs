/*
[INPUT]:  Monitor lifecycle events and fresh exchange position lists
[OUTPUT]: The authoritative in-memory monitor set, flushed to the store
[POS]:    Registry - repository object injected into engine and merger
[UPDATE]: When lifecycle rules or the orphan sweep change
*/

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use mirrorguard_exchange::Position;

use crate::monitor::{AccountRole, Approach, Monitor, MonitorKey, Phase, PositionSnapshot, Tranche};
use crate::store::{PersistedStore, StorageError, StoreDocument, TaskNote};

/// Repository of live monitors. One instance per process, injected into
/// every caller; all mutation goes through here so the store stays the
/// single source of truth across restarts.
pub struct MonitorRegistry {
    monitors: BTreeMap<String, Monitor>,
    tasks: BTreeMap<String, TaskNote>,
    /// Duplicate records displaced by key migration, awaiting the merger.
    pending_merges: Vec<Monitor>,
    store: PersistedStore,
}

impl MonitorRegistry {
    /// Load the registry from disk. Corrupt stores recover per the store's
    /// fallback chain, so startup never fails on bad content.
    pub fn load(store: PersistedStore) -> Result<Self, StorageError> {
        let (document, pending_merges) = store.load()?;
        tracing::info!(
            path = %store.path().display(),
            monitors = document.monitors.len(),
            duplicates = pending_merges.len(),
            "monitor registry loaded"
        );
        for monitor in document.monitors.values() {
            tracing::info!(
                key = %monitor.key,
                phase = ?monitor.phase,
                remaining = %monitor.remaining_size,
                "restored monitor"
            );
        }
        Ok(Self {
            monitors: document.monitors,
            tasks: document.tasks,
            pending_merges,
            store,
        })
    }

    pub fn get(&self, key: &MonitorKey) -> Option<&Monitor> {
        self.monitors.get(&key.storage_key())
    }

    pub fn get_mut(&mut self, key: &MonitorKey) -> Option<&mut Monitor> {
        self.monitors.get_mut(&key.storage_key())
    }

    /// Fetch the monitor for a key, creating it from the position snapshot
    /// when absent. Idempotent: an existing record is returned unchanged
    /// apart from filling fields it never had.
    pub fn get_or_create(
        &mut self,
        key: MonitorKey,
        snapshot: &PositionSnapshot,
        approach: Approach,
        tranche_plan: Vec<Tranche>,
        sl_trigger: Decimal,
    ) -> &mut Monitor {
        let storage_key = key.storage_key();
        self.monitors
            .entry(storage_key)
            .and_modify(|existing| existing.fill_missing(snapshot))
            .or_insert_with(|| {
                tracing::info!(key = %key, size = %snapshot.size, "monitor created");
                Monitor::new(key, snapshot, approach, tranche_plan, sl_trigger)
            })
    }

    /// Replace a record wholesale, e.g. with a merge result.
    pub fn put(&mut self, monitor: Monitor) {
        self.monitors.insert(monitor.key.storage_key(), monitor);
    }

    /// Take the duplicate records queued for consolidation.
    pub fn take_pending_merges(&mut self) -> Vec<Monitor> {
        std::mem::take(&mut self.pending_merges)
    }

    /// Re-queue a duplicate whose merge could not be completed this pass.
    pub fn defer_merge(&mut self, monitor: Monitor) {
        self.pending_merges.push(monitor);
    }

    // Deletion is only reachable through the orphan sweep and the retire
    // pass, which confirm the monitor has nothing left to protect.
    fn remove(&mut self, key: &MonitorKey) -> Option<Monitor> {
        let storage_key = key.storage_key();
        self.tasks.remove(&storage_key);
        self.monitors.remove(&storage_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Monitor> {
        self.monitors.values()
    }

    pub fn keys_for_role(&self, role: AccountRole) -> Vec<MonitorKey> {
        self.monitors
            .values()
            .filter(|monitor| monitor.key.role == role)
            .map(|monitor| monitor.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn task_note_mut(&mut self, key: &MonitorKey) -> &mut TaskNote {
        self.tasks.entry(key.storage_key()).or_default()
    }

    /// Drop monitors of one role with no matching open position. Only ever
    /// called with a fresh, successful position query; a failed query must
    /// skip the sweep rather than treat every monitor as orphaned.
    pub fn sweep_orphans(&mut self, role: AccountRole, positions: &[Position]) -> Vec<MonitorKey> {
        let mut removed = Vec::new();
        let orphaned: Vec<MonitorKey> = self
            .monitors
            .values()
            .filter(|monitor| monitor.key.role == role)
            .filter(|monitor| {
                !positions.iter().any(|position| {
                    position.symbol == monitor.key.symbol
                        && position.side == monitor.key.side
                        && position.size > Decimal::ZERO
                })
            })
            .map(|monitor| monitor.key.clone())
            .collect();

        for key in orphaned {
            tracing::info!(key = %key, "orphan sweep removing monitor");
            self.remove(&key);
            removed.push(key);
        }
        removed
    }

    /// Close and drop every monitor whose remaining size hit zero.
    pub fn retire_closed(&mut self) -> Vec<MonitorKey> {
        let done: Vec<MonitorKey> = self
            .monitors
            .values()
            .filter(|monitor| {
                monitor.phase == Phase::Closed
                    || (monitor.remaining_size.is_zero() && monitor.limit_entries.is_empty())
            })
            .map(|monitor| monitor.key.clone())
            .collect();

        let mut removed = Vec::new();
        for key in done {
            if let Some(monitor) = self.get_mut(&key) {
                if monitor.phase != Phase::Closed && monitor.close().is_err() {
                    continue;
                }
            }
            tracing::info!(key = %key, "monitor closed and retired");
            self.remove(&key);
            removed.push(key);
        }
        removed
    }

    /// Persist the current state to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        let document = StoreDocument {
            monitors: self.monitors.clone(),
            tasks: self.tasks.clone(),
        };
        self.store.save(&document)
    }
}
