use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::types::{AvatarRef, ConnectionId, InstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub connection: ConnectionId,
    pub instance_id: InstanceId,
    pub old_avatar: AvatarRef,
    pub invited_at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Committed,
    Expired,
    Disconnected,
    HandoffFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainedBatch {
    pub instance_id: InstanceId,
    pub committed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub entry: LedgerEntry,
    pub reason: RemovalReason,
    pub drained: Option<DrainedBatch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("connection {connection} is already pending for instance {existing}")]
    AlreadyPending {
        connection: ConnectionId,
        existing: InstanceId,
    },
}

#[derive(Debug, Default)]
struct BatchRecord {
    remaining: BTreeSet<ConnectionId>,
    committed: usize,
}

/// Process-wide table of in-flight hand-offs, keyed by connection. Also
/// tracks which connections of each batch are still outstanding.
#[derive(Debug)]
pub struct PendingTransferLedger {
    timeout: Duration,
    entries: HashMap<ConnectionId, LedgerEntry>,
    batches: BTreeMap<InstanceId, BatchRecord>,
}

impl PendingTransferLedger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
            batches: BTreeMap::new(),
        }
    }

    pub fn add(
        &mut self,
        connection: ConnectionId,
        instance_id: InstanceId,
        old_avatar: AvatarRef,
        now: Duration,
    ) -> Result<(), LedgerError> {
        if let Some(existing) = self.entries.get(&connection) {
            return Err(LedgerError::AlreadyPending {
                connection,
                existing: existing.instance_id,
            });
        }
        self.entries.insert(
            connection,
            LedgerEntry {
                connection,
                instance_id,
                old_avatar,
                invited_at: now,
            },
        );
        self.batches
            .entry(instance_id)
            .or_default()
            .remaining
            .insert(connection);
        Ok(())
    }

    pub fn resolve(&self, connection: ConnectionId) -> Option<&LedgerEntry> {
        self.entries.get(&connection)
    }

    pub fn remove(&mut self, connection: ConnectionId, reason: RemovalReason) -> Option<Removal> {
        let entry = self.entries.remove(&connection)?;
        let drained = self.settle_batch(&entry, reason);
        Some(Removal {
            entry,
            reason,
            drained,
        })
    }

    /// Drops every entry invited more than `timeout` before `now`. Expired
    /// connections keep whatever avatar they had.
    pub fn expire_stale(&mut self, now: Duration) -> Vec<Removal> {
        let mut stale = self
            .entries
            .values()
            .filter(|entry| now.saturating_sub(entry.invited_at) > self.timeout)
            .map(|entry| entry.connection)
            .collect::<Vec<_>>();
        stale.sort();

        let mut removals = Vec::with_capacity(stale.len());
        for connection in stale {
            if let Some(removal) = self.remove(connection, RemovalReason::Expired) {
                warn!(
                    connection = %connection,
                    instance_id = %removal.entry.instance_id,
                    waited_ms = now.saturating_sub(removal.entry.invited_at).as_millis() as u64,
                    "ledger_entry_expired"
                );
                removals.push(removal);
            }
        }
        removals
    }

    pub fn pending_for_instance(&self, instance_id: InstanceId) -> usize {
        self.batches
            .get(&instance_id)
            .map_or(0, |batch| batch.remaining.len())
    }

    pub fn is_pending(&self, connection: ConnectionId) -> bool {
        self.entries.contains_key(&connection)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn settle_batch(&mut self, entry: &LedgerEntry, reason: RemovalReason) -> Option<DrainedBatch> {
        let batch = self.batches.get_mut(&entry.instance_id)?;
        batch.remaining.remove(&entry.connection);
        if reason == RemovalReason::Committed {
            batch.committed = batch.committed.saturating_add(1);
        }
        if !batch.remaining.is_empty() {
            return None;
        }
        let committed = batch.committed;
        self.batches.remove(&entry.instance_id);
        Some(DrainedBatch {
            instance_id: entry.instance_id,
            committed,
        })
    }
}
