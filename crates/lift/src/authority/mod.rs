//! The authority side of a transfer: owns every piece of transfer state and
//! advances it from explicit event handlers and a fixed-step `tick`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::avatars::AvatarSpawner;
use crate::content::{AvatarTemplateId, WorldTemplateId};
use crate::dispatcher::{DispatchContext, GroupDispatcher, LoadContinuation};
use crate::handoff::{self, CommitReceipt, DestroyQueue, HandoffContext};
use crate::handshake::{validate_ready, Outbox, ReadyRejection, ServerMessage};
use crate::instances::{LoadCompletion, WorldInstances, WorldLoader};
use crate::ledger::{DrainedBatch, PendingTransferLedger, RemovalReason};
use crate::metrics::{TransferMetricsHandle, TransferMetricsSnapshot};
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionId, InstanceId, Vec3};
use crate::view::TransferView;
use crate::zone::{EnterOutcome, StagingZone, StagingZoneConfig, ZoneConfigError};


/// Outlasts the client's own load timeout so a slow client gives up first.
pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub zone: StagingZoneConfig,
    pub world_template: WorldTemplateId,
    pub avatar_template: AvatarTemplateId,
    pub spawn_point: Vec3,
    pub ledger_timeout: Duration,
    pub destroy_delay: Duration,
    pub instance_unload_grace: Duration,
}

impl TransferSettings {
    pub fn new(
        world_template: WorldTemplateId,
        avatar_template: AvatarTemplateId,
        spawn_point: Vec3,
    ) -> Self {
        Self {
            zone: StagingZoneConfig::default(),
            world_template,
            avatar_template,
            spawn_point,
            ledger_timeout: DEFAULT_LEDGER_TIMEOUT,
            destroy_delay: Duration::from_millis(500),
            instance_unload_grace: Duration::from_secs(5),
        }
    }
}

/// Collaborators the authority borrows for the duration of one call.
pub struct AuthorityPorts<'a> {
    pub registry: &'a mut dyn ConnectionRegistry,
    pub spawner: &'a mut dyn AvatarSpawner,
    pub loader: &'a mut dyn WorldLoader,
    pub view: &'a mut dyn TransferView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneEntry {
    Admitted,
    AlreadyMember,
    Full,
    Unauthenticated,
    /// Already part of a batch that has not resolved yet.
    InFlight,
    /// Already committed into a live instance.
    InSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Committed(CommitReceipt),
    Rejected(ReadyRejection),
    HandoffFailed,
}

#[derive(Debug)]
pub struct TransferAuthority {
    settings: TransferSettings,
    zone: StagingZone,
    dispatcher: GroupDispatcher,
    instances: WorldInstances,
    ledger: PendingTransferLedger,
    outbox: Outbox,
    destroy_queue: DestroyQueue,
    metrics: TransferMetricsHandle,
    counters: TransferMetricsSnapshot,
    now: Duration,
    disconnect_scratch: Vec<ConnectionId>,
    completion_scratch: Vec<LoadCompletion>,
}

impl TransferAuthority {
    pub fn new(settings: TransferSettings) -> Result<Self, ZoneConfigError> {
        let zone = StagingZone::new(settings.zone)?;
        Ok(Self {
            dispatcher: GroupDispatcher::new(settings.world_template),
            ledger: PendingTransferLedger::new(settings.ledger_timeout),
            zone,
            instances: WorldInstances::default(),
            outbox: Outbox::default(),
            destroy_queue: DestroyQueue::default(),
            metrics: TransferMetricsHandle::default(),
            counters: TransferMetricsSnapshot::default(),
            now: Duration::ZERO,
            disconnect_scratch: Vec::new(),
            completion_scratch: Vec::new(),
            settings,
        })
    }

    pub fn on_entity_enter(
        &mut self,
        connection: ConnectionId,
        registry: &dyn ConnectionRegistry,
        view: &mut dyn TransferView,
    ) -> ZoneEntry {
        if !registry.is_connected(connection) || !registry.is_authenticated(connection) {
            debug!(connection = %connection, "zone_enter_rejected_unauthenticated");
            return ZoneEntry::Unauthenticated;
        }
        if self.ledger.is_pending(connection) || self.dispatcher.is_awaiting_load(connection) {
            debug!(connection = %connection, "zone_enter_rejected_in_flight");
            return ZoneEntry::InFlight;
        }
        if self.instances.instance_of(connection).is_some() {
            debug!(connection = %connection, "zone_enter_rejected_in_session");
            return ZoneEntry::InSession;
        }
        match self.zone.on_entity_enter(connection, view) {
            EnterOutcome::Admitted => ZoneEntry::Admitted,
            EnterOutcome::AlreadyMember => ZoneEntry::AlreadyMember,
            EnterOutcome::Full => ZoneEntry::Full,
        }
    }

    pub fn on_entity_exit(&mut self, connection: ConnectionId, view: &mut dyn TransferView) -> bool {
        self.zone.on_entity_exit(connection, view)
    }

    pub fn on_ready(
        &mut self,
        connection: ConnectionId,
        instance_id: InstanceId,
        ports: &mut AuthorityPorts<'_>,
    ) -> ReadyOutcome {
        let entry = match validate_ready(connection, instance_id, &self.ledger, &self.instances) {
            Ok(entry) => entry,
            Err(rejection) => {
                self.counters.ready_rejections = self.counters.ready_rejections.saturating_add(1);
                warn!(
                    connection = %connection,
                    instance_id = %instance_id,
                    reason = rejection.as_str(),
                    "ready_rejected"
                );
                return ReadyOutcome::Rejected(rejection);
            }
        };

        let mut ctx = HandoffContext {
            registry: &mut *ports.registry,
            spawner: &mut *ports.spawner,
            ledger: &mut self.ledger,
            destroy_queue: &mut self.destroy_queue,
            avatar_template: self.settings.avatar_template,
            spawn_point: self.settings.spawn_point,
            destroy_delay: self.settings.destroy_delay,
            now: self.now,
        };
        match handoff::commit(&entry, &mut ctx) {
            Ok(receipt) => {
                self.counters.commits = self.counters.commits.saturating_add(1);
                self.instances.add_occupant(instance_id, connection);
                self.outbox.committed(connection, instance_id);
                if let Some(drained) = receipt.removal.drained {
                    self.settle_drained(drained);
                }
                ReadyOutcome::Committed(receipt)
            }
            Err(err) => {
                self.counters.handoff_failures = self.counters.handoff_failures.saturating_add(1);
                error!(
                    connection = %connection,
                    instance_id = %instance_id,
                    error = %err,
                    "handoff_failed"
                );
                if let Some(removal) = self.ledger.remove(connection, RemovalReason::HandoffFailed) {
                    if let Some(drained) = removal.drained {
                        self.settle_drained(drained);
                    }
                }
                ReadyOutcome::HandoffFailed
            }
        }
    }

    /// Forgets everything tied to a connection that went away. Committed
    /// peers of the same batch are unaffected.
    pub fn on_disconnect(&mut self, connection: ConnectionId, view: &mut dyn TransferView) {
        self.zone.on_entity_exit(connection, view);
        self.outbox.discard_for(connection);

        if let Some(removal) = self.ledger.remove(connection, RemovalReason::Disconnected) {
            self.counters.disconnects_in_flight =
                self.counters.disconnects_in_flight.saturating_add(1);
            info!(
                connection = %connection,
                instance_id = %removal.entry.instance_id,
                "transfer_dropped_disconnect"
            );
            if let Some(drained) = removal.drained {
                self.settle_drained(drained);
            }
        }

        if let Some((instance_id, remaining)) = self.instances.remove_occupant(connection) {
            if remaining == 0 && self.ledger.pending_for_instance(instance_id) == 0 {
                self.instances.schedule_unload(
                    instance_id,
                    self.now.saturating_add(self.settings.instance_unload_grace),
                );
            }
        }
    }

    pub fn tick(&mut self, dt: Duration, ports: &mut AuthorityPorts<'_>) {
        self.now = self.now.saturating_add(dt);

        let mut disconnects = std::mem::take(&mut self.disconnect_scratch);
        ports.registry.drain_disconnects(&mut disconnects);
        for connection in disconnects.drain(..) {
            self.on_disconnect(connection, &mut *ports.view);
        }
        self.disconnect_scratch = disconnects;

        self.poll_loads(ports);

        for removal in self.ledger.expire_stale(self.now) {
            self.counters.expirations = self.counters.expirations.saturating_add(1);
            if let Some(drained) = removal.drained {
                self.settle_drained(drained);
            }
        }

        if let Some(snapshot) = self.zone.tick(dt.as_secs_f32(), &mut *ports.view) {
            self.dispatch(snapshot, ports);
        }

        for avatar in self.destroy_queue.take_due(self.now) {
            debug!(avatar = %avatar, "old_avatar_destroyed");
            ports.spawner.destroy_avatar(avatar);
        }

        for handle in self.instances.take_due_unloads(self.now) {
            ports.loader.request_unload(handle);
        }
        self.instances.prune_unloaded();

        self.publish_metrics();
    }

    /// Ends a session: unloads the instance unless connections are still
    /// being handed into it.
    pub fn release_instance(&mut self, instance_id: InstanceId, loader: &mut dyn WorldLoader) -> bool {
        if self.ledger.pending_for_instance(instance_id) > 0 {
            warn!(instance_id = %instance_id, "instance_release_deferred_pending");
            return false;
        }
        match self.instances.unload_now(instance_id) {
            Some(handle) => {
                loader.request_unload(handle);
                true
            }
            None => false,
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<(ConnectionId, ServerMessage)> {
        self.outbox.drain()
    }

    pub fn zone(&self) -> &StagingZone {
        &self.zone
    }

    pub fn ledger(&self) -> &PendingTransferLedger {
        &self.ledger
    }

    pub fn instances(&self) -> &WorldInstances {
        &self.instances
    }

    pub fn metrics_handle(&self) -> TransferMetricsHandle {
        self.metrics.clone()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    fn dispatch(&mut self, snapshot: Vec<ConnectionId>, ports: &mut AuthorityPorts<'_>) {
        let batch_size = snapshot.len();
        match self
            .dispatcher
            .dispatch(snapshot, &mut *ports.loader, &mut self.instances)
        {
            Ok(Some(_)) => {
                self.counters.batches_dispatched = self.counters.batches_dispatched.saturating_add(1);
            }
            Ok(None) => {}
            Err(err) => {
                self.counters.batches_abandoned = self.counters.batches_abandoned.saturating_add(1);
                error!(error = %err, batch_size, "batch_abandoned");
            }
        }
    }

    fn poll_loads(&mut self, ports: &mut AuthorityPorts<'_>) {
        let mut completions = std::mem::take(&mut self.completion_scratch);
        ports.loader.poll_completions(&mut completions);
        for completion in completions.drain(..) {
            let mut ctx = DispatchContext {
                registry: &*ports.registry,
                loader: &mut *ports.loader,
                instances: &mut self.instances,
                ledger: &mut self.ledger,
                outbox: &mut self.outbox,
                now: self.now,
            };
            match self.dispatcher.complete_load(completion, &mut ctx) {
                Some(LoadContinuation::Invited { invited, .. }) => {
                    self.counters.invites_sent =
                        self.counters.invites_sent.saturating_add(invited.len() as u64);
                }
                Some(LoadContinuation::Abandoned { .. }) => {
                    self.counters.batches_abandoned =
                        self.counters.batches_abandoned.saturating_add(1);
                }
                Some(LoadContinuation::Empty { .. }) | None => {}
            }
        }
        self.completion_scratch = completions;
    }

    fn settle_drained(&mut self, drained: DrainedBatch) {
        self.outbox.forget_instance(drained.instance_id);
        info!(
            instance_id = %drained.instance_id,
            committed = drained.committed,
            "batch_drained"
        );
        // Committed occupants may all have left while peers were still pending.
        if drained.committed == 0 || self.instances.occupant_count(drained.instance_id) == 0 {
            self.instances.schedule_unload(
                drained.instance_id,
                self.now.saturating_add(self.settings.instance_unload_grace),
            );
        }
    }

    fn publish_metrics(&mut self) {
        self.counters.zone_members = self.zone.members().len();
        self.counters.pending_transfers = self.ledger.len();
        self.counters.live_instances = self.instances.live_count();
        self.counters.pending_destroys = self.destroy_queue.len();
        self.metrics.publish(self.counters);
    }
}
