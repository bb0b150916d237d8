use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::content::WorldTemplateId;
use crate::handshake::Outbox;
use crate::instances::{LoadCompletion, LoadError, LoadOutcome, WorldInstances, WorldLoader};
use crate::ledger::PendingTransferLedger;
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionId, InstanceId, InstanceIdAllocator};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("instance {instance_id} could not be requested")]
    LoadRequest {
        instance_id: InstanceId,
        #[source]
        source: LoadError,
    },
}

/// Result of feeding a loader completion back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadContinuation {
    /// Invites were queued for `invited`; `skipped` were no longer eligible.
    Invited {
        instance_id: InstanceId,
        invited: Vec<ConnectionId>,
        skipped: Vec<ConnectionId>,
    },
    /// The instance loaded but nobody from the batch could still be invited;
    /// it was unloaded again.
    Empty { instance_id: InstanceId },
    /// The load failed; the batch's connections are free again.
    Abandoned {
        instance_id: InstanceId,
        released: Vec<ConnectionId>,
        reason: String,
    },
}

pub struct DispatchContext<'a> {
    pub registry: &'a dyn ConnectionRegistry,
    pub loader: &'a mut dyn WorldLoader,
    pub instances: &'a mut WorldInstances,
    pub ledger: &'a mut PendingTransferLedger,
    pub outbox: &'a mut Outbox,
    pub now: Duration,
}

/// Turns a membership snapshot into a batch: one fresh instance, then one
/// ledger entry and Invite per still-eligible connection once it loads.
#[derive(Debug)]
pub struct GroupDispatcher {
    world_template: WorldTemplateId,
    allocator: InstanceIdAllocator,
    awaiting_load: BTreeMap<InstanceId, Vec<ConnectionId>>,
}

impl GroupDispatcher {
    pub fn new(world_template: WorldTemplateId) -> Self {
        Self {
            world_template,
            allocator: InstanceIdAllocator::default(),
            awaiting_load: BTreeMap::new(),
        }
    }

    pub fn dispatch(
        &mut self,
        snapshot: Vec<ConnectionId>,
        loader: &mut dyn WorldLoader,
        instances: &mut WorldInstances,
    ) -> Result<Option<InstanceId>, DispatchError> {
        if snapshot.is_empty() {
            return Ok(None);
        }

        let instance_id = self.allocator.allocate();
        loader
            .request_load(instance_id, self.world_template)
            .map_err(|source| DispatchError::LoadRequest {
                instance_id,
                source,
            })?;
        instances.insert_requested(instance_id, self.world_template);

        info!(
            instance_id = %instance_id,
            template = %self.world_template,
            batch_size = snapshot.len(),
            "batch_dispatched"
        );
        self.awaiting_load.insert(instance_id, snapshot);
        Ok(Some(instance_id))
    }

    pub fn complete_load(
        &mut self,
        completion: LoadCompletion,
        ctx: &mut DispatchContext<'_>,
    ) -> Option<LoadContinuation> {
        let Some(snapshot) = self.awaiting_load.remove(&completion.instance_id) else {
            debug!(instance_id = %completion.instance_id, "load_completion_ignored_unknown");
            return None;
        };
        let instance_id = completion.instance_id;

        let handle = match completion.outcome {
            LoadOutcome::Loaded(handle) => handle,
            LoadOutcome::Failed(reason) => {
                ctx.instances.mark_failed(instance_id);
                warn!(
                    instance_id = %instance_id,
                    batch_size = snapshot.len(),
                    reason = %reason,
                    "batch_abandoned_load_failed"
                );
                return Some(LoadContinuation::Abandoned {
                    instance_id,
                    released: snapshot,
                    reason,
                });
            }
        };
        ctx.instances.mark_loaded(handle);

        let mut invited = Vec::with_capacity(snapshot.len());
        let mut skipped = Vec::new();
        for connection in snapshot {
            let eligible = ctx.registry.is_connected(connection)
                && ctx.registry.is_authenticated(connection);
            let Some(old_avatar) = ctx.registry.avatar(connection).filter(|_| eligible) else {
                debug!(
                    connection = %connection,
                    instance_id = %instance_id,
                    "invite_skipped_ineligible"
                );
                skipped.push(connection);
                continue;
            };
            if let Err(err) = ctx.ledger.add(connection, instance_id, old_avatar, ctx.now) {
                warn!(error = %err, "invite_skipped_already_pending");
                skipped.push(connection);
                continue;
            }
            ctx.outbox.invite(connection, instance_id);
            invited.push(connection);
        }

        if invited.is_empty() {
            if let Some(handle) = ctx.instances.unload_now(instance_id) {
                ctx.loader.request_unload(handle);
            }
            info!(instance_id = %instance_id, "batch_empty_after_load");
            return Some(LoadContinuation::Empty { instance_id });
        }

        info!(
            instance_id = %instance_id,
            invited = invited.len(),
            skipped = skipped.len(),
            "batch_invited"
        );
        Some(LoadContinuation::Invited {
            instance_id,
            invited,
            skipped,
        })
    }

    /// Whether `connection` belongs to a batch whose instance is still
    /// loading.
    pub fn is_awaiting_load(&self, connection: ConnectionId) -> bool {
        self.awaiting_load
            .values()
            .any(|snapshot| snapshot.contains(&connection))
    }

    pub fn awaiting_load_count(&self) -> usize {
        self.awaiting_load.len()
    }

    pub fn world_template(&self) -> WorldTemplateId {
        self.world_template
    }
}

#[cfg(test)]
mod tests {
    use crate::instances::{InstanceState, SimulatedWorldLoader};
    use crate::registry::InMemoryRegistry;
    use crate::types::AvatarRef;

    use super::*;

    struct Fixture {
        registry: InMemoryRegistry,
        loader: SimulatedWorldLoader,
        instances: WorldInstances,
        ledger: PendingTransferLedger,
        outbox: Outbox,
    }

    impl Fixture {
        fn new(connections: &[u64]) -> Self {
            let mut registry = InMemoryRegistry::default();
            for raw in connections {
                let id = ConnectionId(*raw);
                registry.connect(id);
                registry.authenticate(id, "player");
                registry.bind_avatar(id, AvatarRef(100 + raw));
            }
            Self {
                registry,
                loader: SimulatedWorldLoader::new(1, 0),
                instances: WorldInstances::default(),
                ledger: PendingTransferLedger::new(Duration::from_secs(30)),
                outbox: Outbox::default(),
            }
        }

        fn complete(&mut self, dispatcher: &mut GroupDispatcher) -> Vec<LoadContinuation> {
            let mut completions = Vec::new();
            self.loader.poll_completions(&mut completions);
            let mut ctx = DispatchContext {
                registry: &self.registry,
                loader: &mut self.loader,
                instances: &mut self.instances,
                ledger: &mut self.ledger,
                outbox: &mut self.outbox,
                now: Duration::ZERO,
            };
            completions
                .into_iter()
                .filter_map(|completion| dispatcher.complete_load(completion, &mut ctx))
                .collect()
        }
    }

    #[test]
    fn empty_snapshot_allocates_nothing() {
        let mut fixture = Fixture::new(&[]);
        let mut dispatcher = GroupDispatcher::new(WorldTemplateId(0));
        let dispatched = dispatcher
            .dispatch(Vec::new(), &mut fixture.loader, &mut fixture.instances)
            .expect("dispatch");
        assert_eq!(dispatched, None);
        assert_eq!(fixture.loader.in_flight_count(), 0);
    }

    #[test]
    fn invalid_template_fails_the_batch_immediately() {
        let mut fixture = Fixture::new(&[1]);
        let mut dispatcher = GroupDispatcher::new(WorldTemplateId(9));
        let err = dispatcher
            .dispatch(vec![ConnectionId(1)], &mut fixture.loader, &mut fixture.instances)
            .expect_err("unknown template");
        assert!(matches!(
            err,
            DispatchError::LoadRequest {
                source: LoadError::UnknownTemplate(_),
                ..
            }
        ));
        assert!(!dispatcher.is_awaiting_load(ConnectionId(1)));
        assert_eq!(fixture.instances.live_count(), 0);
    }

    #[test]
    fn loaded_batch_invites_only_eligible_connections() {
        let mut fixture = Fixture::new(&[1, 2, 3]);
        let mut dispatcher = GroupDispatcher::new(WorldTemplateId(0));
        let instance_id = dispatcher
            .dispatch(
                vec![ConnectionId(1), ConnectionId(2), ConnectionId(3)],
                &mut fixture.loader,
                &mut fixture.instances,
            )
            .expect("dispatch")
            .expect("instance");
        assert!(dispatcher.is_awaiting_load(ConnectionId(2)));
        fixture.registry.disconnect(ConnectionId(2));

        let continuations = fixture.complete(&mut dispatcher);
        assert_eq!(
            continuations,
            vec![LoadContinuation::Invited {
                instance_id,
                invited: vec![ConnectionId(1), ConnectionId(3)],
                skipped: vec![ConnectionId(2)],
            }]
        );
        assert_eq!(fixture.ledger.pending_for_instance(instance_id), 2);
        assert_eq!(fixture.outbox.drain().len(), 2);
        assert_eq!(fixture.instances.state(instance_id), Some(InstanceState::Loaded));
    }

    #[test]
    fn batch_without_eligible_members_unloads_its_instance() {
        let mut fixture = Fixture::new(&[1]);
        let mut dispatcher = GroupDispatcher::new(WorldTemplateId(0));
        let instance_id = dispatcher
            .dispatch(vec![ConnectionId(1)], &mut fixture.loader, &mut fixture.instances)
            .expect("dispatch")
            .expect("instance");
        fixture.registry.disconnect(ConnectionId(1));

        let continuations = fixture.complete(&mut dispatcher);
        assert_eq!(continuations, vec![LoadContinuation::Empty { instance_id }]);
        assert!(!fixture.loader.is_loaded(instance_id));
        assert_eq!(fixture.instances.state(instance_id), Some(InstanceState::Unloaded));
    }

    #[test]
    fn failed_load_abandons_and_releases_the_batch() {
        let mut fixture = Fixture::new(&[1, 2]);
        fixture.loader.fail_next_loads(1);
        let mut dispatcher = GroupDispatcher::new(WorldTemplateId(0));
        let instance_id = dispatcher
            .dispatch(
                vec![ConnectionId(1), ConnectionId(2)],
                &mut fixture.loader,
                &mut fixture.instances,
            )
            .expect("dispatch")
            .expect("instance");

        let continuations = fixture.complete(&mut dispatcher);
        assert!(matches!(
            &continuations[..],
            [LoadContinuation::Abandoned { instance_id: id, released, .. }]
                if *id == instance_id && released.len() == 2
        ));
        assert!(fixture.ledger.is_empty());
        assert!(fixture.outbox.is_empty());
        assert!(!dispatcher.is_awaiting_load(ConnectionId(1)));
    }
}
