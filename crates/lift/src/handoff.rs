use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::avatars::{AvatarSpawner, SpawnError};
use crate::content::AvatarTemplateId;
use crate::ledger::{LedgerEntry, PendingTransferLedger, Removal, RemovalReason};
use crate::registry::{ConnectionRegistry, RebindError};
use crate::types::{AvatarRef, ConnectionId, InstanceId, Vec3};

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("connection {0} has no pending transfer")]
    NotPending(ConnectionId),
    #[error("spawning the new avatar for connection {connection} failed")]
    Spawn {
        connection: ConnectionId,
        #[source]
        source: SpawnError,
    },
    #[error("re-binding connection {connection} to its new avatar failed")]
    Rebind {
        connection: ConnectionId,
        #[source]
        source: RebindError,
    },
}

/// Old avatars waiting out the destroy delay. Entries are never dropped
/// without being executed.
#[derive(Debug, Default)]
pub struct DestroyQueue {
    entries: Vec<(Duration, AvatarRef)>,
}

impl DestroyQueue {
    pub fn schedule(&mut self, avatar: AvatarRef, due: Duration) {
        self.entries.push((due, avatar));
    }

    pub fn take_due(&mut self, now: Duration) -> Vec<AvatarRef> {
        let mut due = Vec::new();
        self.entries.retain(|(at, avatar)| {
            if *at <= now {
                due.push(*avatar);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct HandoffContext<'a> {
    pub registry: &'a mut dyn ConnectionRegistry,
    pub spawner: &'a mut dyn AvatarSpawner,
    pub ledger: &'a mut PendingTransferLedger,
    pub destroy_queue: &'a mut DestroyQueue,
    pub avatar_template: AvatarTemplateId,
    pub spawn_point: Vec3,
    pub destroy_delay: Duration,
    pub now: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub connection: ConnectionId,
    pub instance_id: InstanceId,
    pub old_avatar: AvatarRef,
    pub new_avatar: AvatarRef,
    pub removal: Removal,
}

/// Moves one connection onto a fresh avatar inside its target instance.
///
/// Nothing about the old avatar changes unless the spawn and the re-bind
/// both succeed. On success the old avatar is queued for destruction after
/// `destroy_delay` and the ledger entry is removed as committed.
pub fn commit(
    entry: &LedgerEntry,
    ctx: &mut HandoffContext<'_>,
) -> Result<CommitReceipt, HandoffError> {
    let connection = entry.connection;
    if ctx.ledger.resolve(connection) != Some(entry) {
        return Err(HandoffError::NotPending(connection));
    }
    let authority = ctx.registry.authority(connection).unwrap_or_default();

    let new_avatar = ctx
        .spawner
        .spawn_avatar(
            ctx.avatar_template,
            entry.instance_id,
            ctx.spawn_point,
            connection,
            authority,
        )
        .map_err(|source| HandoffError::Spawn { connection, source })?;

    let replaced = match ctx.registry.rebind_avatar(connection, new_avatar) {
        Ok(replaced) => replaced,
        Err(source) => {
            ctx.spawner.destroy_avatar(new_avatar);
            return Err(HandoffError::Rebind { connection, source });
        }
    };
    if replaced != entry.old_avatar {
        warn!(
            connection = %connection,
            recorded = %entry.old_avatar,
            replaced = %replaced,
            "handoff_avatar_changed_since_invite"
        );
    }
    ctx.registry.set_ready(connection, true);
    ctx.destroy_queue
        .schedule(replaced, ctx.now.saturating_add(ctx.destroy_delay));

    let removal = ctx
        .ledger
        .remove(connection, RemovalReason::Committed)
        .ok_or(HandoffError::NotPending(connection))?;

    info!(
        connection = %connection,
        instance_id = %entry.instance_id,
        old_avatar = %replaced,
        new_avatar = %new_avatar,
        "handoff_committed"
    );
    Ok(CommitReceipt {
        connection,
        instance_id: entry.instance_id,
        old_avatar: replaced,
        new_avatar,
        removal,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::avatars::{AvatarLocation, AvatarWorld};
    use crate::content::{AvatarTemplate, Capability, TemplateCatalog};
    use crate::registry::InMemoryRegistry;
    use crate::types::AuthorityFlags;

    use super::*;

    struct Fixture {
        registry: InMemoryRegistry,
        world: AvatarWorld,
        ledger: PendingTransferLedger,
        destroy_queue: DestroyQueue,
        old_avatar: AvatarRef,
    }

    fn fixture(capabilities: BTreeSet<Capability>) -> Fixture {
        let catalog = TemplateCatalog::from_templates(
            vec![AvatarTemplate {
                id: AvatarTemplateId(0),
                name: "player".to_string(),
                capabilities,
            }],
            Vec::new(),
        );
        let mut world = AvatarWorld::new(catalog);
        let mut registry = InMemoryRegistry::default();
        registry.connect(ConnectionId(1));
        registry.authenticate(ConnectionId(1), "ada");
        let old_avatar = AvatarRef(900);
        registry.bind_avatar(ConnectionId(1), old_avatar);
        world.apply_pending();

        let mut ledger = PendingTransferLedger::new(Duration::from_secs(30));
        ledger
            .add(ConnectionId(1), InstanceId(2), old_avatar, Duration::ZERO)
            .expect("add");
        Fixture {
            registry,
            world,
            ledger,
            destroy_queue: DestroyQueue::default(),
            old_avatar,
        }
    }

    fn run_commit(fixture: &mut Fixture) -> Result<CommitReceipt, HandoffError> {
        let entry = *fixture.ledger.resolve(ConnectionId(1)).expect("entry");
        let mut ctx = HandoffContext {
            registry: &mut fixture.registry,
            spawner: &mut fixture.world,
            ledger: &mut fixture.ledger,
            destroy_queue: &mut fixture.destroy_queue,
            avatar_template: AvatarTemplateId(0),
            spawn_point: Vec3 {
                x: 4.0,
                y: 0.0,
                z: 4.0,
            },
            destroy_delay: Duration::from_millis(500),
            now: Duration::from_secs(10),
        };
        commit(&entry, &mut ctx)
    }

    #[test]
    fn commit_rebinds_marks_ready_and_defers_destroy() {
        let mut fixture = fixture(Capability::REQUIRED_FOR_AVATAR.into_iter().collect());
        let receipt = run_commit(&mut fixture).expect("commit");

        assert_eq!(receipt.old_avatar, fixture.old_avatar);
        assert_eq!(
            fixture.registry.avatar(ConnectionId(1)),
            Some(receipt.new_avatar)
        );
        let record = fixture.registry.record(ConnectionId(1)).expect("record");
        assert!(record.ready);
        assert_eq!(record.authority, AuthorityFlags::default());
        assert!(!fixture.ledger.is_pending(ConnectionId(1)));
        assert_eq!(receipt.removal.drained.map(|batch| batch.committed), Some(1));

        assert!(fixture
            .destroy_queue
            .take_due(Duration::from_millis(10_499))
            .is_empty());
        assert_eq!(
            fixture.destroy_queue.take_due(Duration::from_millis(10_500)),
            vec![fixture.old_avatar]
        );

        fixture.world.apply_pending();
        let spawned = fixture.world.find(receipt.new_avatar).expect("spawned");
        assert_eq!(spawned.location, AvatarLocation::Instance(InstanceId(2)));
    }

    #[test]
    fn spawn_failure_leaves_old_binding_and_ledger_untouched() {
        let mut fixture = fixture(BTreeSet::from([Capability::NetworkIdentity]));
        let err = run_commit(&mut fixture).expect_err("template lacks capabilities");
        assert!(matches!(err, HandoffError::Spawn { .. }));
        assert_eq!(
            fixture.registry.avatar(ConnectionId(1)),
            Some(fixture.old_avatar)
        );
        assert!(fixture.ledger.is_pending(ConnectionId(1)));
        assert!(fixture.destroy_queue.is_empty());
        fixture.world.apply_pending();
        assert_eq!(fixture.world.avatar_count(), 0);
    }

    #[test]
    fn rebind_failure_destroys_the_new_avatar() {
        let mut fixture = fixture(Capability::REQUIRED_FOR_AVATAR.into_iter().collect());
        fixture.registry.disconnect(ConnectionId(1));
        let err = run_commit(&mut fixture).expect_err("connection gone");
        assert!(matches!(err, HandoffError::Rebind { .. }));
        fixture.world.apply_pending();
        assert_eq!(fixture.world.avatar_count(), 0);
        assert!(fixture.destroy_queue.is_empty());
    }
}
