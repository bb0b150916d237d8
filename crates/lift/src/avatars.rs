use thiserror::Error;
use tracing::debug;

use crate::content::{AvatarTemplateId, Capability, TemplateCatalog};
use crate::types::{AuthorityFlags, AvatarRef, ConnectionId, InstanceId, Vec3};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("avatar template {0} is not registered")]
    UnknownTemplate(AvatarTemplateId),
    #[error("avatar template `{template}` lacks required capability `{}`", .capability.as_str())]
    MissingCapability {
        template: String,
        capability: Capability,
    },
}

/// Creates and destroys player avatars. Spawning validates the template's
/// capabilities before anything is created.
pub trait AvatarSpawner {
    fn spawn_avatar(
        &mut self,
        template: AvatarTemplateId,
        instance: InstanceId,
        spawn_point: Vec3,
        owner: ConnectionId,
        authority: AuthorityFlags,
    ) -> Result<AvatarRef, SpawnError>;
    fn destroy_avatar(&mut self, avatar: AvatarRef);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarLocation {
    Staging,
    Instance(InstanceId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Avatar {
    pub id: AvatarRef,
    pub template: AvatarTemplateId,
    pub owner: ConnectionId,
    pub location: AvatarLocation,
    pub position: Vec3,
    pub authority: AuthorityFlags,
}

#[derive(Debug, Default)]
pub struct AvatarRefAllocator {
    next: u64,
}

impl AvatarRefAllocator {
    pub fn allocate(&mut self) -> AvatarRef {
        let id = AvatarRef(self.next);
        self.next = self.next.saturating_add(1);
        id
    }
}

/// Avatar table backed by the template catalog. Spawns and despawns are
/// queued and take effect on `apply_pending`.
#[derive(Debug, Default)]
pub struct AvatarWorld {
    catalog: TemplateCatalog,
    allocator: AvatarRefAllocator,
    avatars: Vec<Avatar>,
    pending_spawns: Vec<Avatar>,
    pending_despawns: Vec<AvatarRef>,
}

impl AvatarWorld {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    /// Spawns the lobby avatar a connection starts out with.
    pub fn spawn_staging_avatar(
        &mut self,
        template: AvatarTemplateId,
        owner: ConnectionId,
        authority: AuthorityFlags,
    ) -> Result<AvatarRef, SpawnError> {
        self.spawn_internal(
            template,
            AvatarLocation::Staging,
            Vec3::default(),
            owner,
            authority,
        )
    }

    fn spawn_internal(
        &mut self,
        template: AvatarTemplateId,
        location: AvatarLocation,
        position: Vec3,
        owner: ConnectionId,
        authority: AuthorityFlags,
    ) -> Result<AvatarRef, SpawnError> {
        let avatar_template = self
            .catalog
            .avatar(template)
            .ok_or(SpawnError::UnknownTemplate(template))?;
        if let Some(capability) = avatar_template.missing_capability() {
            return Err(SpawnError::MissingCapability {
                template: avatar_template.name.clone(),
                capability,
            });
        }

        let id = self.allocator.allocate();
        self.pending_spawns.push(Avatar {
            id,
            template,
            owner,
            location,
            position,
            authority,
        });
        debug!(avatar = %id, owner = %owner, location = ?location, "avatar_spawn_queued");
        Ok(id)
    }

    pub fn despawn(&mut self, id: AvatarRef) -> bool {
        let exists_now = self.avatars.iter().any(|avatar| avatar.id == id);
        let pending_spawn = self.pending_spawns.iter().any(|avatar| avatar.id == id);
        if !exists_now && !pending_spawn {
            return false;
        }
        self.pending_despawns.push(id);
        true
    }

    pub fn apply_pending(&mut self) {
        self.avatars.append(&mut self.pending_spawns);
        if !self.pending_despawns.is_empty() {
            self.pending_despawns.sort();
            self.pending_despawns.dedup();
            let pending = &self.pending_despawns;
            self.avatars
                .retain(|avatar| pending.binary_search(&avatar.id).is_err());
            self.pending_despawns.clear();
        }
    }

    pub fn find(&self, id: AvatarRef) -> Option<&Avatar> {
        self.avatars.iter().find(|avatar| avatar.id == id)
    }

    pub fn avatars(&self) -> &[Avatar] {
        &self.avatars
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }
}

impl AvatarSpawner for AvatarWorld {
    fn spawn_avatar(
        &mut self,
        template: AvatarTemplateId,
        instance: InstanceId,
        spawn_point: Vec3,
        owner: ConnectionId,
        authority: AuthorityFlags,
    ) -> Result<AvatarRef, SpawnError> {
        self.spawn_internal(
            template,
            AvatarLocation::Instance(instance),
            spawn_point,
            owner,
            authority,
        )
    }

    fn destroy_avatar(&mut self, avatar: AvatarRef) {
        if !self.despawn(avatar) {
            debug!(avatar = %avatar, "avatar_destroy_ignored_unknown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::content::AvatarTemplate;

    use super::*;

    fn catalog() -> TemplateCatalog {
        TemplateCatalog::from_templates(
            vec![
                AvatarTemplate {
                    id: AvatarTemplateId(0),
                    name: "player".to_string(),
                    capabilities: Capability::REQUIRED_FOR_AVATAR.into_iter().collect(),
                },
                AvatarTemplate {
                    id: AvatarTemplateId(0),
                    name: "statue".to_string(),
                    capabilities: BTreeSet::from([Capability::NetworkIdentity]),
                },
            ],
            Vec::new(),
        )
    }

    #[test]
    fn allocator_never_reuses_refs() {
        let mut allocator = AvatarRefAllocator::default();
        assert_eq!(allocator.allocate(), AvatarRef(0));
        assert_eq!(allocator.allocate(), AvatarRef(1));
    }

    #[test]
    fn spawn_places_avatar_in_instance_after_apply() {
        let mut world = AvatarWorld::new(catalog());
        let spawn_point = Vec3 {
            x: 1.0,
            y: 0.0,
            z: -2.0,
        };
        let id = world
            .spawn_avatar(
                AvatarTemplateId(0),
                InstanceId(3),
                spawn_point,
                ConnectionId(9),
                AuthorityFlags::default(),
            )
            .expect("spawn");
        assert!(world.find(id).is_none());
        world.apply_pending();

        let avatar = world.find(id).expect("applied");
        assert_eq!(avatar.location, AvatarLocation::Instance(InstanceId(3)));
        assert_eq!(avatar.position, spawn_point);
        assert_eq!(avatar.owner, ConnectionId(9));
    }

    #[test]
    fn spawn_rejects_templates_missing_capabilities() {
        let mut world = AvatarWorld::new(catalog());
        let err = world
            .spawn_avatar(
                AvatarTemplateId(1),
                InstanceId(0),
                Vec3::default(),
                ConnectionId(1),
                AuthorityFlags::default(),
            )
            .expect_err("statue cannot be driven");
        assert_eq!(
            err,
            SpawnError::MissingCapability {
                template: "statue".to_string(),
                capability: Capability::MovementControl,
            }
        );
        assert_eq!(
            world
                .spawn_staging_avatar(AvatarTemplateId(7), ConnectionId(1), AuthorityFlags::default())
                .expect_err("unknown"),
            SpawnError::UnknownTemplate(AvatarTemplateId(7))
        );
        world.apply_pending();
        assert_eq!(world.avatar_count(), 0);
    }

    #[test]
    fn duplicate_despawns_are_idempotent() {
        let mut world = AvatarWorld::new(catalog());
        let doomed = world
            .spawn_staging_avatar(AvatarTemplateId(0), ConnectionId(1), AuthorityFlags::default())
            .expect("spawn");
        let survivor = world
            .spawn_staging_avatar(AvatarTemplateId(0), ConnectionId(2), AuthorityFlags::default())
            .expect("spawn");
        world.apply_pending();

        assert!(world.despawn(doomed));
        world.destroy_avatar(doomed);
        world.apply_pending();
        assert_eq!(world.avatar_count(), 1);
        assert!(world.find(survivor).is_some());
        assert!(!world.despawn(doomed));
    }
}
