use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::types::Vec3;

/// Index of a world template in the catalog. Any index the catalog did not
/// hand out is invalid and fails a load request immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldTemplateId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvatarTemplateId(pub u32);

impl fmt::Display for WorldTemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

impl fmt::Display for AvatarTemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "avatar#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    MovementControl,
    ReplicatedTransform,
    NetworkIdentity,
}

impl Capability {
    pub const REQUIRED_FOR_AVATAR: [Capability; 3] = [
        Capability::NetworkIdentity,
        Capability::MovementControl,
        Capability::ReplicatedTransform,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "movement_control" => Some(Self::MovementControl),
            "replicated_transform" => Some(Self::ReplicatedTransform),
            "network_identity" => Some(Self::NetworkIdentity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovementControl => "movement_control",
            Self::ReplicatedTransform => "replicated_transform",
            Self::NetworkIdentity => "network_identity",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AvatarTemplate {
    pub id: AvatarTemplateId,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl AvatarTemplate {
    pub fn missing_capability(&self) -> Option<Capability> {
        Capability::REQUIRED_FOR_AVATAR
            .into_iter()
            .find(|capability| !self.capabilities.contains(capability))
    }
}

#[derive(Debug, Clone)]
pub struct WorldTemplate {
    pub id: WorldTemplateId,
    pub name: String,
    pub spawn_point: Vec3,
}

#[derive(Debug, Default, Clone)]
pub struct TemplateCatalog {
    avatars: Vec<AvatarTemplate>,
    worlds: Vec<WorldTemplate>,
    avatar_ids_by_name: HashMap<String, AvatarTemplateId>,
    world_ids_by_name: HashMap<String, WorldTemplateId>,
}

impl TemplateCatalog {
    pub fn from_templates(
        mut avatars: Vec<AvatarTemplate>,
        mut worlds: Vec<WorldTemplate>,
    ) -> Self {
        let mut avatar_ids_by_name = HashMap::with_capacity(avatars.len());
        for (idx, avatar) in avatars.iter_mut().enumerate() {
            let id = AvatarTemplateId(idx as u32);
            avatar.id = id;
            avatar_ids_by_name.insert(avatar.name.clone(), id);
        }
        let mut world_ids_by_name = HashMap::with_capacity(worlds.len());
        for (idx, world) in worlds.iter_mut().enumerate() {
            let id = WorldTemplateId(idx as u32);
            world.id = id;
            world_ids_by_name.insert(world.name.clone(), id);
        }
        Self {
            avatars,
            worlds,
            avatar_ids_by_name,
            world_ids_by_name,
        }
    }

    pub fn avatar_id_by_name(&self, name: &str) -> Option<AvatarTemplateId> {
        self.avatar_ids_by_name.get(name).copied()
    }

    pub fn world_id_by_name(&self, name: &str) -> Option<WorldTemplateId> {
        self.world_ids_by_name.get(name).copied()
    }

    pub fn avatar(&self, id: AvatarTemplateId) -> Option<&AvatarTemplate> {
        self.avatars.get(id.0 as usize)
    }

    pub fn world(&self, id: WorldTemplateId) -> Option<&WorldTemplate> {
        self.worlds.get(id.0 as usize)
    }

    pub fn world_count(&self) -> usize {
        self.worlds.len()
    }

    pub fn avatar_count(&self) -> usize {
        self.avatars.len()
    }
}
