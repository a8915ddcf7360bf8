use crate::assets::bake_cache::BakeHash;
use crate::assets::texture::DEFAULT_AVATAR_TEXTURE;
use crate::world::avatar::{BakedRegion, LocalTextureIndex};
use crate::world::object::ObjectKind;
use glam::Vec3;
use std::time::SystemTime;
use uuid::Uuid;

/// Events sent from the message layer into the world.
/// These are decoded, application-friendly data structures.

/// Per-region bake state announced by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BakedTextureEntry {
    NotBaked,
    Baked(Uuid),
}

impl From<Uuid> for BakedTextureEntry {
    fn from(id: Uuid) -> Self {
        if id.is_nil() || id == DEFAULT_AVATAR_TEXTURE {
            BakedTextureEntry::NotBaked
        } else {
            BakedTextureEntry::Baked(id)
        }
    }
}

/// Appearance update for one avatar
#[derive(Debug, Clone)]
pub struct AvatarAppearanceEvent {
    pub avatar_id: Uuid,
    pub baked: Vec<(BakedRegion, BakedTextureEntry)>,
    pub timestamp: SystemTime,
}

impl AvatarAppearanceEvent {
    pub fn new(avatar_id: Uuid, baked: Vec<(BakedRegion, BakedTextureEntry)>) -> Self {
        Self {
            avatar_id,
            baked,
            timestamp: SystemTime::now(),
        }
    }

    /// Build from decoded texture entry slots; non-bake slots are ignored.
    pub fn from_texture_entries(avatar_id: Uuid, entries: &[(u8, Uuid)]) -> Self {
        let baked = entries
            .iter()
            .filter_map(|&(slot, id)| {
                BakedRegion::from_texture_entry_index(slot).map(|region| (region, BakedTextureEntry::from(id)))
            })
            .collect();
        Self::new(avatar_id, baked)
    }
}

/// The agent's own worn wearable textures changed
#[derive(Debug, Clone)]
pub struct WearablesChangedEvent {
    pub textures: Vec<(LocalTextureIndex, Option<Uuid>)>,
    pub timestamp: SystemTime,
}

impl WearablesChangedEvent {
    pub fn new(textures: Vec<(LocalTextureIndex, Option<Uuid>)>) -> Self {
        Self {
            textures,
            timestamp: SystemTime::now(),
        }
    }
}

/// Object update received from the simulator
#[derive(Debug, Clone)]
pub struct ObjectUpdateEvent {
    pub object_id: Uuid,
    pub kind: ObjectKind,
    pub position: Vec3,
    pub scale: Vec3,
    pub timestamp: SystemTime,
}

impl ObjectUpdateEvent {
    pub fn new(object_id: Uuid, kind: ObjectKind, position: Vec3, scale: Vec3) -> Self {
        Self {
            object_id,
            kind,
            position,
            scale,
            timestamp: SystemTime::now(),
        }
    }
}

/// Object removed from the scene
#[derive(Debug, Clone)]
pub struct ObjectKillEvent {
    pub object_id: Uuid,
    pub timestamp: SystemTime,
}

/// Messages the appearance code asks the transport to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppearanceMessage {
    /// Ask the simulator whether a bake for this content hash is cached.
    CachedTextureRequest { region: BakedRegion, hash: BakeHash },
    /// Ask the owner of `avatar` to rebake a region whose bake failed to load.
    RebakeRequest { avatar: Uuid, region: BakedRegion, texture_id: Uuid },
    /// Our freshly uploaded bake for `region`.
    BakeUploaded { region: BakedRegion, texture_id: Uuid, hash: BakeHash },
}
