use super::appearance::{AppearanceContext, AppearanceError, AvatarAppearance};
use crate::assets::fetch::{AssetEvent, CompletionQueue};
use crate::config::AppearanceSettings;
use crate::utils::math::Aabb;
use crate::world::events::{AvatarAppearanceEvent, WearablesChangedEvent};
use glam::Vec3;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Default standing avatar size in meters.
pub const DEFAULT_AVATAR_SIZE: Vec3 = Vec3::new(0.45, 0.6, 1.9);

/// One avatar in the scene
#[derive(Debug)]
pub struct Avatar {
    pub appearance: AvatarAppearance,
    pub position: Vec3,
    pub size: Vec3,
    pub muted: bool,
    /// Camera is inside the avatar's head (self only).
    pub first_person: bool,
}

impl Avatar {
    pub fn new(id: Uuid, is_self: bool, settings: &AppearanceSettings) -> Self {
        Self {
            appearance: AvatarAppearance::new(id, is_self, settings),
            position: Vec3::ZERO,
            size: DEFAULT_AVATAR_SIZE,
            muted: false,
            first_person: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.appearance.avatar_id()
    }

    pub fn is_self(&self) -> bool {
        self.appearance.is_self()
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_center_half_extents(self.position, self.size * 0.5)
    }

    pub fn radius(&self) -> f32 {
        self.bounds().radius()
    }
}

/// Tally of one completion drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub delivered: usize,
    pub dropped: usize,
}

/// Every avatar the viewer knows about, keyed by agent id.
#[derive(Debug, Default)]
pub struct AvatarRegistry {
    avatars: HashMap<Uuid, Avatar>,
    self_id: Option<Uuid>,
}

impl AvatarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: Uuid, is_self: bool, settings: &AppearanceSettings) -> &mut Avatar {
        if is_self {
            self.self_id = Some(id);
        }
        info!("Avatar {} added{}", id, if is_self { " (self)" } else { "" });
        self.avatars.entry(id).or_insert_with(|| Avatar::new(id, is_self, settings))
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Avatar> {
        if self.self_id.as_ref() == Some(id) {
            self.self_id = None;
        }
        let removed = self.avatars.remove(id);
        if removed.is_some() {
            info!("Avatar {} removed", id);
        }
        removed
    }

    pub fn get(&self, id: &Uuid) -> Option<&Avatar> {
        self.avatars.get(id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Avatar> {
        self.avatars.get_mut(id)
    }

    pub fn self_id(&self) -> Option<Uuid> {
        self.self_id
    }

    pub fn self_avatar(&self) -> Option<&Avatar> {
        self.self_id.and_then(|id| self.avatars.get(&id))
    }

    pub fn self_avatar_mut(&mut self) -> Option<&mut Avatar> {
        let id = self.self_id?;
        self.avatars.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Avatar> {
        self.avatars.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Avatar> {
        self.avatars.values_mut()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.avatars.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.avatars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.avatars.is_empty()
    }

    pub fn on_appearance(&mut self, ctx: &mut AppearanceContext<'_>, event: &AvatarAppearanceEvent) -> Result<(), AppearanceError> {
        let avatar = self
            .avatars
            .get_mut(&event.avatar_id)
            .ok_or(AppearanceError::UnknownAvatar(event.avatar_id))?;
        avatar.appearance.apply_appearance(ctx, &event.baked);
        Ok(())
    }

    pub fn on_wearables_changed(&mut self, ctx: &mut AppearanceContext<'_>, event: &WearablesChangedEvent) -> Result<(), AppearanceError> {
        let avatar = self.self_avatar_mut().ok_or(AppearanceError::NotOwner)?;
        for &(index, id) in &event.textures {
            avatar.appearance.set_local_texture(ctx, index, id);
        }
        Ok(())
    }

    /// Route one completion to its avatar. Returns false if the avatar is gone.
    pub fn dispatch(&mut self, ctx: &mut AppearanceContext<'_>, event: AssetEvent) -> bool {
        let Some(avatar) = self.avatars.get_mut(&event.avatar()) else {
            debug!("Dropping completion for departed avatar {}", event.avatar());
            return false;
        };
        let appearance = &mut avatar.appearance;
        match event {
            AssetEvent::Fetch(fetch) => appearance.on_fetch_event(ctx, fetch),
            AssetEvent::BakeQuery { region, hash, result, .. } => {
                appearance.on_cached_texture_response(ctx, region, hash, result)
            }
            AssetEvent::BakeUpload { region, hash, result, .. } => appearance.on_bake_uploaded(ctx, region, hash, result),
        }
        true
    }

    /// Drain up to `max` completions and apply them, oldest first.
    pub fn drain_completions(&mut self, ctx: &mut AppearanceContext<'_>, queue: &CompletionQueue, max: usize) -> DrainStats {
        let mut stats = DrainStats::default();
        for event in queue.drain(max) {
            if self.dispatch(ctx, event) {
                stats.delivered += 1;
            } else {
                stats.dropped += 1;
            }
        }
        stats
    }

    /// Idle housekeeping and mesh texture reconciliation for every avatar.
    pub fn idle_update(&mut self, ctx: &mut AppearanceContext<'_>) {
        for avatar in self.avatars.values_mut() {
            avatar.appearance.idle_update(ctx);
            if avatar.appearance.needs_update() {
                avatar.appearance.update_mesh_textures(ctx.settings);
            }
        }
    }
}
