//! Reconciles what each body region shows while local wearable textures and
//! server bakes arrive asynchronously and out of order.

use super::baked_texture::BakedTextureSlot;
use super::dictionary::{BakedRegion, LocalTextureIndex};
use super::layer_set::LayerParams;
use super::local_texture::{LocalTextureSlot, SlotUpdate};
use crate::assets::bake_cache::{BakeCacheService, BakeError, BakeHash};
use crate::assets::fetch::{FetchEvent, FetchPriority, FetchRequest, FetchStatus, FetchTarget, TextureFetchService};
use crate::assets::texture::{is_placeholder, DiscardLevel, RawImage, DEFAULT_AVATAR_TEXTURE};
use crate::config::AppearanceSettings;
use crate::world::events::{AppearanceMessage, BakedTextureEntry};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppearanceError {
    #[error("Only the viewer's own avatar can upload bakes")]
    NotOwner,

    #[error("Avatar {0} is not registered")]
    UnknownAvatar(Uuid),

    #[error(transparent)]
    Bake(#[from] BakeError),
}

/// What a region's meshes currently show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTexture {
    /// Compiled-in grey placeholder.
    Default,
    /// Composite of local wearable layers.
    LocalComposite(Uuid),
    /// Previous bake, kept while a newer one is in flight.
    LastKnownGood(Uuid),
    /// Current bake, fully loaded.
    Baked(Uuid),
}

impl RegionTexture {
    pub fn texture_id(&self) -> Uuid {
        match self {
            RegionTexture::Default => DEFAULT_AVATAR_TEXTURE,
            RegionTexture::LocalComposite(id) | RegionTexture::LastKnownGood(id) | RegionTexture::Baked(id) => *id,
        }
    }
}

/// Collaborators the coordinator talks to during one call.
pub struct AppearanceContext<'a> {
    pub fetcher: &'a mut dyn TextureFetchService,
    pub bake_cache: &'a mut dyn BakeCacheService,
    pub outbox: &'a mut Vec<AppearanceMessage>,
    pub settings: &'a AppearanceSettings,
    pub now: Instant,
}

/// Baked/local texture state of one avatar.
#[derive(Debug)]
pub struct AvatarAppearance {
    avatar_id: Uuid,
    is_self: bool,
    edit_mode: bool,
    local: Vec<LocalTextureSlot>,
    baked: Vec<BakedTextureSlot>,
    selections: [RegionTexture; BakedRegion::COUNT],
    needs_update: bool,
    cache_check_sent_at: Option<Instant>,
}

impl AvatarAppearance {
    pub fn new(avatar_id: Uuid, is_self: bool, settings: &AppearanceSettings) -> Self {
        let min_discard = DiscardLevel::new(if is_self {
            settings.self_min_discard
        } else {
            settings.others_min_discard
        });
        Self {
            avatar_id,
            is_self,
            edit_mode: false,
            local: LocalTextureIndex::ALL
                .iter()
                .map(|&index| LocalTextureSlot::new(index, min_discard))
                .collect(),
            baked: BakedRegion::ALL.iter().map(|&region| BakedTextureSlot::new(region)).collect(),
            selections: [RegionTexture::Default; BakedRegion::COUNT],
            needs_update: true,
            cache_check_sent_at: None,
        }
    }

    pub fn avatar_id(&self) -> Uuid {
        self.avatar_id
    }

    pub fn is_self(&self) -> bool {
        self.is_self
    }

    pub fn is_edit_mode(&self) -> bool {
        self.edit_mode
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    pub fn local_slot(&self, index: LocalTextureIndex) -> &LocalTextureSlot {
        &self.local[index.index()]
    }

    pub fn baked_slot(&self, region: BakedRegion) -> &BakedTextureSlot {
        &self.baked[region.index()]
    }

    /// Selection made by the last `update_mesh_textures`.
    pub fn selection(&self, region: BakedRegion) -> RegionTexture {
        self.selections[region.index()]
    }

    pub fn selections(&self) -> [RegionTexture; BakedRegion::COUNT] {
        self.selections
    }

    /// Every region shows a current, fully loaded bake.
    pub fn is_fully_baked(&self) -> bool {
        self.baked.iter().all(|slot| slot.is_loaded())
    }

    /// Nothing but placeholders on screen.
    pub fn is_grey(&self) -> bool {
        self.selections.iter().all(|s| *s == RegionTexture::Default)
    }

    fn region_has_local_image(&self, region: BakedRegion) -> bool {
        region
            .local_textures()
            .iter()
            .any(|index| self.local[index.index()].has_image())
    }

    fn set_region_baked_ready(&mut self, region: BakedRegion, ready: bool) {
        for index in region.local_textures() {
            self.local[index.index()].set_baked_ready(ready);
        }
    }

    /// Content hash of every local texture that feeds `region`.
    pub fn region_hash(&self, region: BakedRegion) -> BakeHash {
        let mut data = Vec::with_capacity(1 + region.local_textures().len() * 16);
        data.push(region.texture_entry_index());
        for index in region.local_textures() {
            let id = self.local[index.index()].image_id().unwrap_or_else(Uuid::nil);
            data.extend_from_slice(id.as_bytes());
        }
        BakeHash::compute(&data)
    }

    // =========================================================================
    // Local textures
    // =========================================================================

    /// Wear `image_id` (or nothing) in a local slot and start fetching it.
    pub fn set_local_texture(&mut self, ctx: &mut AppearanceContext<'_>, index: LocalTextureIndex, image_id: Option<Uuid>) {
        let region = index.region();
        if !self.local[index.index()].set_image_id(image_id) {
            return;
        }

        if let Some(id) = image_id {
            let slot = &self.local[index.index()];
            ctx.fetcher.request_fetch(FetchRequest {
                image_id: id,
                desired_discard: slot.min_discard(),
                priority: if self.is_self { FetchPriority::High } else { FetchPriority::Normal },
                target: FetchTarget::LocalTexture { avatar: self.avatar_id, index },
            });
        }

        if self.is_self {
            // The current bake no longer matches what is worn. Keep showing it
            // as last-known-good until the new one lands.
            let slot = &mut self.baked[region.index()];
            slot.clear();
            slot.set_upload_pending(true);
            self.set_region_baked_ready(region, false);
        }

        if let Some(layer_set) = self.baked[region.index()].layer_set_mut() {
            layer_set.invalidate();
        }
        self.needs_update = true;
    }

    /// Fetch progress for a local slot. Never blocks.
    pub fn on_local_texture_progress(
        &mut self,
        ctx: &mut AppearanceContext<'_>,
        index: LocalTextureIndex,
        image_id: Uuid,
        discard: DiscardLevel,
        image: Option<RawImage>,
        is_final: bool,
    ) {
        let region = index.region();
        match self.local[index.index()].apply_progress(image_id, discard, image) {
            SlotUpdate::Improved => {
                trace!("{} local {:?} improved to {} (final: {})", self.avatar_id, index, discard, is_final);
                self.needs_update = true;
                if self.is_self && !self.edit_mode {
                    self.request_layer_set_update(ctx, region);
                } else if let Some(layer_set) = self.baked[region.index()].layer_set_mut() {
                    layer_set.invalidate();
                }
            }
            SlotUpdate::Frozen => trace!("{} local {:?} ignored, {} is baked", self.avatar_id, index, region),
            SlotUpdate::Stale => trace!("{} local {:?} result for a texture no longer worn", self.avatar_id, index),
            SlotUpdate::Ignored => {}
        }
    }

    /// The asset behind a local slot does not exist. Shown as default, never retried.
    pub fn on_local_texture_missing(&mut self, index: LocalTextureIndex, image_id: Uuid) {
        if self.local[index.index()].mark_missing(image_id) {
            warn!("{} local texture {} for {:?} is missing, using default", self.avatar_id, image_id, index);
            if let Some(layer_set) = self.baked[index.region().index()].layer_set_mut() {
                layer_set.invalidate();
            }
            self.needs_update = true;
        }
    }

    /// Recomposite `region`, and upload it if it became complete.
    pub fn request_layer_set_update(&mut self, ctx: &mut AppearanceContext<'_>, region: BakedRegion) {
        if let Some(layer_set) = self.baked[region.index()].layer_set_mut() {
            layer_set.invalidate();
        }
        self.needs_update = true;

        if self.is_self && self.baked[region.index()].upload_pending() {
            if let Err(e) = self.request_layer_set_upload(ctx, region) {
                warn!("{} upload of {} failed: {}", self.avatar_id, region, e);
            }
        }
    }

    /// Live layer parameter change from the appearance editor.
    pub fn set_layer_params(&mut self, settings: &AppearanceSettings, index: LocalTextureIndex, params: LayerParams) {
        let size = composite_size(settings, index.region());
        let layer_set = self.baked[index.region().index()].ensure_layer_set(size);
        if layer_set.set_layer_params(index, params) {
            self.needs_update = true;
            if self.is_self {
                // The bake no longer matches the edited look; it stays up as last-known-good.
                let region = index.region();
                let slot = &mut self.baked[region.index()];
                slot.clear();
                slot.set_upload_pending(true);
                self.set_region_baked_ready(region, false);
            }
        }
    }

    // =========================================================================
    // Baked textures
    // =========================================================================

    pub fn apply_appearance(&mut self, ctx: &mut AppearanceContext<'_>, baked: &[(BakedRegion, BakedTextureEntry)]) {
        for &(region, entry) in baked {
            match entry {
                BakedTextureEntry::Baked(id) => self.on_baked_texture_arrived(ctx, region, id),
                BakedTextureEntry::NotBaked => self.on_baked_texture_arrived(ctx, region, DEFAULT_AVATAR_TEXTURE),
            }
        }
    }

    /// The simulator declared `texture_id` as the bake for `region`.
    pub fn on_baked_texture_arrived(&mut self, ctx: &mut AppearanceContext<'_>, region: BakedRegion, texture_id: Uuid) {
        let avatar_id = self.avatar_id;
        let slot = &mut self.baked[region.index()];

        if is_placeholder(&texture_id) {
            debug!("{} region {} is not baked", avatar_id, region);
            slot.clear();
            self.needs_update = true;
            if self.is_self {
                self.baked[region.index()].set_upload_pending(true);
                self.request_layer_set_update(ctx, region);
            }
            return;
        }

        if slot.texture_id() == Some(texture_id) && (slot.is_loaded() || slot.pending_fetch().is_some()) {
            trace!("{} region {} already has {}", avatar_id, region, texture_id);
            return;
        }

        if slot.last_good_id() == Some(texture_id) {
            debug!("{} region {} returns to cached bake {}", avatar_id, region, texture_id);
            self.use_baked_texture(region, texture_id);
            return;
        }

        slot.declare(texture_id);
        let handle = ctx.fetcher.request_fetch(FetchRequest {
            image_id: texture_id,
            desired_discard: DiscardLevel::FULL,
            priority: FetchPriority::High,
            target: FetchTarget::BakedTexture { avatar: avatar_id, region },
        });
        slot.set_pending_fetch(handle, texture_id);
        self.needs_update = true;
        debug!("{} region {} fetching bake {} ({:?})", avatar_id, region, texture_id, handle);
    }

    /// Dispatch a fetch completion addressed to this avatar.
    pub fn on_fetch_event(&mut self, ctx: &mut AppearanceContext<'_>, event: FetchEvent) {
        match event.target {
            FetchTarget::LocalTexture { index, .. } => match event.status {
                FetchStatus::Missing => self.on_local_texture_missing(index, event.image_id),
                FetchStatus::Failed(reason) => {
                    debug!("{} local {:?} fetch failed: {}", self.avatar_id, index, reason);
                }
                status => {
                    let is_final = status.is_final();
                    self.on_local_texture_progress(ctx, index, event.image_id, event.discard, event.image, is_final);
                }
            },
            FetchTarget::BakedTexture { region, .. } => {
                self.on_baked_fetch_complete(ctx, region, event.image_id, event.status, event.image.is_some())
            }
        }
    }

    fn on_baked_fetch_complete(
        &mut self,
        ctx: &mut AppearanceContext<'_>,
        region: BakedRegion,
        texture_id: Uuid,
        status: FetchStatus,
        has_image: bool,
    ) {
        if self.baked[region.index()].texture_id() != Some(texture_id) {
            trace!("{} region {} dropping superseded bake {}", self.avatar_id, region, texture_id);
            return;
        }

        match status {
            FetchStatus::Progress => {}
            FetchStatus::Final if has_image => self.use_baked_texture(region, texture_id),
            FetchStatus::Final | FetchStatus::Missing | FetchStatus::Failed(_) => {
                warn!("{} bake {} for {} failed to load, requesting rebake", self.avatar_id, texture_id, region);
                self.baked[region.index()].fail(texture_id);
                self.needs_update = true;
                if self.is_self {
                    self.baked[region.index()].set_upload_pending(true);
                    self.set_region_baked_ready(region, false);
                    self.request_layer_set_update(ctx, region);
                } else {
                    ctx.outbox.push(AppearanceMessage::RebakeRequest {
                        avatar: self.avatar_id,
                        region,
                        texture_id,
                    });
                }
            }
        }
    }

    /// Switch `region` to the loaded bake `texture_id`.
    pub fn use_baked_texture(&mut self, region: BakedRegion, texture_id: Uuid) {
        let edit_mode = self.is_self && self.edit_mode;
        let slot = &mut self.baked[region.index()];
        if !slot.set_loaded(texture_id) {
            warn!("{} refusing placeholder {} as bake for {}", self.avatar_id, texture_id, region);
            return;
        }
        slot.set_upload_pending(false);
        if !edit_mode && slot.destroy_layer_set() {
            trace!("{} released {} layer set", self.avatar_id, region);
        }
        self.set_region_baked_ready(region, true);

        if !edit_mode {
            // Meshes pick the bake up right away; no intermediate frame.
            self.selections[region.index()] = RegionTexture::Baked(texture_id);
            self.baked[region.index()].set_used(true);
        }
        self.needs_update = true;
        info!("{} region {} now uses bake {}", self.avatar_id, region, texture_id);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Decide, per region, between local composite, current bake,
    /// last-known-good bake and the default placeholder.
    pub fn update_mesh_textures(&mut self, settings: &AppearanceSettings) -> [RegionTexture; BakedRegion::COUNT] {
        for region in BakedRegion::ALL {
            let selection = self.select_region_texture(settings, region);
            self.selections[region.index()] = selection;
            self.baked[region.index()].set_used(matches!(selection, RegionTexture::Baked(_)));
        }
        self.needs_update = false;
        self.selections
    }

    fn select_region_texture(&mut self, settings: &AppearanceSettings, region: BakedRegion) -> RegionTexture {
        let editing = self.is_self && self.edit_mode;
        if !editing {
            let slot = &mut self.baked[region.index()];
            if let Some(id) = slot.texture_id().filter(|_| slot.is_loaded()) {
                if slot.destroy_layer_set() {
                    trace!("{} released {} layer set", self.avatar_id, region);
                }
                self.set_region_baked_ready(region, true);
                return RegionTexture::Baked(id);
            }
            if let Some(good) = slot.last_good_id() {
                return RegionTexture::LastKnownGood(good);
            }
            if !self.region_has_local_image(region) {
                return RegionTexture::Default;
            }
        }

        self.set_region_baked_ready(region, false);
        let size = composite_size(settings, region);
        let layer_set = self.baked[region.index()].ensure_layer_set(size);
        if layer_set.update(&self.local) {
            trace!("{} recomposited {}", self.avatar_id, region);
        }
        RegionTexture::LocalComposite(layer_set.composite_id())
    }

    // =========================================================================
    // Self avatar: uploads and cache checks
    // =========================================================================

    pub fn set_edit_mode(&mut self, ctx: &mut AppearanceContext<'_>, editing: bool) {
        if !self.is_self || self.edit_mode == editing {
            return;
        }
        self.edit_mode = editing;
        self.needs_update = true;
        info!("{} appearance editing {}", self.avatar_id, if editing { "started" } else { "finished" });

        if !editing {
            for region in BakedRegion::ALL {
                if self.baked[region.index()].upload_pending() {
                    if let Err(e) = self.request_layer_set_upload(ctx, region) {
                        warn!("{} upload of {} failed: {}", self.avatar_id, region, e);
                    }
                }
            }
        }
    }

    /// Encode and upload the local composite of `region` to the bake cache.
    ///
    /// Returns `Ok(true)` if an upload went out; `Ok(false)` if the region is
    /// already baked or the upload was deferred (layers still loading,
    /// throttled, or editing in progress).
    pub fn request_layer_set_upload(&mut self, ctx: &mut AppearanceContext<'_>, region: BakedRegion) -> Result<bool, AppearanceError> {
        if !self.is_self {
            return Err(AppearanceError::NotOwner);
        }
        if self.baked[region.index()].is_loaded() {
            return Ok(false);
        }

        let hash = self.region_hash(region);
        let size = composite_size(ctx.settings, region);
        let slot = &mut self.baked[region.index()];
        slot.set_upload_pending(true);

        if self.edit_mode {
            return Ok(false);
        }
        if let Some(last) = slot.last_upload() {
            if ctx.now.saturating_duration_since(last) < ctx.settings.min_upload_interval {
                trace!("{} upload of {} throttled", self.avatar_id, region);
                return Ok(false);
            }
        }

        let layer_set = slot.ensure_layer_set(size);
        if !layer_set.is_fully_loaded(&self.local) {
            trace!("{} upload of {} waits for local textures", self.avatar_id, region);
            return Ok(false);
        }
        layer_set.update(&self.local);
        let encoded = layer_set.encode()?;

        info!("{} uploading {} bake {} ({} bytes)", self.avatar_id, region, hash, encoded.len());
        ctx.bake_cache.upload_bake(self.avatar_id, region, hash, encoded);
        slot.record_upload(ctx.now);
        Ok(true)
    }

    /// Upload finished (or failed). Stale results for outdated content are ignored.
    pub fn on_bake_uploaded(&mut self, ctx: &mut AppearanceContext<'_>, region: BakedRegion, hash: BakeHash, result: Result<Uuid, BakeError>) {
        if hash != self.region_hash(region) {
            debug!("{} ignoring upload result for outdated {} content {}", self.avatar_id, region, hash);
            return;
        }
        match result {
            Ok(texture_id) => {
                self.use_baked_texture(region, texture_id);
                ctx.outbox.push(AppearanceMessage::BakeUploaded { region, texture_id, hash });
            }
            Err(e) => {
                // Local compositing carries on; the next wearable change retries.
                warn!("{} bake upload for {} failed: {}", self.avatar_id, region, e);
                self.baked[region.index()].set_upload_pending(false);
                self.needs_update = true;
            }
        }
    }

    /// Ask the server which of our regions already have a cached bake.
    pub fn request_cache_check(&mut self, ctx: &mut AppearanceContext<'_>) {
        if !self.is_self {
            return;
        }
        for region in BakedRegion::ALL {
            let hash = self.region_hash(region);
            ctx.outbox.push(AppearanceMessage::CachedTextureRequest { region, hash });
            ctx.bake_cache.query_cached_bake(self.avatar_id, region, hash);
        }
        self.cache_check_sent_at = Some(ctx.now);
        debug!("{} sent bake cache check", self.avatar_id);
    }

    pub fn on_cached_texture_response(&mut self, ctx: &mut AppearanceContext<'_>, region: BakedRegion, hash: BakeHash, texture_id: Option<Uuid>) {
        if hash != self.region_hash(region) {
            trace!("{} stale cache response for {}", self.avatar_id, region);
            return;
        }
        match texture_id {
            Some(id) if !is_placeholder(&id) => self.on_baked_texture_arrived(ctx, region, id),
            _ => {
                debug!("{} cache miss for {}, baking locally", self.avatar_id, region);
                self.baked[region.index()].set_upload_pending(true);
                self.request_layer_set_update(ctx, region);
            }
        }
    }

    /// Per-frame housekeeping: deferred uploads and the cache check timeout.
    pub fn idle_update(&mut self, ctx: &mut AppearanceContext<'_>) {
        if !self.is_self {
            return;
        }

        if !self.edit_mode {
            for region in BakedRegion::ALL {
                let slot = &self.baked[region.index()];
                if !slot.upload_pending() || slot.is_loaded() {
                    continue;
                }
                if let Err(e) = self.request_layer_set_upload(ctx, region) {
                    warn!("{} upload of {} failed: {}", self.avatar_id, region, e);
                }
            }
        }

        let Some(sent_at) = self.cache_check_sent_at else {
            return;
        };
        let has_usable_bake = |slot: &BakedTextureSlot| slot.is_loaded() || slot.pending_fetch().is_some();
        if self.baked.iter().all(has_usable_bake) {
            return;
        }
        if ctx.now.saturating_duration_since(sent_at) >= ctx.settings.cache_check_timeout {
            warn!("{} no bake data after {:?}, re-sending cache check", self.avatar_id, ctx.settings.cache_check_timeout);
            self.request_cache_check(ctx);
        }
    }
}

fn composite_size(settings: &AppearanceSettings, region: BakedRegion) -> u32 {
    match region {
        BakedRegion::Eyes => settings.eyes_composite_size,
        _ => settings.composite_size,
    }
}
