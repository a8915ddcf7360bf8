//! The frame loop that ties appearance, culling, LOD and impostors together.
//!
//! Everything here runs on the frame thread. Asset workers only ever talk to
//! the session through the completion queue, which is drained at a fixed point
//! in each frame.

use crate::assets::bake_cache::BakeCacheService;
use crate::assets::fetch::{AssetEvent, CompletionQueue, TextureFetchService};
use crate::assets::texture::DEFAULT_TEXTURE;
use crate::config::ViewerSettings;
use crate::rendering::backend::{DrawCommand, RenderBackend};
use crate::rendering::budget::FrameBudget;
use crate::rendering::camera::Camera;
use crate::rendering::impostor::{AvatarView, ImpostorScheduler};
use crate::rendering::lod::{AvatarLodState, LodSelector};
use crate::rendering::occlusion::OcclusionCuller;
use crate::rendering::spatial::{CullResult, OctreeError, PartitionType, SpatialPartition};
use crate::world::avatar::{AppearanceContext, AppearanceError, AvatarRegistry, DrainStats};
use crate::world::events::{AppearanceMessage, AvatarAppearanceEvent, ObjectKillEvent, ObjectUpdateEvent, WearablesChangedEvent};
use crate::world::object::{ObjectKind, Renderable, SceneObject};
use crate::world::skeleton::SkeletonDefinition;
use crossbeam_channel::Sender;
use glam::Vec3;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Spatial partition error: {0}")]
    Octree(#[from] OctreeError),

    #[error("Appearance error: {0}")]
    Appearance(#[from] AppearanceError),

    #[error("Avatar {0} is not registered")]
    UnknownAvatar(Uuid),
}

/// Outcome of one [`WorldSession::frame`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame: u64,
    pub drain: DrainStats,
    pub budget: FrameBudget,
    pub visible_avatars: Vec<Uuid>,
    pub visible_objects: Vec<Uuid>,
}

/// One region's worth of avatars, objects and the partitions that cull them.
pub struct WorldSession {
    settings: ViewerSettings,
    avatars: AvatarRegistry,
    objects: HashMap<Uuid, SceneObject>,
    partitions: BTreeMap<PartitionType, SpatialPartition>,
    needs_consolidate: BTreeSet<PartitionType>,
    skeleton: Arc<SkeletonDefinition>,
    completions: CompletionQueue,
    culler: OcclusionCuller,
    lod: LodSelector,
    lod_states: HashMap<Uuid, AvatarLodState>,
    impostors: ImpostorScheduler,
    budget: FrameBudget,
    outbox: Vec<AppearanceMessage>,
    frame: u64,
}

impl WorldSession {
    pub fn new(settings: ViewerSettings, backend: &dyn RenderBackend, center: Vec3) -> Self {
        let partitions = PartitionType::ALL
            .iter()
            .map(|&kind| (kind, SpatialPartition::new(kind, settings.octree.clone(), center)))
            .collect();
        info!("World session created ({:?} profile)", settings.profile);
        Self {
            culler: OcclusionCuller::new(&settings.occlusion, backend),
            lod: LodSelector::new(settings.lod.clone()),
            impostors: ImpostorScheduler::new(settings.impostor.clone()),
            settings,
            avatars: AvatarRegistry::new(),
            objects: HashMap::new(),
            partitions,
            needs_consolidate: BTreeSet::new(),
            skeleton: Arc::new(SkeletonDefinition::default()),
            completions: CompletionQueue::new(),
            lod_states: HashMap::new(),
            budget: FrameBudget::default(),
            outbox: Vec::new(),
            frame: 0,
        }
    }

    pub fn with_skeleton(mut self, skeleton: Arc<SkeletonDefinition>) -> Self {
        self.skeleton = skeleton;
        self
    }

    pub fn settings(&self) -> &ViewerSettings {
        &self.settings
    }

    pub fn avatars(&self) -> &AvatarRegistry {
        &self.avatars
    }

    pub fn avatars_mut(&mut self) -> &mut AvatarRegistry {
        &mut self.avatars
    }

    pub fn objects(&self) -> &HashMap<Uuid, SceneObject> {
        &self.objects
    }

    pub fn partition(&self, kind: PartitionType) -> Option<&SpatialPartition> {
        self.partitions.get(&kind)
    }

    pub fn skeleton(&self) -> &SkeletonDefinition {
        &self.skeleton
    }

    pub fn lod_state(&self, avatar: &Uuid) -> Option<&AvatarLodState> {
        self.lod_states.get(avatar)
    }

    pub fn impostors(&self) -> &ImpostorScheduler {
        &self.impostors
    }

    pub fn occlusion(&self) -> &OcclusionCuller {
        &self.culler
    }

    pub fn budget(&self) -> &FrameBudget {
        &self.budget
    }

    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// Sender handed to fetch and bake workers.
    pub fn completion_sender(&self) -> Sender<AssetEvent> {
        self.completions.sender()
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    /// Messages queued for the simulator since the last call.
    pub fn take_outbox(&mut self) -> Vec<AppearanceMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn partition_mut(&mut self, kind: PartitionType) -> &mut SpatialPartition {
        let settings = &self.settings.octree;
        self.partitions
            .entry(kind)
            .or_insert_with(|| SpatialPartition::new(kind, settings.clone(), Vec3::ZERO))
    }

    // =========================================================================
    // Avatars
    // =========================================================================

    pub fn add_avatar(&mut self, id: Uuid, is_self: bool, position: Vec3) -> Result<(), SessionError> {
        let avatar = self.avatars.add(id, is_self, &self.settings.appearance);
        avatar.position = position;
        let bounds = avatar.bounds();
        self.partition_mut(PartitionType::Avatar).upsert(id, bounds)?;
        Ok(())
    }

    /// Forget an avatar. Completions still queued for it are dropped on drain.
    pub fn remove_avatar(&mut self, id: &Uuid) -> Result<(), SessionError> {
        self.avatars.remove(id).ok_or(SessionError::UnknownAvatar(*id))?;
        self.lod_states.remove(id);
        self.impostors.forget(id);
        match self.partition_mut(PartitionType::Avatar).remove(id) {
            Ok(_) => {
                self.needs_consolidate.insert(PartitionType::Avatar);
            }
            Err(OctreeError::UnknownElement(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn move_avatar(&mut self, id: &Uuid, position: Vec3) -> Result<(), SessionError> {
        let avatar = self.avatars.get_mut(id).ok_or(SessionError::UnknownAvatar(*id))?;
        avatar.position = position;
        let bounds = avatar.bounds();
        self.partition_mut(PartitionType::Avatar).upsert(*id, bounds)?;
        Ok(())
    }

    pub fn set_muted(&mut self, id: &Uuid, muted: bool) -> Result<(), SessionError> {
        let avatar = self.avatars.get_mut(id).ok_or(SessionError::UnknownAvatar(*id))?;
        avatar.muted = muted;
        Ok(())
    }

    pub fn set_first_person(&mut self, first_person: bool) {
        if let Some(avatar) = self.avatars.self_avatar_mut() {
            avatar.first_person = first_person;
        }
    }

    pub fn on_appearance(
        &mut self,
        fetcher: &mut dyn TextureFetchService,
        bake_cache: &mut dyn BakeCacheService,
        event: &AvatarAppearanceEvent,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut ctx = AppearanceContext {
            fetcher,
            bake_cache,
            outbox: &mut self.outbox,
            settings: &self.settings.appearance,
            now,
        };
        self.avatars.on_appearance(&mut ctx, event)?;
        Ok(())
    }

    pub fn on_wearables_changed(
        &mut self,
        fetcher: &mut dyn TextureFetchService,
        bake_cache: &mut dyn BakeCacheService,
        event: &WearablesChangedEvent,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut ctx = AppearanceContext {
            fetcher,
            bake_cache,
            outbox: &mut self.outbox,
            settings: &self.settings.appearance,
            now,
        };
        self.avatars.on_wearables_changed(&mut ctx, event)?;
        Ok(())
    }

    /// Ask the simulator for cached bakes of our own outfit.
    pub fn request_cache_check(
        &mut self,
        fetcher: &mut dyn TextureFetchService,
        bake_cache: &mut dyn BakeCacheService,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut ctx = AppearanceContext {
            fetcher,
            bake_cache,
            outbox: &mut self.outbox,
            settings: &self.settings.appearance,
            now,
        };
        let avatar = self.avatars.self_avatar_mut().ok_or(AppearanceError::NotOwner)?;
        avatar.appearance.request_cache_check(&mut ctx);
        Ok(())
    }

    pub fn set_edit_mode(
        &mut self,
        fetcher: &mut dyn TextureFetchService,
        bake_cache: &mut dyn BakeCacheService,
        editing: bool,
        now: Instant,
    ) -> Result<(), SessionError> {
        let mut ctx = AppearanceContext {
            fetcher,
            bake_cache,
            outbox: &mut self.outbox,
            settings: &self.settings.appearance,
            now,
        };
        let avatar = self.avatars.self_avatar_mut().ok_or(AppearanceError::NotOwner)?;
        avatar.appearance.set_edit_mode(&mut ctx, editing);
        Ok(())
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub fn on_object_update(&mut self, event: &ObjectUpdateEvent) -> Result<(), SessionError> {
        if event.kind == ObjectKind::Avatar {
            if self.avatars.get(&event.object_id).is_some() {
                return self.move_avatar(&event.object_id, event.position);
            }
            if let Some(object) = self.objects.remove(&event.object_id) {
                debug!("Object {} changed from {:?} to an avatar", object.id, object.kind);
                let previous = object.kind.partition();
                self.partition_mut(previous).remove(&object.id)?;
                self.needs_consolidate.insert(previous);
            }
            return self.add_avatar(event.object_id, false, event.position);
        }
        if self.avatars.get(&event.object_id).is_some() {
            debug!("Avatar {} changed to {:?}", event.object_id, event.kind);
            self.remove_avatar(&event.object_id)?;
        }

        let previous_kind = self.objects.get(&event.object_id).map(|o| o.kind);
        if let Some(previous) = previous_kind.filter(|&kind| kind != event.kind) {
            debug!("Object {} changed from {:?} to {:?}", event.object_id, previous, event.kind);
            self.partition_mut(previous.partition()).remove(&event.object_id)?;
            self.needs_consolidate.insert(previous.partition());
        }

        let object = self
            .objects
            .entry(event.object_id)
            .and_modify(|object| object.apply_update(event))
            .or_insert_with(|| SceneObject::from(event));
        let (id, bounds, kind) = (object.id(), object.bounds(), object.kind());
        self.partition_mut(kind.partition()).upsert(id, bounds)?;
        trace!("Object {} at {}", id, bounds);
        Ok(())
    }

    pub fn on_object_kill(&mut self, event: &ObjectKillEvent) -> Result<(), SessionError> {
        if self.avatars.get(&event.object_id).is_some() {
            return self.remove_avatar(&event.object_id);
        }
        let Some(object) = self.objects.remove(&event.object_id) else {
            debug!("Kill for unknown object {}", event.object_id);
            return Ok(());
        };
        let kind = object.kind.partition();
        self.partition_mut(kind).remove(&object.id)?;
        self.needs_consolidate.insert(kind);
        Ok(())
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Run one frame: apply completions, cull, choose detail, and issue draws.
    pub fn frame(
        &mut self,
        camera: &Camera,
        fetcher: &mut dyn TextureFetchService,
        bake_cache: &mut dyn BakeCacheService,
        backend: &mut dyn RenderBackend,
        now: Instant,
    ) -> FrameReport {
        self.frame += 1;
        let frame = self.frame;
        self.budget.begin_frame(frame);

        for kind in std::mem::take(&mut self.needs_consolidate) {
            if let Some(partition) = self.partitions.get_mut(&kind) {
                let freed = partition.consolidate();
                if freed > 0 {
                    trace!("{:?} consolidated, {} nodes freed", kind, freed);
                }
            }
        }
        for partition in self.partitions.values_mut() {
            self.culler.drain_orphans(partition.octree_mut(), backend);
            if cfg!(debug_assertions) {
                partition.octree().validate();
            }
        }

        // Appearance: completions first, then housekeeping.
        let drain = {
            let mut ctx = AppearanceContext {
                fetcher,
                bake_cache,
                outbox: &mut self.outbox,
                settings: &self.settings.appearance,
                now,
            };
            let drain = self
                .avatars
                .drain_completions(&mut ctx, &self.completions, self.settings.fetch.max_completions_per_frame);
            self.avatars.idle_update(&mut ctx);
            drain
        };
        if drain.dropped > 0 {
            debug!("Frame {}: {} completions for departed avatars dropped", frame, drain.dropped);
        }

        let culled = self.cull_partitions(camera, backend, frame);

        let views = self.rank_visible_avatars(camera, culled.get(&PartitionType::Avatar));
        self.budget.set_visible_avatars(views.len());
        self.budget.finalize();

        self.select_avatar_lods(camera, &views);
        let decisions = self.impostors.schedule(&views, camera, backend, &mut self.budget, frame);

        for decision in &decisions {
            if let Some(billboard) = decision.billboard {
                backend.draw(DrawCommand::Impostor { avatar: decision.id, billboard });
                self.budget.record_draw();
            } else {
                self.draw_avatar(&decision.id, backend);
            }
        }

        let mut visible_objects = Vec::new();
        for (kind, result) in &culled {
            if *kind == PartitionType::Avatar {
                continue;
            }
            for id in &result.visible_elements {
                let Some(object) = self.objects.get(id) else {
                    continue;
                };
                let detail = self.lod.volume_detail(object.radius(), camera.distance_to(object.center()));
                backend.draw(DrawCommand::Object { object: *id, detail });
                self.budget.record_draw();
                visible_objects.push(*id);
            }
        }

        self.budget.log_summary();
        FrameReport {
            frame,
            drain,
            budget: self.budget.clone(),
            visible_avatars: views.iter().map(|v| v.id).collect(),
            visible_objects,
        }
    }

    fn cull_partitions(&mut self, camera: &Camera, backend: &mut dyn RenderBackend, frame: u64) -> BTreeMap<PartitionType, CullResult> {
        let mut results = BTreeMap::new();
        let mut rebuild_budget = self.settings.octree.geometry_rebuild_budget;
        for (&kind, partition) in self.partitions.iter_mut() {
            if partition.is_empty() {
                continue;
            }
            let result = partition.cull(camera, &mut self.culler, backend, &mut self.budget, frame);
            let rebuilt = partition.rebuild_geometry(rebuild_budget);
            rebuild_budget = rebuild_budget.saturating_sub(rebuilt.len());
            self.budget.record_geometry_rebuilds(rebuilt.len());
            results.insert(kind, result);
        }
        results
    }

    /// Visible avatars, own avatar first, then by projected area.
    fn rank_visible_avatars(&self, camera: &Camera, culled: Option<&CullResult>) -> Vec<AvatarView> {
        let Some(culled) = culled else {
            return Vec::new();
        };
        let mut views: Vec<AvatarView> = culled
            .visible_elements
            .iter()
            .filter_map(|id| self.avatars.get(id))
            .map(|avatar| {
                let bounds = avatar.bounds();
                let distance = camera.distance_to(bounds.center());
                AvatarView {
                    id: avatar.id(),
                    is_self: avatar.is_self(),
                    muted: avatar.muted,
                    rank: 0,
                    pixel_area: self.lod.raw_pixel_area(camera, bounds.radius(), distance),
                    distance,
                    bounds,
                }
            })
            .collect();
        views.sort_by(|a, b| b.is_self.cmp(&a.is_self).then(b.pixel_area.total_cmp(&a.pixel_area)));
        for (rank, view) in views.iter_mut().enumerate() {
            view.rank = rank;
        }
        views
    }

    fn select_avatar_lods(&mut self, camera: &Camera, views: &[AvatarView]) {
        let mut changes = 0;
        for view in views {
            let full_detail = view.is_self
                && self
                    .avatars
                    .get(&view.id)
                    .is_some_and(|a| a.first_person || a.appearance.is_edit_mode());
            let area = self
                .lod
                .avatar_pixel_area(camera, view.bounds.radius(), view.distance, full_detail, &self.budget);
            let state = self.lod_states.entry(view.id).or_default();
            changes += self.lod.update_avatar(&self.skeleton, state, area);
        }
        self.budget.record_lod_changes(changes);
    }

    fn draw_avatar(&mut self, id: &Uuid, backend: &mut dyn RenderBackend) {
        let (Some(avatar), Some(state)) = (self.avatars.get(id), self.lod_states.get(id)) else {
            warn!("Avatar {} visible without LOD state", id);
            return;
        };
        for (mesh, lod) in state.selected_meshes(&self.skeleton) {
            let texture = lod
                .mesh
                .region
                .or(mesh.region)
                .map_or(DEFAULT_TEXTURE, |region| avatar.appearance.selection(region).texture_id());
            backend.draw(DrawCommand::AvatarMesh {
                avatar: *id,
                mesh: lod.mesh.name.clone(),
                texture,
            });
            self.budget.record_draw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::bake_cache::MemoryBakeCache;
    use crate::assets::fetch::MemoryTextureStore;
    use crate::rendering::backend::RecordingBackend;
    use crate::rendering::camera::CameraSlot;
    use crate::world::avatar::RegionTexture;

    fn camera() -> Camera {
        Camera::new(CameraSlot::WORLD, Vec3::new(0.0, 0.0, 1.5), Vec3::new(10.0, 0.0, 1.5), 60f32.to_radians(), (800, 600))
    }

    #[test]
    fn test_fresh_avatar_draws_default_texture() {
        let mut backend = RecordingBackend::without_queries();
        let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
        let mut store = MemoryTextureStore::new(session.completion_sender());
        let mut cache = MemoryBakeCache::new(session.completion_sender());
        let id = Uuid::new_v4();
        session.add_avatar(id, false, Vec3::new(8.0, 0.0, 1.0)).unwrap();

        backend.begin_frame(1);
        let report = session.frame(&camera(), &mut store, &mut cache, &mut backend, Instant::now());
        assert_eq!(report.visible_avatars, vec![id]);
        assert!(session.avatars().get(&id).unwrap().appearance.selections().iter().all(|s| *s == RegionTexture::Default));
        assert!(backend.draws().iter().any(|d| matches!(d, DrawCommand::AvatarMesh { avatar, .. } if *avatar == id)));
    }

    #[test]
    fn test_object_lifecycle() {
        let backend = RecordingBackend::without_queries();
        let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
        let id = Uuid::new_v4();
        let update = ObjectUpdateEvent::new(id, ObjectKind::Volume, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        session.on_object_update(&update).unwrap();
        assert!(session.partition(PartitionType::Volume).unwrap().contains(&id));

        let update = ObjectUpdateEvent::new(id, ObjectKind::Tree, Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        session.on_object_update(&update).unwrap();
        assert!(!session.partition(PartitionType::Volume).unwrap().contains(&id));
        assert!(session.partition(PartitionType::Tree).unwrap().contains(&id));

        session
            .on_object_kill(&ObjectKillEvent { object_id: id, timestamp: std::time::SystemTime::now() })
            .unwrap();
        assert!(session.objects().is_empty());
        assert!(session.partition(PartitionType::Tree).unwrap().is_empty());
    }

    #[test]
    fn test_object_turning_into_avatar_is_tracked_once() {
        let backend = RecordingBackend::without_queries();
        let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
        let id = Uuid::new_v4();
        let position = Vec3::new(6.0, 0.0, 1.0);
        session.on_object_update(&ObjectUpdateEvent::new(id, ObjectKind::Volume, position, Vec3::ONE)).unwrap();

        session.on_object_update(&ObjectUpdateEvent::new(id, ObjectKind::Avatar, position, Vec3::ONE)).unwrap();
        assert!(session.objects().is_empty());
        assert!(!session.partition(PartitionType::Volume).unwrap().contains(&id));
        assert!(session.partition(PartitionType::Avatar).unwrap().contains(&id));
        assert!(session.avatars().get(&id).is_some());

        session.on_object_update(&ObjectUpdateEvent::new(id, ObjectKind::Volume, position, Vec3::ONE)).unwrap();
        assert!(session.avatars().get(&id).is_none());
        assert!(!session.partition(PartitionType::Avatar).unwrap().contains(&id));
        assert!(session.partition(PartitionType::Volume).unwrap().contains(&id));
        assert_eq!(session.objects().len(), 1);
    }

    #[test]
    fn test_remove_unknown_avatar() {
        let backend = RecordingBackend::without_queries();
        let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
        assert!(matches!(session.remove_avatar(&Uuid::new_v4()), Err(SessionError::UnknownAvatar(_))));
    }
}
