use slv_appearance::assets::texture::solid_image;
use slv_appearance::assets::{
    AssetEvent, CompletionQueue, DiscardLevel, FetchEvent, FetchHandle, FetchStatus, FetchTarget, MemoryBakeCache,
    MemoryTextureStore,
};
use slv_appearance::config::AppearanceSettings;
use slv_appearance::world::avatar::{
    AppearanceContext, AvatarRegistry, BakedRegion, DrainStats, LayerParams, LocalTextureIndex, RegionTexture,
};
use slv_appearance::world::{AppearanceMessage, AvatarAppearanceEvent, BakedTextureEntry, WearablesChangedEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Registry plus in-memory services, drained by hand like the frame loop does.
struct Harness {
    settings: AppearanceSettings,
    queue: CompletionQueue,
    store: MemoryTextureStore,
    cache: MemoryBakeCache,
    outbox: Vec<AppearanceMessage>,
    registry: AvatarRegistry,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        let queue = CompletionQueue::new();
        Self {
            settings: AppearanceSettings::default(),
            store: MemoryTextureStore::new(queue.sender()),
            cache: MemoryBakeCache::new(queue.sender()),
            queue,
            outbox: Vec::new(),
            registry: AvatarRegistry::new(),
            now: Instant::now(),
        }
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut AvatarRegistry, &mut AppearanceContext<'_>) -> R) -> R {
        let mut ctx = AppearanceContext {
            fetcher: &mut self.store,
            bake_cache: &mut self.cache,
            outbox: &mut self.outbox,
            settings: &self.settings,
            now: self.now,
        };
        f(&mut self.registry, &mut ctx)
    }

    fn drain(&mut self) -> DrainStats {
        let mut ctx = AppearanceContext {
            fetcher: &mut self.store,
            bake_cache: &mut self.cache,
            outbox: &mut self.outbox,
            settings: &self.settings,
            now: self.now,
        };
        self.registry.drain_completions(&mut ctx, &self.queue, 1024)
    }

    fn apply(&mut self, avatar: Uuid, region: BakedRegion, texture: Uuid) {
        let event = AvatarAppearanceEvent::new(avatar, vec![(region, BakedTextureEntry::Baked(texture))]);
        self.with(|registry, ctx| registry.on_appearance(ctx, &event)).unwrap();
    }

    fn update(&mut self, avatar: Uuid) -> [RegionTexture; BakedRegion::COUNT] {
        let settings = self.settings.clone();
        self.registry.get_mut(&avatar).unwrap().appearance.update_mesh_textures(&settings)
    }

    fn selection(&self, avatar: Uuid, region: BakedRegion) -> RegionTexture {
        self.registry.get(&avatar).unwrap().appearance.selection(region)
    }
}

fn texture(store: &mut MemoryTextureStore) -> Uuid {
    let id = Uuid::new_v4();
    store.insert(id, solid_image(64, [180, 90, 40, 255]));
    id
}

#[test]
fn test_fresh_avatar_shows_default_everywhere() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);

    let selections = h.update(id);
    assert!(selections.iter().all(|s| *s == RegionTexture::Default));
    assert!(h.registry.get(&id).unwrap().appearance.is_grey());
    assert!(selections.iter().all(|s| s.texture_id() == slv_appearance::assets::DEFAULT_AVATAR_TEXTURE));
}

#[test]
fn test_self_composite_then_uploaded_bake() {
    let mut h = Harness::new();
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);
    let shirt = texture(&mut h.store);

    let wearables = WearablesChangedEvent::new(vec![(LocalTextureIndex::UpperShirt, Some(shirt))]);
    h.with(|registry, ctx| registry.on_wearables_changed(ctx, &wearables)).unwrap();

    // Local layers arrive; the composite goes on screen and an upload goes out.
    h.drain();
    let selections = h.update(me);
    assert!(matches!(selections[BakedRegion::UpperBody.index()], RegionTexture::LocalComposite(_)));
    assert_eq!(selections[BakedRegion::Head.index()], RegionTexture::Default);
    assert_eq!(h.cache.uploads().len(), 1);
    assert_eq!(h.cache.uploads()[0].1, BakedRegion::UpperBody);

    // The upload completes and the meshes switch to it without another update call.
    h.drain();
    let RegionTexture::Baked(baked) = h.selection(me, BakedRegion::UpperBody) else {
        panic!("upper body should show the uploaded bake");
    };
    assert!(h.outbox.iter().any(|m| matches!(
        m,
        AppearanceMessage::BakeUploaded { region: BakedRegion::UpperBody, texture_id, .. } if *texture_id == baked
    )));
    assert!(h.registry.get(&me).unwrap().appearance.baked_slot(BakedRegion::UpperBody).layer_set().is_none());
}

#[test]
fn test_previous_bake_kept_until_new_one_loads() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let a = texture(&mut h.store);
    let b = texture(&mut h.store);

    h.apply(id, BakedRegion::UpperBody, a);
    h.drain();
    assert_eq!(h.selection(id, BakedRegion::UpperBody), RegionTexture::Baked(a));

    h.store.set_deferred(true);
    h.apply(id, BakedRegion::UpperBody, b);
    for _ in 0..3 {
        h.drain();
        let selections = h.update(id);
        assert_eq!(selections[BakedRegion::UpperBody.index()], RegionTexture::LastKnownGood(a));
    }

    h.store.flush_id(&b);
    h.drain();
    assert_eq!(h.selection(id, BakedRegion::UpperBody), RegionTexture::Baked(b));
    assert_eq!(h.update(id)[BakedRegion::UpperBody.index()], RegionTexture::Baked(b));
}

#[test]
fn test_superseded_bake_result_is_dropped() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let a = texture(&mut h.store);
    let b = texture(&mut h.store);

    h.store.set_deferred(true);
    h.apply(id, BakedRegion::Head, a);
    h.apply(id, BakedRegion::Head, b);
    h.store.flush_id(&a);
    h.drain();
    assert_ne!(h.selection(id, BakedRegion::Head), RegionTexture::Baked(a));

    h.store.flush_id(&b);
    h.drain();
    assert_eq!(h.selection(id, BakedRegion::Head), RegionTexture::Baked(b));
}

#[test]
fn test_loaded_bake_is_not_refetched() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let a = texture(&mut h.store);

    h.apply(id, BakedRegion::Hair, a);
    h.drain();
    h.apply(id, BakedRegion::Hair, a);
    h.drain();
    assert_eq!(h.store.requests_for(&a), 1);

    // A bake adopted directly is treated the same when the simulator echoes it.
    let c = texture(&mut h.store);
    h.registry.get_mut(&id).unwrap().appearance.use_baked_texture(BakedRegion::Eyes, c);
    h.apply(id, BakedRegion::Eyes, c);
    assert_eq!(h.store.requests_for(&c), 0);
    assert_eq!(h.selection(id, BakedRegion::Eyes), RegionTexture::Baked(c));
}

#[test]
fn test_missing_bake_requests_rebake_for_others() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let gone = Uuid::new_v4();

    h.apply(id, BakedRegion::LowerBody, gone);
    h.drain();
    assert_eq!(
        h.outbox,
        vec![AppearanceMessage::RebakeRequest { avatar: id, region: BakedRegion::LowerBody, texture_id: gone }]
    );
    assert_eq!(h.update(id)[BakedRegion::LowerBody.index()], RegionTexture::Default);
}

#[test]
fn test_not_baked_entry_clears_region() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let a = texture(&mut h.store);
    h.apply(id, BakedRegion::Skirt, a);
    h.drain();

    let event = AvatarAppearanceEvent::new(id, vec![(BakedRegion::Skirt, BakedTextureEntry::NotBaked)]);
    h.with(|registry, ctx| registry.on_appearance(ctx, &event)).unwrap();
    let slot = h.registry.get(&id).unwrap().appearance.baked_slot(BakedRegion::Skirt);
    assert!(!slot.is_loaded());
    assert_eq!(slot.texture_id(), None);
}

#[test]
fn test_update_mesh_textures_is_idempotent() {
    let mut h = Harness::new();
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);
    h.cache.set_reject_uploads(Some("over quota".into()));
    let shirt = texture(&mut h.store);
    let wearables = WearablesChangedEvent::new(vec![(LocalTextureIndex::UpperShirt, Some(shirt))]);
    h.with(|registry, ctx| registry.on_wearables_changed(ctx, &wearables)).unwrap();
    h.drain();
    h.drain();

    let first = h.update(me);
    let generation = |h: &Harness| {
        h.registry
            .get(&me)
            .unwrap()
            .appearance
            .baked_slot(BakedRegion::UpperBody)
            .layer_set()
            .map(|set| set.generation())
    };
    let generation_before = generation(&h);
    let second = h.update(me);
    assert_eq!(first, second);
    assert_eq!(generation(&h), generation_before);
    assert!(matches!(second[BakedRegion::UpperBody.index()], RegionTexture::LocalComposite(_)));
}

#[test]
fn test_local_detail_frozen_once_baked() {
    let mut h = Harness::new();
    let id = Uuid::new_v4();
    h.registry.add(id, false, &h.settings);
    let shirt = texture(&mut h.store);
    h.with(|registry, ctx| {
        registry
            .get_mut(&id)
            .unwrap()
            .appearance
            .set_local_texture(ctx, LocalTextureIndex::UpperShirt, Some(shirt))
    });
    h.drain();
    let min_discard = DiscardLevel::new(h.settings.others_min_discard);
    let discard = |h: &Harness| h.registry.get(&id).unwrap().appearance.local_slot(LocalTextureIndex::UpperShirt).discard();
    assert_eq!(discard(&h), min_discard);

    let bake = texture(&mut h.store);
    h.apply(id, BakedRegion::UpperBody, bake);
    h.drain();
    assert!(h.registry.get(&id).unwrap().appearance.local_slot(LocalTextureIndex::UpperShirt).is_baked_ready());

    let late = FetchEvent {
        handle: FetchHandle(9999),
        image_id: shirt,
        target: FetchTarget::LocalTexture { avatar: id, index: LocalTextureIndex::UpperShirt },
        discard: DiscardLevel::FULL,
        image: Some(Arc::new(solid_image(64, [0, 0, 0, 255]))),
        status: FetchStatus::Final,
    };
    h.queue.sender().send(AssetEvent::Fetch(late)).unwrap();
    h.drain();
    assert_eq!(discard(&h), min_discard);
}

#[test]
fn test_cache_check_resent_after_timeout() {
    let mut h = Harness::new();
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);

    h.with(|registry, ctx| registry.self_avatar_mut().unwrap().appearance.request_cache_check(ctx));
    assert_eq!(h.cache.query_count(), BakedRegion::COUNT);
    assert_eq!(h.outbox.len(), BakedRegion::COUNT);

    let start = h.now;
    h.now = start + Duration::from_secs(5);
    h.with(|registry, ctx| registry.idle_update(ctx));
    assert_eq!(h.cache.query_count(), BakedRegion::COUNT);

    h.now = start + h.settings.cache_check_timeout + Duration::from_secs(1);
    h.with(|registry, ctx| registry.idle_update(ctx));
    assert_eq!(h.cache.query_count(), 2 * BakedRegion::COUNT);
    assert!(h.outbox.iter().all(|m| matches!(m, AppearanceMessage::CachedTextureRequest { .. })));
}

#[test]
fn test_cached_bake_hit_is_fetched() {
    let mut h = Harness::new();
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);
    let cached = texture(&mut h.store);
    let hash = h.registry.get(&me).unwrap().appearance.region_hash(BakedRegion::Head);
    h.cache.insert(hash, cached);

    h.with(|registry, ctx| registry.self_avatar_mut().unwrap().appearance.request_cache_check(ctx));
    h.drain();
    h.drain();
    assert_eq!(h.selection(me, BakedRegion::Head), RegionTexture::Baked(cached));
    assert_eq!(h.store.requests_for(&cached), 1);
}

#[test]
fn test_only_self_uploads() {
    let mut h = Harness::new();
    let other = Uuid::new_v4();
    h.registry.add(other, false, &h.settings);
    let result = h.with(|registry, ctx| {
        registry
            .get_mut(&other)
            .unwrap()
            .appearance
            .request_layer_set_upload(ctx, BakedRegion::Head)
    });
    assert!(matches!(result, Err(slv_appearance::world::avatar::AppearanceError::NotOwner)));
}

#[test]
fn test_failed_upload_waits_for_wearable_change() {
    let mut h = Harness::new();
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);
    h.cache.set_reject_uploads(Some("over quota".into()));
    let shirt = texture(&mut h.store);
    let wearables = WearablesChangedEvent::new(vec![(LocalTextureIndex::UpperShirt, Some(shirt))]);
    h.with(|registry, ctx| registry.on_wearables_changed(ctx, &wearables)).unwrap();
    h.drain();
    h.drain();
    assert_eq!(h.cache.uploads().len(), 1);

    // No timer retry, however long we wait.
    h.now += h.settings.min_upload_interval + Duration::from_secs(1);
    h.with(|registry, ctx| registry.idle_update(ctx));
    assert_eq!(h.cache.uploads().len(), 1);
    assert!(matches!(h.selection(me, BakedRegion::UpperBody), RegionTexture::LocalComposite(_)));

    h.cache.set_reject_uploads(None);
    let new_shirt = texture(&mut h.store);
    let wearables = WearablesChangedEvent::new(vec![(LocalTextureIndex::UpperShirt, Some(new_shirt))]);
    h.with(|registry, ctx| registry.on_wearables_changed(ctx, &wearables)).unwrap();
    h.drain();
    assert_eq!(h.cache.uploads().len(), 2);
}

/// Self avatar wearing one shirt whose bake has been uploaded and shown.
fn baked_self(h: &mut Harness) -> (Uuid, Uuid) {
    let me = Uuid::new_v4();
    h.registry.add(me, true, &h.settings);
    let shirt = texture(&mut h.store);
    let wearables = WearablesChangedEvent::new(vec![(LocalTextureIndex::UpperShirt, Some(shirt))]);
    h.with(|registry, ctx| registry.on_wearables_changed(ctx, &wearables)).unwrap();
    h.drain();
    h.drain();
    h.update(me);
    let RegionTexture::Baked(bake) = h.selection(me, BakedRegion::UpperBody) else {
        panic!("upper body not baked: {:?}", h.selection(me, BakedRegion::UpperBody));
    };
    (me, bake)
}

fn set_editing(h: &mut Harness, avatar: Uuid, editing: bool) {
    h.with(|registry, ctx| registry.get_mut(&avatar).unwrap().appearance.set_edit_mode(ctx, editing));
}

#[test]
fn test_layer_edits_are_uploaded_after_editing() {
    let mut h = Harness::new();
    let (me, first_bake) = baked_self(&mut h);
    assert_eq!(h.cache.uploads().len(), 1);

    set_editing(&mut h, me, true);
    assert!(matches!(h.update(me)[BakedRegion::UpperBody.index()], RegionTexture::LocalComposite(_)));
    let settings = h.settings.clone();
    let tint = LayerParams { tint: [0.4, 0.6, 1.0, 1.0] };
    h.registry
        .get_mut(&me)
        .unwrap()
        .appearance
        .set_layer_params(&settings, LocalTextureIndex::UpperShirt, tint);

    h.now += Duration::from_secs(60);
    set_editing(&mut h, me, false);
    assert_eq!(h.cache.uploads().len(), 2);
    h.drain();
    h.update(me);

    let selection = h.selection(me, BakedRegion::UpperBody);
    assert!(matches!(selection, RegionTexture::Baked(id) if id != first_bake), "got {:?}", selection);
    assert!(h
        .outbox
        .iter()
        .any(|m| matches!(m, AppearanceMessage::BakeUploaded { region: BakedRegion::UpperBody, .. })));
}

#[test]
fn test_leaving_edit_mode_releases_layer_set() {
    let mut h = Harness::new();
    let (me, bake) = baked_self(&mut h);

    set_editing(&mut h, me, true);
    h.update(me);
    let appearance = &h.registry.get(&me).unwrap().appearance;
    assert!(appearance.baked_slot(BakedRegion::UpperBody).layer_set().is_some());
    assert!(!appearance.local_slot(LocalTextureIndex::UpperShirt).is_baked_ready());

    set_editing(&mut h, me, false);
    assert_eq!(h.update(me)[BakedRegion::UpperBody.index()], RegionTexture::Baked(bake));
    let appearance = &h.registry.get(&me).unwrap().appearance;
    assert!(appearance.baked_slot(BakedRegion::UpperBody).layer_set().is_none());
    assert!(appearance.local_slot(LocalTextureIndex::UpperShirt).is_baked_ready());
    assert_eq!(h.cache.uploads().len(), 1);
}
