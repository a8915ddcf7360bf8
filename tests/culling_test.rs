use glam::Vec3;
use slv_appearance::assets::{MemoryBakeCache, MemoryTextureStore};
use slv_appearance::config::{ImpostorSettings, OctreeSettings, ViewerSettings};
use slv_appearance::rendering::{
    AvatarView, Camera, CameraSlot, FrameBudget, ImpostorScheduler, Octree, RecordingBackend,
};
use slv_appearance::utils::Aabb;
use slv_appearance::world::{ObjectKind, ObjectUpdateEvent, WorldSession};
use std::time::Instant;
use uuid::Uuid;

fn camera_at(origin: Vec3, target: Vec3) -> Camera {
    Camera::new(CameraSlot::WORLD, origin, target, 60f32.to_radians(), (800, 600))
}

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32) / (u32::MAX >> 1) as f32
    }

    fn range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next()
    }
}

#[test]
fn test_oversized_element_stays_at_its_level() {
    let settings = OctreeSettings { max_capacity: 1, ..OctreeSettings::default() };
    let mut octree = Octree::new(settings, Vec3::ZERO);

    let small = Uuid::new_v4();
    octree.insert(small, Aabb::from_center_half_extents(Vec3::splat(-50.0), Vec3::ONE)).unwrap();
    assert_eq!(octree.node_of(&small), Some(octree.root()));

    let first = Uuid::new_v4();
    let first_node = octree
        .insert(first, Aabb::from_center_half_extents(Vec3::splat(100.0), Vec3::splat(86.0)))
        .unwrap();
    assert_eq!(octree.get(first_node).unwrap().half_size(), 128.0);

    // The node is at capacity, but a child could not hold an element this big.
    let second = Uuid::new_v4();
    let second_bounds = Aabb::from_center_half_extents(Vec3::new(120.0, 110.0, 100.0), Vec3::splat(86.0));
    let second_node = octree.insert(second, second_bounds).unwrap();
    assert_eq!(second_node, first_node);
    assert_eq!(octree.get(second_node).unwrap().element_count(), 2);

    let root = octree.root();
    octree.update_bounds(root);
    assert!(octree.get(second_node).unwrap().bounds().contains(&second_bounds, 0.0));
    assert!(octree.get(root).unwrap().bounds().contains(&second_bounds, 0.0));
    octree.check_invariants().unwrap();
}

#[test]
fn test_bounds_contain_children_after_churn() {
    let settings = OctreeSettings { max_capacity: 4, ..OctreeSettings::default() };
    let mut octree = Octree::new(settings, Vec3::new(128.0, 128.0, 0.0));
    let mut rng = Lcg(7);
    let mut ids = Vec::new();

    for _ in 0..300 {
        let center = Vec3::new(rng.range(-200.0, 450.0), rng.range(-200.0, 450.0), rng.range(0.0, 100.0));
        let half = Vec3::splat(rng.range(0.1, 12.0));
        let id = Uuid::new_v4();
        octree.insert(id, Aabb::from_center_half_extents(center, half)).unwrap();
        ids.push(id);
    }
    for id in ids.iter().step_by(3) {
        octree.remove(id).unwrap();
    }
    for id in ids.iter().skip(1).step_by(3) {
        let center = Vec3::new(rng.range(0.0, 256.0), rng.range(0.0, 256.0), rng.range(0.0, 50.0));
        octree.update(*id, Aabb::from_center_half_extents(center, Vec3::splat(rng.range(0.5, 3.0)))).unwrap();
    }

    let root = octree.root();
    octree.update_bounds(root);
    octree.check_invariants().unwrap();

    octree.consolidate();
    octree.update_bounds(root);
    octree.check_invariants().unwrap();
    assert_eq!(octree.len(), ids.len() - ids.iter().step_by(3).count());
}

#[test]
fn test_node_culled_only_after_resolved_query() {
    let mut backend = RecordingBackend::new();
    let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
    let mut store = MemoryTextureStore::new(session.completion_sender());
    let mut cache = MemoryBakeCache::new(session.completion_sender());
    let camera = camera_at(Vec3::ZERO, Vec3::new(40.0, 0.0, 0.0));

    let wall = Uuid::new_v4();
    session
        .on_object_update(&ObjectUpdateEvent::new(wall, ObjectKind::Volume, Vec3::new(40.0, 0.0, 0.0), Vec3::splat(2.0)))
        .unwrap();
    backend.add_occluder(Aabb::new(Vec3::new(30.0, -10.0, -10.0), Vec3::new(50.0, 10.0, 10.0)));

    let mut visible = Vec::new();
    for frame in 1..=4 {
        if frame == 4 {
            backend.clear_occluders();
        }
        backend.begin_frame(frame);
        let report = session.frame(&camera, &mut store, &mut cache, &mut backend, Instant::now());
        visible.push(report.visible_objects.contains(&wall));
    }

    // Drawn while the first query is in flight, hidden once it resolves empty,
    // and back one frame after the occluder goes away.
    assert_eq!(visible, vec![true, false, false, true]);
}

#[test]
fn test_distance_change_makes_impostor_stale() {
    let mut scheduler = ImpostorScheduler::new(ImpostorSettings::default());
    let mut backend = RecordingBackend::new();
    let mut budget = FrameBudget::default();
    let camera = camera_at(Vec3::ZERO, Vec3::X);
    let id = Uuid::new_v4();
    let view_at = |distance: f32| AvatarView {
        id,
        is_self: false,
        muted: false,
        rank: 30,
        pixel_area: 400.0,
        distance,
        bounds: Aabb::from_center_half_extents(Vec3::new(distance, 0.0, 0.0), Vec3::new(0.25, 0.3, 0.95)),
    };

    let decisions = scheduler.schedule(&[view_at(20.0)], &camera, &mut backend, &mut budget, 1);
    assert!(decisions[0].regenerated);
    let capture = scheduler.state(&id).unwrap().capture.unwrap();
    assert_eq!(scheduler.staleness(&capture, &view_at(20.0), &camera), None);

    let stale = scheduler.staleness(&capture, &view_at(40.0), &camera);
    assert!(stale.is_some_and(|score| score > 1.0));
    let decisions = scheduler.schedule(&[view_at(40.0)], &camera, &mut backend, &mut budget, 2);
    assert!(decisions[0].regenerated);
    assert_eq!(scheduler.state(&id).unwrap().capture.unwrap().distance, 40.0);
}

#[test]
fn test_grey_distant_avatar_gets_finite_period() {
    let backend = RecordingBackend::without_queries();
    let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
    let mut store = MemoryTextureStore::new(session.completion_sender());
    let mut cache = MemoryBakeCache::new(session.completion_sender());
    let mut backend = backend;
    let camera = camera_at(Vec3::new(0.0, 0.0, 1.5), Vec3::new(50.0, 0.0, 1.5));

    // A crowd close to the camera pushes the far avatar out of the full-detail band.
    for i in 0..20 {
        session.add_avatar(Uuid::new_v4(), false, Vec3::new(6.0 + i as f32 * 0.5, (i % 5) as f32 - 2.0, 1.0)).unwrap();
    }
    let far = Uuid::new_v4();
    session.add_avatar(far, false, Vec3::new(120.0, 0.0, 1.0)).unwrap();

    backend.begin_frame(1);
    let report = session.frame(&camera, &mut store, &mut cache, &mut backend, Instant::now());
    assert!(report.visible_avatars.contains(&far));
    assert!(session.avatars().get(&far).unwrap().appearance.is_grey());

    let state = session.impostors().state(&far).unwrap();
    let max = session.settings().impostor.max_update_period;
    assert!(state.update_period >= 2 && state.update_period <= max);
    assert!(state.is_impostor);
}

#[test]
fn test_crowd_dampens_detail() {
    let backend = RecordingBackend::without_queries();
    let mut session = WorldSession::new(ViewerSettings::default(), &backend, Vec3::ZERO);
    let mut store = MemoryTextureStore::new(session.completion_sender());
    let mut cache = MemoryBakeCache::new(session.completion_sender());
    let mut backend = backend;
    let camera = camera_at(Vec3::new(0.0, 0.0, 1.5), Vec3::new(50.0, 0.0, 1.5));

    let lone = Uuid::new_v4();
    session.add_avatar(lone, false, Vec3::new(25.0, 0.0, 1.0)).unwrap();
    backend.begin_frame(1);
    session.frame(&camera, &mut store, &mut cache, &mut backend, Instant::now());
    let alone = session.lod_state(&lone).unwrap().pixel_area();

    for i in 0..40 {
        session.add_avatar(Uuid::new_v4(), false, Vec3::new(30.0 + i as f32, 4.0, 1.0)).unwrap();
    }
    backend.begin_frame(2);
    session.frame(&camera, &mut store, &mut cache, &mut backend, Instant::now());
    let crowded = session.lod_state(&lone).unwrap().pixel_area();
    assert!(crowded < alone);
}
