//! Headless harness: a synthetic crowd walked through the full frame loop.

use anyhow::Context;
use bytes::Bytes;
use glam::Vec3;
use image::{ImageFormat, RgbaImage};
use slv_appearance::assets::{EncodedTextureSource, FetchError, MemoryBakeCache, PooledTextureFetcher};
use slv_appearance::config::{load_settings, PerformanceProfile, ThreadPoolConfig, ViewerSettings};
use slv_appearance::rendering::{Camera, CameraSlot, RecordingBackend};
use slv_appearance::utils::logging::{init_logging, log_system_info};
use slv_appearance::world::avatar::{BakedRegion, LocalTextureIndex};
use slv_appearance::world::{AvatarAppearanceEvent, BakedTextureEntry, ObjectKind, ObjectUpdateEvent, WearablesChangedEvent, WorldSession};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_FRAMES: u64 = 120;
const CROWD_SIZE: usize = 48;

/// Serves a small solid PNG for every id, tinted by the id bytes.
struct SyntheticSource;

impl EncodedTextureSource for SyntheticSource {
    fn encoded(&self, id: &Uuid) -> Result<Option<Bytes>, FetchError> {
        let bytes = id.as_bytes();
        let image = RgbaImage::from_pixel(64, 64, image::Rgba([bytes[0], bytes[1], bytes[2], 255]));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| FetchError::Source { reason: e.to_string() })?;
        Ok(Some(Bytes::from(out.into_inner())))
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    log_system_info();

    let frames = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<u64>().context("frame count must be a number")?,
        None => DEFAULT_FRAMES,
    };

    let settings = load_settings().unwrap_or_else(|| {
        info!("No settings file, using balanced profile");
        ViewerSettings::for_profile(PerformanceProfile::Balanced)
    });
    let pool = ThreadPoolConfig::for_profile(&settings, num_cpus::get()).build_pool()?;

    let mut backend = RecordingBackend::new();
    let mut session = WorldSession::new(settings, &backend, Vec3::new(128.0, 128.0, 20.0));
    let mut fetcher = PooledTextureFetcher::new(Arc::new(pool), Arc::new(SyntheticSource), session.completion_sender());
    let mut bake_cache = MemoryBakeCache::new(session.completion_sender());

    // Our own avatar, wearing a shirt and pants
    let me = Uuid::new_v4();
    session.add_avatar(me, true, Vec3::new(128.0, 128.0, 20.0))?;
    let wearables = WearablesChangedEvent::new(vec![
        (LocalTextureIndex::UpperShirt, Some(Uuid::new_v4())),
        (LocalTextureIndex::LowerPants, Some(Uuid::new_v4())),
    ]);
    let now = Instant::now();
    session.on_wearables_changed(&mut fetcher, &mut bake_cache, &wearables, now)?;
    session.request_cache_check(&mut fetcher, &mut bake_cache, now)?;

    // A crowd in a ring, half of them already baked
    for i in 0..CROWD_SIZE {
        let angle = i as f32 / CROWD_SIZE as f32 * std::f32::consts::TAU;
        let radius = 6.0 + (i % 8) as f32 * 9.0;
        let position = Vec3::new(128.0 + angle.cos() * radius, 128.0 + angle.sin() * radius, 20.0);
        let id = Uuid::new_v4();
        session.add_avatar(id, false, position)?;
        if i % 2 == 0 {
            let baked = BakedRegion::ALL
                .iter()
                .map(|&region| (region, BakedTextureEntry::Baked(Uuid::new_v4())))
                .collect();
            session.on_appearance(&mut fetcher, &mut bake_cache, &AvatarAppearanceEvent::new(id, baked), now)?;
        }
    }

    // Scenery, with a wall that hides part of the ring
    for i in 0..64 {
        let position = Vec3::new(64.0 + (i % 8) as f32 * 16.0, 64.0 + (i / 8) as f32 * 16.0, 20.0);
        let kind = if i % 5 == 0 { ObjectKind::Tree } else { ObjectKind::Volume };
        session.on_object_update(&ObjectUpdateEvent::new(Uuid::new_v4(), kind, position, Vec3::splat(2.0)))?;
    }
    backend.add_occluder(slv_appearance::utils::Aabb::new(Vec3::new(60.0, 60.0, 0.0), Vec3::new(120.0, 200.0, 60.0)));

    let mut camera = Camera::new(
        CameraSlot::WORLD,
        Vec3::new(124.0, 128.0, 21.7),
        Vec3::new(200.0, 128.0, 20.0),
        60f32.to_radians(),
        (1280, 720),
    );

    let start = Instant::now();
    for frame in 1..=frames {
        backend.begin_frame(frame);
        let yaw = frame as f32 * 0.02;
        let origin = camera.origin;
        camera.look_at(origin, origin + Vec3::new(yaw.cos(), yaw.sin(), -0.02));

        let report = session.frame(&camera, &mut fetcher, &mut bake_cache, &mut backend, Instant::now());
        for message in session.take_outbox() {
            info!("-> simulator: {:?}", message);
        }
        if frame % 30 == 0 {
            info!(
                "Frame {}: {} avatars, {} objects, {} impostors, {} draws, {} completions",
                report.frame,
                report.visible_avatars.len(),
                report.visible_objects.len(),
                report.budget.impostors(),
                report.budget.draw_calls(),
                report.drain.delivered
            );
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    if let Some(avatar) = session.avatars().self_avatar() {
        info!("Own avatar selections: {:?}", avatar.appearance.selections());
        if !avatar.appearance.is_fully_baked() {
            warn!("Own avatar not fully baked after {} frames", frames);
        }
    }
    info!("{} frames in {:?}", frames, start.elapsed());
    Ok(())
}
