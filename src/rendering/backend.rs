//! Abstract render commands issued by the culling and LOD code.
//!
//! The decision logic never touches a graphics API. A real renderer implements
//! [`RenderBackend`]; [`RecordingBackend`] records the commands and answers
//! occlusion queries from scripted occluders for tests and the headless harness.

use super::camera::Camera;
use crate::utils::math::Aabb;
use std::collections::HashMap;
use tracing::trace;
use uuid::Uuid;

/// Opaque id of one hardware occlusion query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    /// One avatar body mesh variant with the texture its region resolved to.
    AvatarMesh { avatar: Uuid, mesh: String, texture: Uuid },
    /// Billboard in place of the full skeletal draw.
    Impostor { avatar: Uuid, billboard: Uuid },
    /// Non-avatar object at a discrete volume detail.
    Object { object: Uuid, detail: u8 },
}

pub trait RenderBackend {
    /// Checked once when the occlusion culler is created.
    fn supports_occlusion_queries(&self) -> bool;

    fn issue_occlusion_query(&mut self, bounds: &Aabb, camera: &Camera) -> QueryHandle;

    /// Samples passed, or `None` while the result is not available yet.
    fn query_result(&mut self, handle: QueryHandle) -> Option<u64>;

    fn release_query(&mut self, handle: QueryHandle);

    fn draw(&mut self, command: DrawCommand);

    /// Render `avatar` into a fresh billboard texture from `camera`'s viewpoint.
    fn capture_impostor(&mut self, avatar: Uuid, bounds: &Aabb, camera: &Camera) -> Uuid;
}

#[derive(Debug, Clone)]
struct RecordedQuery {
    bounds: Aabb,
    issued_frame: u64,
}

/// Headless backend: records draws, answers queries one frame late.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    supports_queries: bool,
    frame: u64,
    next_query: u64,
    queries: HashMap<QueryHandle, RecordedQuery>,
    occluders: Vec<Aabb>,
    draws: Vec<DrawCommand>,
    captures: Vec<Uuid>,
    issued: usize,
    released: usize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            supports_queries: true,
            ..Self::default()
        }
    }

    /// A backend without hardware occlusion queries.
    pub fn without_queries() -> Self {
        Self::default()
    }

    /// Start a new frame. Queries issued in earlier frames become readable.
    pub fn begin_frame(&mut self, frame: u64) {
        self.frame = frame;
        self.draws.clear();
    }

    /// Queries whose bounds lie fully inside an occluder report zero samples.
    pub fn add_occluder(&mut self, bounds: Aabb) {
        self.occluders.push(bounds);
    }

    pub fn clear_occluders(&mut self) {
        self.occluders.clear();
    }

    pub fn draws(&self) -> &[DrawCommand] {
        &self.draws
    }

    pub fn captures(&self) -> &[Uuid] {
        &self.captures
    }

    pub fn queries_issued(&self) -> usize {
        self.issued
    }

    pub fn queries_released(&self) -> usize {
        self.released
    }

    pub fn outstanding_queries(&self) -> usize {
        self.queries.len()
    }
}

impl RenderBackend for RecordingBackend {
    fn supports_occlusion_queries(&self) -> bool {
        self.supports_queries
    }

    fn issue_occlusion_query(&mut self, bounds: &Aabb, _camera: &Camera) -> QueryHandle {
        self.next_query += 1;
        let handle = QueryHandle(self.next_query);
        self.queries.insert(handle, RecordedQuery { bounds: *bounds, issued_frame: self.frame });
        self.issued += 1;
        trace!("Occlusion query {:?} issued for {}", handle, bounds);
        handle
    }

    fn query_result(&mut self, handle: QueryHandle) -> Option<u64> {
        let query = self.queries.get(&handle)?;
        if query.issued_frame >= self.frame {
            return None;
        }
        let hidden = self.occluders.iter().any(|occluder| occluder.contains(&query.bounds, 0.0));
        Some(if hidden { 0 } else { 64 })
    }

    fn release_query(&mut self, handle: QueryHandle) {
        if self.queries.remove(&handle).is_some() {
            self.released += 1;
        }
    }

    fn draw(&mut self, command: DrawCommand) {
        self.draws.push(command);
    }

    fn capture_impostor(&mut self, avatar: Uuid, _bounds: &Aabb, _camera: &Camera) -> Uuid {
        self.captures.push(avatar);
        Uuid::new_v4()
    }
}
