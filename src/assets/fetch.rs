//! Texture fetch boundary and the completion queue.
//!
//! Fetching and decoding run off the main thread. Every result comes back as an
//! [`AssetEvent`] on a [`CompletionQueue`] that the frame loop drains once per
//! idle phase, so nothing in the appearance or culling code is ever mutated
//! from a worker.

use super::bake_cache::{BakeError, BakeHash};
use super::texture::{reduce_to_discard, DiscardLevel, RawImage};
use crate::world::avatar::{BakedRegion, LocalTextureIndex};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Texture {0} does not exist")]
    Missing(Uuid),

    #[error("Texture {id} failed to decode: {reason}")]
    Decode { id: Uuid, reason: String },

    #[error("Texture source failed: {reason}")]
    Source { reason: String },
}

/// Opaque id of one fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FetchPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Who a fetch result belongs to. Carried through the worker untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    LocalTexture { avatar: Uuid, index: LocalTextureIndex },
    BakedTexture { avatar: Uuid, region: BakedRegion },
}

impl FetchTarget {
    pub fn avatar(&self) -> Uuid {
        match self {
            FetchTarget::LocalTexture { avatar, .. } | FetchTarget::BakedTexture { avatar, .. } => *avatar,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub image_id: Uuid,
    pub desired_discard: DiscardLevel,
    pub priority: FetchPriority,
    pub target: FetchTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    /// More detail will follow.
    Progress,
    /// Desired discard level reached; no more events for this handle.
    Final,
    /// The asset does not exist on the server. Final.
    Missing,
    /// Transport or decode failure. Final.
    Failed(String),
}

impl FetchStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, FetchStatus::Progress)
    }
}

#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub handle: FetchHandle,
    pub image_id: Uuid,
    pub target: FetchTarget,
    pub discard: DiscardLevel,
    pub image: Option<RawImage>,
    pub status: FetchStatus,
}

/// Completion of any asynchronous asset operation.
#[derive(Debug, Clone)]
pub enum AssetEvent {
    Fetch(FetchEvent),
    BakeQuery {
        avatar: Uuid,
        region: BakedRegion,
        hash: BakeHash,
        result: Option<Uuid>,
    },
    BakeUpload {
        avatar: Uuid,
        region: BakedRegion,
        hash: BakeHash,
        result: Result<Uuid, BakeError>,
    },
}

impl AssetEvent {
    pub fn avatar(&self) -> Uuid {
        match self {
            AssetEvent::Fetch(event) => event.target.avatar(),
            AssetEvent::BakeQuery { avatar, .. } | AssetEvent::BakeUpload { avatar, .. } => *avatar,
        }
    }
}

/// Multi-producer queue of completions, drained on the main thread.
#[derive(Debug, Clone)]
pub struct CompletionQueue {
    tx: Sender<AssetEvent>,
    rx: Receiver<AssetEvent>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> Sender<AssetEvent> {
        self.tx.clone()
    }

    /// Take up to `max` pending events without blocking.
    pub fn drain(&self, max: usize) -> Vec<AssetEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                // Unreachable while we hold a sender ourselves
                Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Best-effort, eventually consistent texture fetching.
pub trait TextureFetchService {
    fn request_fetch(&mut self, request: FetchRequest) -> FetchHandle;
}

fn next_handle(counter: &AtomicU64) -> FetchHandle {
    FetchHandle(counter.fetch_add(1, Ordering::Relaxed) + 1)
}

fn send_event(tx: &Sender<AssetEvent>, event: FetchEvent) {
    if tx.send(AssetEvent::Fetch(event)).is_err() {
        debug!("Completion queue closed, dropping fetch event");
    }
}

/// Progressive events from the coarsest useful level down to `desired`.
fn progressive_events(
    handle: FetchHandle,
    request: &FetchRequest,
    full: &RgbaImage,
) -> Vec<FetchEvent> {
    let desired = request.desired_discard.value().max(0);
    let coarsest = (desired + 2).min(DiscardLevel::MAX.value());
    (desired..=coarsest)
        .rev()
        .map(|level| {
            let discard = DiscardLevel::new(level);
            FetchEvent {
                handle,
                image_id: request.image_id,
                target: request.target,
                discard,
                image: Some(Arc::new(reduce_to_discard(full, discard))),
                status: if level == desired { FetchStatus::Final } else { FetchStatus::Progress },
            }
        })
        .collect()
}

fn terminal_event(handle: FetchHandle, request: &FetchRequest, status: FetchStatus) -> FetchEvent {
    FetchEvent {
        handle,
        image_id: request.image_id,
        target: request.target,
        discard: DiscardLevel::UNKNOWN,
        image: None,
        status,
    }
}

// =============================================================================
// Pooled fetcher
// =============================================================================

/// Supplier of encoded texture bytes (HTTP capability or UDP transfer).
pub trait EncodedTextureSource: Send + Sync {
    /// `Ok(None)` means the asset does not exist.
    fn encoded(&self, id: &Uuid) -> Result<Option<Bytes>, FetchError>;
}

/// Fetcher that decodes on a bounded rayon pool.
pub struct PooledTextureFetcher {
    pool: Arc<rayon::ThreadPool>,
    source: Arc<dyn EncodedTextureSource>,
    completions: Sender<AssetEvent>,
    counter: AtomicU64,
}

impl PooledTextureFetcher {
    pub fn new(
        pool: Arc<rayon::ThreadPool>,
        source: Arc<dyn EncodedTextureSource>,
        completions: Sender<AssetEvent>,
    ) -> Self {
        Self {
            pool,
            source,
            completions,
            counter: AtomicU64::new(0),
        }
    }

    fn run(handle: FetchHandle, request: FetchRequest, source: &dyn EncodedTextureSource, tx: &Sender<AssetEvent>) {
        let bytes = match source.encoded(&request.image_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Texture {} missing on server", request.image_id);
                send_event(tx, terminal_event(handle, &request, FetchStatus::Missing));
                return;
            }
            Err(e) => {
                warn!("Texture {} fetch failed: {}", request.image_id, e);
                send_event(tx, terminal_event(handle, &request, FetchStatus::Failed(e.to_string())));
                return;
            }
        };

        match image::load_from_memory(&bytes) {
            Ok(decoded) => {
                let full = decoded.to_rgba8();
                for event in progressive_events(handle, &request, &full) {
                    trace!("Texture {} decoded at {}", event.image_id, event.discard);
                    send_event(tx, event);
                }
            }
            Err(e) => {
                let error = FetchError::Decode { id: request.image_id, reason: e.to_string() };
                warn!("{}", error);
                send_event(tx, terminal_event(handle, &request, FetchStatus::Failed(error.to_string())));
            }
        }
    }
}

impl TextureFetchService for PooledTextureFetcher {
    fn request_fetch(&mut self, request: FetchRequest) -> FetchHandle {
        let handle = next_handle(&self.counter);
        let source = Arc::clone(&self.source);
        let tx = self.completions.clone();
        trace!("Fetch {:?} queued for {} at {}", handle, request.image_id, request.desired_discard);
        self.pool.spawn(move || Self::run(handle, request, source.as_ref(), &tx));
        handle
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Fetch service backed by a map of decoded images.
///
/// Used by the headless harness and tests. Results are pushed onto the
/// completion queue at request time (or on `flush` when deferred), so they are
/// still only observed on the next drain.
pub struct MemoryTextureStore {
    images: HashMap<Uuid, RgbaImage>,
    failing: HashMap<Uuid, String>,
    completions: Sender<AssetEvent>,
    counter: AtomicU64,
    deferred: bool,
    pending: Vec<(FetchHandle, FetchRequest)>,
    requests: Vec<FetchRequest>,
}

impl MemoryTextureStore {
    pub fn new(completions: Sender<AssetEvent>) -> Self {
        Self {
            images: HashMap::new(),
            failing: HashMap::new(),
            completions,
            counter: AtomicU64::new(0),
            deferred: false,
            pending: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn insert(&mut self, id: Uuid, image: RgbaImage) {
        self.images.insert(id, image);
    }

    /// Make every fetch of `id` fail with a transport error.
    pub fn fail(&mut self, id: Uuid, reason: impl Into<String>) {
        self.failing.insert(id, reason.into());
    }

    /// Hold requests until `flush` / `flush_id` instead of answering immediately.
    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> &[FetchRequest] {
        &self.requests
    }

    pub fn requests_for(&self, id: &Uuid) -> usize {
        self.requests.iter().filter(|r| r.image_id == *id).count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn flush(&mut self) {
        for (handle, request) in std::mem::take(&mut self.pending) {
            self.answer(handle, &request);
        }
    }

    pub fn flush_id(&mut self, id: &Uuid) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, request)| request.image_id == *id);
        self.pending = rest;
        for (handle, request) in ready {
            self.answer(handle, &request);
        }
    }

    fn answer(&self, handle: FetchHandle, request: &FetchRequest) {
        if let Some(reason) = self.failing.get(&request.image_id) {
            send_event(&self.completions, terminal_event(handle, request, FetchStatus::Failed(reason.clone())));
            return;
        }
        match self.images.get(&request.image_id) {
            Some(full) => {
                for event in progressive_events(handle, request, full) {
                    send_event(&self.completions, event);
                }
            }
            None => send_event(&self.completions, terminal_event(handle, request, FetchStatus::Missing)),
        }
    }
}

impl TextureFetchService for MemoryTextureStore {
    fn request_fetch(&mut self, request: FetchRequest) -> FetchHandle {
        let handle = next_handle(&self.counter);
        self.requests.push(request.clone());
        if self.deferred {
            self.pending.push((handle, request));
        } else {
            self.answer(handle, &request);
        }
        handle
    }
}
