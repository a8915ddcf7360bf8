//! Server-side bake cache capability.

use super::fetch::AssetEvent;
use crate::world::avatar::BakedRegion;
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BakeError {
    #[error("Bake upload rejected: {reason}")]
    Rejected { reason: String },

    #[error("Bake capability unavailable")]
    Unavailable,

    #[error("Bake encode failed: {reason}")]
    Encode { reason: String },
}

/// Content hash of every local texture that feeds one baked region.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BakeHash(pub [u8; 16]);

impl BakeHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn to_uuid(self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Display for BakeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BakeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BakeHash({})", self)
    }
}

/// Network-backed, asynchronous, fallible. Results arrive as
/// [`AssetEvent::BakeQuery`] / [`AssetEvent::BakeUpload`].
pub trait BakeCacheService {
    fn query_cached_bake(&mut self, avatar: Uuid, region: BakedRegion, hash: BakeHash);
    fn upload_bake(&mut self, avatar: Uuid, region: BakedRegion, hash: BakeHash, encoded: Bytes);
}

/// In-process bake cache keyed by content hash.
pub struct MemoryBakeCache {
    entries: HashMap<BakeHash, Uuid>,
    completions: Sender<AssetEvent>,
    reject_uploads: Option<String>,
    uploads: Vec<(Uuid, BakedRegion, BakeHash, usize)>,
    queries: usize,
}

impl MemoryBakeCache {
    pub fn new(completions: Sender<AssetEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            completions,
            reject_uploads: None,
            uploads: Vec::new(),
            queries: 0,
        }
    }

    pub fn insert(&mut self, hash: BakeHash, texture_id: Uuid) {
        self.entries.insert(hash, texture_id);
    }

    pub fn get(&self, hash: &BakeHash) -> Option<Uuid> {
        self.entries.get(hash).copied()
    }

    /// Reject every subsequent upload with `reason`, or accept again with `None`.
    pub fn set_reject_uploads(&mut self, reason: Option<String>) {
        self.reject_uploads = reason;
    }

    /// (avatar, region, hash, encoded byte count) per upload received.
    pub fn uploads(&self) -> &[(Uuid, BakedRegion, BakeHash, usize)] {
        &self.uploads
    }

    pub fn query_count(&self) -> usize {
        self.queries
    }

    fn send(&self, event: AssetEvent) {
        if self.completions.send(event).is_err() {
            debug!("Completion queue closed, dropping bake event");
        }
    }
}

impl BakeCacheService for MemoryBakeCache {
    fn query_cached_bake(&mut self, avatar: Uuid, region: BakedRegion, hash: BakeHash) {
        self.queries += 1;
        let result = self.entries.get(&hash).copied();
        self.send(AssetEvent::BakeQuery { avatar, region, hash, result });
    }

    fn upload_bake(&mut self, avatar: Uuid, region: BakedRegion, hash: BakeHash, encoded: Bytes) {
        self.uploads.push((avatar, region, hash, encoded.len()));
        let result = match &self.reject_uploads {
            Some(reason) => Err(BakeError::Rejected { reason: reason.clone() }),
            None => {
                let id = Uuid::new_v4();
                self.entries.insert(hash, id);
                info!("Stored bake {} for {:?} ({} bytes)", id, region, encoded.len());
                Ok(id)
            }
        };
        self.send(AssetEvent::BakeUpload { avatar, region, hash, result });
    }
}
