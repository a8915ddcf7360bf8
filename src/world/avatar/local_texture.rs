use super::dictionary::LocalTextureIndex;
use crate::assets::texture::{DiscardLevel, RawImage};
use uuid::Uuid;

/// Outcome of feeding a fetch result to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotUpdate {
    /// The slot took the new image.
    Improved,
    /// Not better than what the slot already has.
    Ignored,
    /// The owning region is baked; the slot no longer tracks detail.
    Frozen,
    /// Result for a texture the slot no longer wears.
    Stale,
}

/// Per-avatar record of one wearable texture.
///
/// While `baked_ready` is false the discard level only ever decreases. Once
/// the owning region is baked the slot is frozen until the region goes back
/// to local compositing.
#[derive(Debug, Clone)]
pub struct LocalTextureSlot {
    index: LocalTextureIndex,
    image_id: Option<Uuid>,
    image: Option<RawImage>,
    discard: DiscardLevel,
    baked_ready: bool,
    min_discard: DiscardLevel,
    missing: bool,
}

impl LocalTextureSlot {
    pub fn new(index: LocalTextureIndex, min_discard: DiscardLevel) -> Self {
        Self {
            index,
            image_id: None,
            image: None,
            discard: DiscardLevel::UNKNOWN,
            baked_ready: false,
            min_discard,
            missing: false,
        }
    }

    pub fn index(&self) -> LocalTextureIndex {
        self.index
    }

    pub fn image_id(&self) -> Option<Uuid> {
        self.image_id
    }

    pub fn image(&self) -> Option<&RawImage> {
        self.image.as_ref()
    }

    pub fn discard(&self) -> DiscardLevel {
        self.discard
    }

    pub fn is_baked_ready(&self) -> bool {
        self.baked_ready
    }

    pub fn min_discard(&self) -> DiscardLevel {
        self.min_discard
    }

    /// The asset does not exist; the slot shows the default texture for good.
    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Worn with an image at the acceptable discard level, or permanently missing.
    pub fn is_fully_loaded(&self) -> bool {
        self.image_id.is_none() || self.missing || self.discard.satisfies(self.min_discard)
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    /// Wear a new texture in this slot. Resets the tracked detail.
    pub fn set_image_id(&mut self, id: Option<Uuid>) -> bool {
        if self.image_id == id {
            return false;
        }
        self.image_id = id;
        self.image = None;
        self.discard = DiscardLevel::UNKNOWN;
        self.missing = false;
        true
    }

    /// Apply a fetch result. Only strict improvements are taken.
    pub fn apply_progress(&mut self, image_id: Uuid, discard: DiscardLevel, image: Option<RawImage>) -> SlotUpdate {
        if self.image_id != Some(image_id) {
            return SlotUpdate::Stale;
        }
        if self.baked_ready {
            return SlotUpdate::Frozen;
        }
        let Some(image) = image else {
            return SlotUpdate::Ignored;
        };
        if !discard.improves_on(self.discard) {
            return SlotUpdate::Ignored;
        }
        self.discard = discard;
        self.image = Some(image);
        SlotUpdate::Improved
    }

    /// Record that the asset does not exist. No retries follow.
    pub fn mark_missing(&mut self, image_id: Uuid) -> bool {
        if self.image_id != Some(image_id) || self.missing {
            return false;
        }
        self.missing = true;
        self.image = None;
        true
    }

    pub fn set_baked_ready(&mut self, ready: bool) {
        self.baked_ready = ready;
    }
}
