use super::dictionary::{BakedRegion, LocalTextureIndex};
use super::layer_set::TexLayerSet;
use crate::assets::fetch::FetchHandle;
use crate::assets::texture::is_placeholder;
use std::time::Instant;
use uuid::Uuid;

/// Per-avatar record of one baked region.
///
/// `is_loaded` implies `texture_id` is a real (non placeholder) id. The
/// layer set is only present while the region composites locally, or
/// permanently for the viewer's own avatar.
#[derive(Debug)]
pub struct BakedTextureSlot {
    region: BakedRegion,
    texture_id: Option<Uuid>,
    last_good_id: Option<Uuid>,
    is_loaded: bool,
    is_used: bool,
    local_indices: &'static [LocalTextureIndex],
    layer_set: Option<TexLayerSet>,
    pending_fetch: Option<(FetchHandle, Uuid)>,
    last_upload: Option<Instant>,
    upload_pending: bool,
}

impl BakedTextureSlot {
    pub fn new(region: BakedRegion) -> Self {
        Self {
            region,
            texture_id: None,
            last_good_id: None,
            is_loaded: false,
            is_used: false,
            local_indices: region.local_textures(),
            layer_set: None,
            pending_fetch: None,
            last_upload: None,
            upload_pending: false,
        }
    }

    pub fn region(&self) -> BakedRegion {
        self.region
    }

    pub fn texture_id(&self) -> Option<Uuid> {
        self.texture_id
    }

    /// Last bake that fully loaded for this region.
    pub fn last_good_id(&self) -> Option<Uuid> {
        self.last_good_id
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded
    }

    pub fn is_used(&self) -> bool {
        self.is_used
    }

    pub fn local_indices(&self) -> &'static [LocalTextureIndex] {
        self.local_indices
    }

    pub fn layer_set(&self) -> Option<&TexLayerSet> {
        self.layer_set.as_ref()
    }

    pub fn layer_set_mut(&mut self) -> Option<&mut TexLayerSet> {
        self.layer_set.as_mut()
    }

    pub fn pending_fetch(&self) -> Option<(FetchHandle, Uuid)> {
        self.pending_fetch
    }

    pub fn upload_pending(&self) -> bool {
        self.upload_pending
    }

    pub fn last_upload(&self) -> Option<Instant> {
        self.last_upload
    }

    /// Announce a (possibly new) baked id. Clears the loaded state unless it
    /// is the id already shown.
    pub(crate) fn declare(&mut self, id: Uuid) {
        if self.texture_id == Some(id) {
            return;
        }
        self.texture_id = Some(id);
        self.is_loaded = false;
        self.pending_fetch = None;
    }

    /// The simulator reports this region as not baked.
    pub(crate) fn clear(&mut self) {
        self.texture_id = None;
        self.is_loaded = false;
        self.pending_fetch = None;
    }

    pub(crate) fn set_pending_fetch(&mut self, handle: FetchHandle, id: Uuid) {
        self.pending_fetch = Some((handle, id));
    }

    /// Mark `id` loaded. Refused for placeholder ids.
    pub(crate) fn set_loaded(&mut self, id: Uuid) -> bool {
        if is_placeholder(&id) {
            return false;
        }
        self.texture_id = Some(id);
        self.last_good_id = Some(id);
        self.is_loaded = true;
        self.pending_fetch = None;
        true
    }

    /// A fetch of `id` failed for good.
    pub(crate) fn fail(&mut self, id: Uuid) {
        if self.texture_id == Some(id) {
            self.texture_id = None;
            self.is_loaded = false;
        }
        if self.last_good_id == Some(id) {
            self.last_good_id = None;
        }
        self.pending_fetch = None;
    }

    pub(crate) fn set_used(&mut self, used: bool) {
        self.is_used = used;
    }

    pub(crate) fn ensure_layer_set(&mut self, size: u32) -> &mut TexLayerSet {
        let region = self.region;
        self.layer_set.get_or_insert_with(|| TexLayerSet::new(region, size))
    }

    pub(crate) fn destroy_layer_set(&mut self) -> bool {
        self.layer_set.take().is_some()
    }

    pub(crate) fn set_upload_pending(&mut self, pending: bool) {
        self.upload_pending = pending;
    }

    pub(crate) fn record_upload(&mut self, at: Instant) {
        self.last_upload = Some(at);
        self.upload_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::texture::DEFAULT_AVATAR_TEXTURE;

    #[test]
    fn test_loaded_requires_real_id() {
        let mut slot = BakedTextureSlot::new(BakedRegion::Head);
        assert!(!slot.set_loaded(DEFAULT_AVATAR_TEXTURE));
        assert!(!slot.is_loaded());

        let id = Uuid::new_v4();
        assert!(slot.set_loaded(id));
        assert!(slot.is_loaded());
        assert_eq!(slot.texture_id(), Some(id));
        assert_eq!(slot.last_good_id(), Some(id));
    }

    #[test]
    fn test_declare_keeps_last_good() {
        let mut slot = BakedTextureSlot::new(BakedRegion::UpperBody);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        slot.set_loaded(a);
        slot.declare(b);
        assert!(!slot.is_loaded());
        assert_eq!(slot.texture_id(), Some(b));
        assert_eq!(slot.last_good_id(), Some(a));

        slot.declare(b);
        assert_eq!(slot.texture_id(), Some(b));
    }

    #[test]
    fn test_layer_set_lifecycle() {
        let mut slot = BakedTextureSlot::new(BakedRegion::Eyes);
        let first = slot.ensure_layer_set(16).composite_id();
        assert_eq!(slot.ensure_layer_set(16).composite_id(), first);
        assert!(slot.destroy_layer_set());
        assert!(!slot.destroy_layer_set());
        assert_ne!(slot.ensure_layer_set(16).composite_id(), first);
    }
}
