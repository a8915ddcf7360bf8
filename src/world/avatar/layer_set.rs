//! Local compositing of wearable layers into one bitmap per baked region.

use super::dictionary::{BakedRegion, LocalTextureIndex};
use super::local_texture::LocalTextureSlot;
use crate::assets::bake_cache::BakeError;
use crate::assets::texture::{solid_image, DiscardLevel};
use bytes::Bytes;
use image::{imageops, imageops::FilterType, RgbaImage};
use std::io::Cursor;
use tracing::trace;
use uuid::Uuid;

/// Parametric settings of one layer in the stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerParams {
    /// Multiplied into every texel, RGBA in 0..=1.
    pub tint: [f32; 4],
}

impl Default for LayerParams {
    fn default() -> Self {
        Self { tint: [1.0; 4] }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    index: LocalTextureIndex,
    params: LayerParams,
}

/// Stack of parametric layers producing one composited bitmap.
#[derive(Debug)]
pub struct TexLayerSet {
    region: BakedRegion,
    composite_id: Uuid,
    size: u32,
    layers: Vec<Layer>,
    composite: Option<RgbaImage>,
    /// Worst discard level among the layers that went into `composite`.
    composite_discard: DiscardLevel,
    dirty: bool,
    generation: u64,
}

impl TexLayerSet {
    pub fn new(region: BakedRegion, size: u32) -> Self {
        let layers = region
            .local_textures()
            .iter()
            .map(|&index| Layer { index, params: LayerParams::default() })
            .collect();
        Self {
            region,
            composite_id: Uuid::new_v4(),
            size: size.max(1),
            layers,
            composite: None,
            composite_discard: DiscardLevel::UNKNOWN,
            dirty: true,
            generation: 0,
        }
    }

    pub fn region(&self) -> BakedRegion {
        self.region
    }

    /// Id under which the renderer knows this dynamic composite.
    pub fn composite_id(&self) -> Uuid {
        self.composite_id
    }

    pub fn composite(&self) -> Option<&RgbaImage> {
        self.composite.as_ref()
    }

    pub fn composite_discard(&self) -> DiscardLevel {
        self.composite_discard
    }

    /// Bumped every time the composite is regenerated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn set_layer_params(&mut self, index: LocalTextureIndex, params: LayerParams) -> bool {
        match self.layers.iter_mut().find(|layer| layer.index == index) {
            Some(layer) if layer.params != params => {
                layer.params = params;
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Every contributing slot is at its acceptable discard level (or absent).
    pub fn is_fully_loaded(&self, slots: &[LocalTextureSlot]) -> bool {
        self.layers
            .iter()
            .all(|layer| slots.get(layer.index.index()).map_or(true, |slot| slot.is_fully_loaded()))
    }

    /// Any contributing slot currently holds image data.
    pub fn has_any_image(&self, slots: &[LocalTextureSlot]) -> bool {
        self.layers
            .iter()
            .any(|layer| slots.get(layer.index.index()).map_or(false, |slot| slot.has_image()))
    }

    /// Recomposite if dirty. Returns true when a new bitmap was produced.
    pub fn update(&mut self, slots: &[LocalTextureSlot]) -> bool {
        if !self.dirty && self.composite.is_some() {
            return false;
        }

        let mut target = solid_image(self.size, self.region.base_color());
        let mut worst = DiscardLevel::FULL;
        for layer in &self.layers {
            let Some(slot) = slots.get(layer.index.index()) else {
                continue;
            };
            let Some(source) = slot.image() else {
                continue;
            };
            let mut scaled = imageops::resize(&**source, self.size, self.size, FilterType::Triangle);
            apply_tint(&mut scaled, layer.params.tint);
            imageops::overlay(&mut target, &scaled, 0, 0);
            if slot.discard().value() > worst.value() {
                worst = slot.discard();
            }
        }

        self.composite = Some(target);
        self.composite_discard = worst;
        self.dirty = false;
        self.generation += 1;
        trace!("Composited {} layer set, generation {}", self.region, self.generation);
        true
    }

    /// PNG encode the current composite for upload to the bake cache.
    pub fn encode(&self) -> Result<Bytes, BakeError> {
        let composite = self.composite.as_ref().ok_or_else(|| BakeError::Encode {
            reason: format!("{} layer set has no composite yet", self.region),
        })?;
        let mut buffer = Vec::new();
        composite
            .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .map_err(|e| BakeError::Encode { reason: e.to_string() })?;
        Ok(Bytes::from(buffer))
    }
}

fn apply_tint(image: &mut RgbaImage, tint: [f32; 4]) {
    if tint == [1.0; 4] {
        return;
    }
    for pixel in image.pixels_mut() {
        for (channel, factor) in pixel.0.iter_mut().zip(tint) {
            *channel = (*channel as f32 * factor.clamp(0.0, 1.0)).round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn slots() -> Vec<LocalTextureSlot> {
        LocalTextureIndex::ALL
            .iter()
            .map(|&index| LocalTextureSlot::new(index, DiscardLevel::FULL))
            .collect()
    }

    #[test]
    fn test_composite_uses_base_color_without_layers() {
        let mut set = TexLayerSet::new(BakedRegion::Head, 8);
        assert!(set.update(&slots()));
        let composite = set.composite().unwrap();
        assert_eq!(composite.get_pixel(0, 0).0, BakedRegion::Head.base_color());
        assert!(!set.update(&slots()));
        assert_eq!(set.generation(), 1);
    }

    #[test]
    fn test_opaque_layer_covers_base_and_tracks_discard() {
        let mut slots = slots();
        let id = Uuid::new_v4();
        let shirt = &mut slots[LocalTextureIndex::UpperShirt.index()];
        shirt.set_image_id(Some(id));
        shirt.apply_progress(id, DiscardLevel::new(2), Some(Arc::new(solid_image(2, [0, 0, 255, 255]))));

        let mut set = TexLayerSet::new(BakedRegion::UpperBody, 8);
        assert!(set.has_any_image(&slots));
        assert!(!set.is_fully_loaded(&slots));
        set.update(&slots);
        assert_eq!(set.composite().unwrap().get_pixel(3, 3).0, [0, 0, 255, 255]);
        assert_eq!(set.composite_discard(), DiscardLevel::new(2));
    }

    #[test]
    fn test_tint_marks_dirty_and_encode() {
        let mut set = TexLayerSet::new(BakedRegion::Hair, 4);
        assert!(set.encode().is_err());
        set.update(&slots());
        assert!(set.set_layer_params(LocalTextureIndex::Hair, LayerParams { tint: [0.5, 0.5, 0.5, 1.0] }));
        assert!(set.is_dirty());
        assert!(!set.set_layer_params(LocalTextureIndex::UpperShirt, LayerParams::default()));
        set.update(&slots());
        let bytes = set.encode().unwrap();
        assert!(bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]));
    }
}
