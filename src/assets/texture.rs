use image::{imageops, imageops::FilterType, Rgba, RgbaImage};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Grey placeholder shown for any body region without usable texture data.
///
/// The simulator also sends this id in appearance updates to mean "not baked".
pub const DEFAULT_AVATAR_TEXTURE: Uuid = Uuid::from_u128(0xc228d1cf_4b5d_4ba8_84f4_899a0796aa97);

/// Generic default texture used when a wearable layer's asset is missing.
pub const DEFAULT_TEXTURE: Uuid = Uuid::from_u128(0xd2114404_dd59_4a4d_8e6c_49359e91bbf0);

/// Baked "invisible" texture; a valid bake that renders nothing.
pub const INVISIBLE_TEXTURE: Uuid = Uuid::from_u128(0x3a367d1c_bef1_6d43_7595_e88c1e3aadb3);

/// Decoded texture data shared between the fetch workers and the main thread.
pub type RawImage = Arc<RgbaImage>;

/// True for ids that never denote a real bake.
pub fn is_placeholder(id: &Uuid) -> bool {
    id.is_nil() || *id == DEFAULT_AVATAR_TEXTURE
}

/// Progressive texture quality tier. Lower is more detailed; -1 is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscardLevel(i32);

impl DiscardLevel {
    pub const UNKNOWN: DiscardLevel = DiscardLevel(-1);
    pub const FULL: DiscardLevel = DiscardLevel(0);
    pub const MAX: DiscardLevel = DiscardLevel(5);

    pub fn new(level: i32) -> Self {
        if level < 0 {
            Self::UNKNOWN
        } else {
            Self(level.min(Self::MAX.0))
        }
    }

    pub fn value(self) -> i32 {
        self.0
    }

    pub fn is_known(self) -> bool {
        self.0 >= 0
    }

    /// True if `self` is strictly more detailed than `current`.
    pub fn improves_on(self, current: DiscardLevel) -> bool {
        self.is_known() && (!current.is_known() || self.0 < current.0)
    }

    /// True if this level is at least as detailed as `target`.
    pub fn satisfies(self, target: DiscardLevel) -> bool {
        self.is_known() && self.0 <= target.0.max(0)
    }
}

impl Default for DiscardLevel {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for DiscardLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_known() {
            write!(f, "d{}", self.0)
        } else {
            write!(f, "d?")
        }
    }
}

/// Scale a full resolution image down to the given discard level (2^level).
pub fn reduce_to_discard(image: &RgbaImage, discard: DiscardLevel) -> RgbaImage {
    let level = discard.value().max(0) as u32;
    if level == 0 {
        return image.clone();
    }
    let width = (image.width() >> level).max(1);
    let height = (image.height() >> level).max(1);
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Solid color image used for compiled-in placeholders and layer bases.
pub fn solid_image(size: u32, color: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(size.max(1), size.max(1), Rgba(color))
}
