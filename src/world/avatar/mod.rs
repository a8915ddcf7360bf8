//! Avatar appearance: local wearable textures, server bakes and the
//! reconciliation between them.

pub mod appearance;
pub mod baked_texture;
pub mod dictionary;
pub mod layer_set;
pub mod local_texture;
pub mod registry;

pub use appearance::{AppearanceContext, AppearanceError, AvatarAppearance, RegionTexture};
pub use baked_texture::BakedTextureSlot;
pub use dictionary::{BakedRegion, LocalTextureIndex};
pub use layer_set::{LayerParams, TexLayerSet};
pub use local_texture::{LocalTextureSlot, SlotUpdate};
pub use registry::{Avatar, AvatarRegistry, DrainStats, DEFAULT_AVATAR_SIZE};
