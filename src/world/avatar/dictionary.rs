//! Fixed mapping between baked body regions and the wearable textures that
//! feed them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One bakeable body region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BakedRegion {
    Head,
    UpperBody,
    LowerBody,
    Eyes,
    Skirt,
    Hair,
}

impl BakedRegion {
    pub const COUNT: usize = 6;

    pub const ALL: [BakedRegion; Self::COUNT] = [
        BakedRegion::Head,
        BakedRegion::UpperBody,
        BakedRegion::LowerBody,
        BakedRegion::Eyes,
        BakedRegion::Skirt,
        BakedRegion::Hair,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Texture entry slot carrying this region's bake in appearance updates.
    pub fn texture_entry_index(self) -> u8 {
        match self {
            BakedRegion::Head => 8,
            BakedRegion::UpperBody => 9,
            BakedRegion::LowerBody => 10,
            BakedRegion::Eyes => 11,
            BakedRegion::Skirt => 19,
            BakedRegion::Hair => 20,
        }
    }

    pub fn from_texture_entry_index(index: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.texture_entry_index() == index)
    }

    /// Wearable textures composited into this region, bottom layer first.
    pub fn local_textures(self) -> &'static [LocalTextureIndex] {
        use LocalTextureIndex::*;
        match self {
            BakedRegion::Head => &[HeadBodypaint, HeadTattoo],
            BakedRegion::UpperBody => &[
                UpperBodypaint,
                UpperTattoo,
                UpperUndershirt,
                UpperGloves,
                UpperShirt,
                UpperJacket,
            ],
            BakedRegion::LowerBody => &[
                LowerBodypaint,
                LowerTattoo,
                LowerUnderpants,
                LowerSocks,
                LowerShoes,
                LowerPants,
                LowerJacket,
            ],
            BakedRegion::Eyes => &[EyesIris],
            BakedRegion::Skirt => &[Skirt],
            BakedRegion::Hair => &[Hair],
        }
    }

    /// Base color of the composite before any layer is applied.
    pub fn base_color(self) -> [u8; 4] {
        match self {
            BakedRegion::Head | BakedRegion::UpperBody | BakedRegion::LowerBody => [196, 160, 136, 255],
            BakedRegion::Eyes => [92, 110, 128, 255],
            BakedRegion::Skirt => [0, 0, 0, 0],
            BakedRegion::Hair => [72, 52, 36, 255],
        }
    }
}

impl fmt::Display for BakedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BakedRegion::Head => "head",
            BakedRegion::UpperBody => "upper",
            BakedRegion::LowerBody => "lower",
            BakedRegion::Eyes => "eyes",
            BakedRegion::Skirt => "skirt",
            BakedRegion::Hair => "hair",
        };
        f.write_str(name)
    }
}

/// One wearable texture category on an avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocalTextureIndex {
    HeadBodypaint,
    HeadTattoo,
    UpperShirt,
    UpperBodypaint,
    UpperJacket,
    UpperGloves,
    UpperUndershirt,
    UpperTattoo,
    LowerPants,
    LowerBodypaint,
    LowerShoes,
    LowerSocks,
    LowerJacket,
    LowerUnderpants,
    LowerTattoo,
    EyesIris,
    Skirt,
    Hair,
}

impl LocalTextureIndex {
    pub const COUNT: usize = 18;

    pub const ALL: [LocalTextureIndex; Self::COUNT] = [
        LocalTextureIndex::HeadBodypaint,
        LocalTextureIndex::HeadTattoo,
        LocalTextureIndex::UpperShirt,
        LocalTextureIndex::UpperBodypaint,
        LocalTextureIndex::UpperJacket,
        LocalTextureIndex::UpperGloves,
        LocalTextureIndex::UpperUndershirt,
        LocalTextureIndex::UpperTattoo,
        LocalTextureIndex::LowerPants,
        LocalTextureIndex::LowerBodypaint,
        LocalTextureIndex::LowerShoes,
        LocalTextureIndex::LowerSocks,
        LocalTextureIndex::LowerJacket,
        LocalTextureIndex::LowerUnderpants,
        LocalTextureIndex::LowerTattoo,
        LocalTextureIndex::EyesIris,
        LocalTextureIndex::Skirt,
        LocalTextureIndex::Hair,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn region(self) -> BakedRegion {
        use LocalTextureIndex::*;
        match self {
            HeadBodypaint | HeadTattoo => BakedRegion::Head,
            UpperShirt | UpperBodypaint | UpperJacket | UpperGloves | UpperUndershirt | UpperTattoo => {
                BakedRegion::UpperBody
            }
            LowerPants | LowerBodypaint | LowerShoes | LowerSocks | LowerJacket | LowerUnderpants
            | LowerTattoo => BakedRegion::LowerBody,
            EyesIris => BakedRegion::Eyes,
            Skirt => BakedRegion::Skirt,
            Hair => BakedRegion::Hair,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_local_texture_feeds_exactly_its_region() {
        for index in LocalTextureIndex::ALL {
            let owners: Vec<_> = BakedRegion::ALL
                .into_iter()
                .filter(|r| r.local_textures().contains(&index))
                .collect();
            assert_eq!(owners, vec![index.region()], "{:?}", index);
        }
    }

    #[test]
    fn test_texture_entry_round_trip() {
        for region in BakedRegion::ALL {
            assert_eq!(BakedRegion::from_texture_entry_index(region.texture_entry_index()), Some(region));
        }
        assert_eq!(BakedRegion::from_texture_entry_index(0), None);
    }

    #[test]
    fn test_indices_are_dense() {
        for (i, region) in BakedRegion::ALL.iter().enumerate() {
            assert_eq!(region.index(), i);
        }
        for (i, index) in LocalTextureIndex::ALL.iter().enumerate() {
            assert_eq!(index.index(), i);
        }
    }
}
