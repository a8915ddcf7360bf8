pub mod bake_cache;
pub mod fetch;
pub mod texture;

pub use bake_cache::{BakeCacheService, BakeError, BakeHash, MemoryBakeCache};
pub use fetch::{
    AssetEvent, CompletionQueue, EncodedTextureSource, FetchError, FetchEvent, FetchHandle,
    FetchPriority, FetchRequest, FetchStatus, FetchTarget, MemoryTextureStore,
    PooledTextureFetcher, TextureFetchService,
};
pub use texture::{DiscardLevel, RawImage, DEFAULT_AVATAR_TEXTURE, DEFAULT_TEXTURE, INVISIBLE_TEXTURE};
