//! Cluster routing metadata: chunk versions, routing tables, the loader
//! interface to the authoritative catalog, and the per-process cache.

pub mod cache;
pub mod chunk;
pub mod loader;
pub mod routing;
pub mod version;

pub use cache::{CatalogCache, CatalogCacheStatsSnapshot, CollectionRoutingInfo};
pub use chunk::{Chunk, ChunkRange, KeyBound};
pub use loader::{
    CatalogCacheLoader, CollectionAndChangedChunks, DatabaseType, InMemoryConfigCatalog,
};
pub use routing::RoutingTable;
pub use version::ChunkVersion;
