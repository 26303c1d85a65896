// Content-addressed blob cache: per-user store plus a recency/size index.

pub mod index;
pub mod store;

pub use index::{CacheIndexEntry, MAX_ENTRIES};
pub use store::{BlobMeta, CacheUsage, CachedBlob, ContentCache};
