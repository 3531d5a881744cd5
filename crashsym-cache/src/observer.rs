use crashsym_table::ModuleKey;

use crate::artifact::SymbolArtifact;
use crate::error::CacheError;

/// A trait for observing the behavior of a [`DiskCache`](crate::DiskCache).
/// This can be used for logging and metrics.
pub trait CacheObserver: Send + Sync + 'static {
    /// Called when a lookup found a usable entry.
    fn on_cache_hit(&self, key: &ModuleKey, artifact: &SymbolArtifact);

    /// Called when a lookup found nothing, or only an expired or unreadable
    /// entry.
    fn on_cache_miss(&self, key: &ModuleKey);

    /// Called after an entry has been deleted to enforce the size or age limit.
    fn on_cache_eviction(&self, key: &ModuleKey, size_in_bytes: u64);

    /// Called when an entry could not be committed. The caller keeps using
    /// its in-memory artifact.
    fn on_cache_write_failed(&self, key: &ModuleKey, error: &CacheError);
}
