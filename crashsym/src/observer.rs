use std::time::Duration;

use crashsym_cache::{CacheError, CacheObserver, SymbolArtifact};
use crashsym_table::{ModuleKey, ParseError};

use crate::download_error::DownloadError;

/// A trait for observing the behavior of a [`Symbolicator`](crate::Symbolicator)
/// and its [`HttpFetcher`](crate::HttpFetcher). This can be used for logging
/// and metrics.
pub trait SymbolicationObserver: Send + Sync + 'static {
    /// Called when a symbol file was downloaded from `url`.
    fn on_fetch_succeeded(
        &self,
        key: &ModuleKey,
        url: &str,
        size_in_bytes: u64,
        duration: Duration,
    );

    /// Called for every failed attempt at `url`, including "not found"
    /// responses, which are the most common failure.
    fn on_fetch_failed(&self, key: &ModuleKey, url: &str, reason: &DownloadError);

    /// Called when a downloaded symbol file was parsed successfully.
    fn on_parse_succeeded(&self, key: &ModuleKey, symbol_count: usize, duration: Duration);

    /// Called when a downloaded symbol file could not be parsed. The module is
    /// cached as invalid.
    fn on_parse_failed(&self, key: &ModuleKey, error: &ParseError);

    /// Called at the end of every [`Symbolicator::resolve`](crate::Symbolicator::resolve) call.
    fn on_job_resolved(&self, frame_count: usize, module_count: usize, duration: Duration);
}

/// Logs every event with the `log` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SymbolicationObserver for LoggingObserver {
    fn on_fetch_succeeded(
        &self,
        key: &ModuleKey,
        url: &str,
        size_in_bytes: u64,
        duration: Duration,
    ) {
        log::info!(
            "Downloaded {} from {} ({} bytes in {:?})",
            key,
            url,
            size_in_bytes,
            duration
        );
    }

    fn on_fetch_failed(&self, key: &ModuleKey, url: &str, reason: &DownloadError) {
        if reason.is_not_found() {
            log::debug!("{} not found at {}: {}", key, url, reason);
        } else {
            log::warn!("Failed to download {} from {}: {}", key, url, reason);
        }
    }

    fn on_parse_succeeded(&self, key: &ModuleKey, symbol_count: usize, duration: Duration) {
        log::debug!(
            "Parsed {} with {} symbols in {:?}",
            key,
            symbol_count,
            duration
        );
    }

    fn on_parse_failed(&self, key: &ModuleKey, error: &ParseError) {
        log::error!("Could not parse the symbol file for {}: {}", key, error);
    }

    fn on_job_resolved(&self, frame_count: usize, module_count: usize, duration: Duration) {
        log::info!(
            "Resolved {} frames in {} modules in {:?}",
            frame_count,
            module_count,
            duration
        );
    }
}

impl CacheObserver for LoggingObserver {
    fn on_cache_hit(&self, key: &ModuleKey, artifact: &SymbolArtifact) {
        log::debug!("Cache hit for {} ({})", key, artifact.kind_name());
    }

    fn on_cache_miss(&self, key: &ModuleKey) {
        log::debug!("Cache miss for {}", key);
    }

    fn on_cache_eviction(&self, key: &ModuleKey, size_in_bytes: u64) {
        log::info!("Evicted {} ({} bytes) from the cache", key, size_in_bytes);
    }

    fn on_cache_write_failed(&self, key: &ModuleKey, error: &CacheError) {
        log::error!("Could not cache {}: {}", key, error);
    }
}
