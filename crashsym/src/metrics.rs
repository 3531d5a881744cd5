use std::time::Duration;

use crashsym_cache::{CacheError, CacheObserver, SymbolArtifact};
use crashsym_table::{ModuleKey, ParseError};

use crate::download_error::DownloadError;
use crate::observer::SymbolicationObserver;

pub const CACHE_HIT: &str = "crashsym.cache.hit";
pub const CACHE_MISS: &str = "crashsym.cache.miss";
pub const CACHE_EVICTION: &str = "crashsym.cache.eviction";
pub const CACHE_WRITE_ERROR: &str = "crashsym.cache.write_error";
pub const FETCH_SUCCESS: &str = "crashsym.fetch.success";
pub const FETCH_FAILURE: &str = "crashsym.fetch.failure";
pub const PARSE_SUCCESS: &str = "crashsym.parse.success";
pub const PARSE_FAILURE: &str = "crashsym.parse.failure";
pub const JOB_RESOLVE_TIME: &str = "crashsym.job.resolve_time";

/// Where [`MetricsObserver`] sends its measurements, e.g. a statsd client.
pub trait MetricsSink: Send + Sync + 'static {
    fn incr(&self, name: &'static str, tags: &[(&'static str, &str)]);

    fn timing(&self, name: &'static str, value: Duration, tags: &[(&'static str, &str)]);
}

/// Translates observer events into named counters and timers.
pub struct MetricsObserver<S: MetricsSink> {
    sink: S,
}

impl<S: MetricsSink> MetricsObserver<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: MetricsSink> CacheObserver for MetricsObserver<S> {
    fn on_cache_hit(&self, _key: &ModuleKey, artifact: &SymbolArtifact) {
        self.sink.incr(CACHE_HIT, &[("kind", artifact.kind_name())]);
    }

    fn on_cache_miss(&self, _key: &ModuleKey) {
        self.sink.incr(CACHE_MISS, &[]);
    }

    fn on_cache_eviction(&self, _key: &ModuleKey, _size_in_bytes: u64) {
        self.sink.incr(CACHE_EVICTION, &[]);
    }

    fn on_cache_write_failed(&self, _key: &ModuleKey, _error: &CacheError) {
        self.sink.incr(CACHE_WRITE_ERROR, &[]);
    }
}

impl<S: MetricsSink> SymbolicationObserver for MetricsObserver<S> {
    fn on_fetch_succeeded(
        &self,
        _key: &ModuleKey,
        url: &str,
        _size_in_bytes: u64,
        _duration: Duration,
    ) {
        self.sink.incr(FETCH_SUCCESS, &[("mirror", mirror_of(url))]);
    }

    fn on_fetch_failed(&self, _key: &ModuleKey, url: &str, reason: &DownloadError) {
        let reason = if reason.is_not_found() {
            "not_found"
        } else {
            "transport"
        };
        self.sink.incr(
            FETCH_FAILURE,
            &[("mirror", mirror_of(url)), ("reason", reason)],
        );
    }

    fn on_parse_succeeded(&self, _key: &ModuleKey, _symbol_count: usize, _duration: Duration) {
        self.sink.incr(PARSE_SUCCESS, &[]);
    }

    fn on_parse_failed(&self, _key: &ModuleKey, _error: &ParseError) {
        self.sink.incr(PARSE_FAILURE, &[]);
    }

    fn on_job_resolved(&self, _frame_count: usize, _module_count: usize, duration: Duration) {
        self.sink.timing(JOB_RESOLVE_TIME, duration, &[]);
    }
}

/// The scheme and host part of a URL, so that tags don't contain one value
/// per module.
fn mirror_of(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        Some(slash) => &url[..after_scheme + slash],
        None => url,
    }
}
