use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crashsym_cache::{
    Admission, CacheError, CacheObserver, DiskCache, DiskCacheConfig, FlightOutcome,
    SymbolArtifact, WriteTicket,
};
use crashsym_table::{parse_for_module, AddressTable, ModuleKey};
use futures_util::future::join_all;

use crate::config::{ConfigError, SymbolicatorConfig};
use crate::download_error::FetchError;
use crate::fetcher::{HttpFetcher, SymbolSource};
use crate::job::{InlineFrame, Job, JobResult, ModuleStatus, ResolvedFrame};
use crate::observer::SymbolicationObserver;

/// The error type for [`Symbolicator::new`].
#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What a job ended up with for one module.
#[derive(Debug, Clone)]
enum ModuleLoad {
    Found(Arc<AddressTable>),
    Missing,
    Invalid,
    Unavailable,
    TimedOut,
}

impl ModuleLoad {
    /// `None` for raw artifacts, which still need to be parsed.
    fn from_artifact(artifact: &SymbolArtifact) -> Option<Self> {
        match artifact {
            SymbolArtifact::Parsed(table) => Some(ModuleLoad::Found(Arc::clone(table))),
            SymbolArtifact::Missing => Some(ModuleLoad::Missing),
            SymbolArtifact::Invalid(_) => Some(ModuleLoad::Invalid),
            SymbolArtifact::Raw(_) => None,
        }
    }

    fn from_outcome(outcome: &FlightOutcome) -> Self {
        match outcome {
            FlightOutcome::Ready(artifact) => {
                Self::from_artifact(artifact).unwrap_or(ModuleLoad::Invalid)
            }
            FlightOutcome::Unavailable(_) => ModuleLoad::Unavailable,
        }
    }

    fn status(&self) -> ModuleStatus {
        match self {
            ModuleLoad::Found(_) => ModuleStatus::Found,
            ModuleLoad::Missing => ModuleStatus::Missing,
            ModuleLoad::Invalid => ModuleStatus::Invalid,
            ModuleLoad::Unavailable => ModuleStatus::Unavailable,
            ModuleLoad::TimedOut => ModuleStatus::TimedOut,
        }
    }
}

/// Resolves the frames of [`Job`]s to function names and source locations.
///
/// Symbol files are looked up in the [`DiskCache`] first. On a miss, exactly
/// one caller per module fetches the file from the [`SymbolSource`], parses
/// it and stores the result; every other caller that needs the same module
/// at the same time waits for that result. The fetch-parse-store work runs in
/// a spawned task, so it finishes for the waiters even if the caller that
/// started it goes away.
pub struct Symbolicator {
    cache: Arc<DiskCache>,
    source: Arc<dyn SymbolSource>,
    observer: Option<Arc<dyn SymbolicationObserver>>,
    job_timeout: Option<Duration>,
}

impl Symbolicator {
    /// Opens the cache and sets up an [`HttpFetcher`] for the configured
    /// mirrors.
    pub fn new(config: &SymbolicatorConfig) -> Result<Self, SetupError> {
        Self::build(config, None, None)
    }

    /// Like [`Symbolicator::new`], with an observer that sees cache, fetch
    /// and parse events.
    pub fn with_observer<O>(
        config: &SymbolicatorConfig,
        observer: Arc<O>,
    ) -> Result<Self, SetupError>
    where
        O: SymbolicationObserver + CacheObserver,
    {
        Self::build(config, Some(observer.clone()), Some(observer))
    }

    fn build(
        config: &SymbolicatorConfig,
        cache_observer: Option<Arc<dyn CacheObserver>>,
        observer: Option<Arc<dyn SymbolicationObserver>>,
    ) -> Result<Self, SetupError> {
        config.retry_policy.validate()?;
        let mut cache = DiskCache::open(
            DiskCacheConfig::new(config.cache_dir.clone())
                .max_total_size(config.cache_max_size)
                .max_age(config.cache_max_age)
                .negative_ttl(config.negative_ttl),
        )?;
        cache.set_observer(cache_observer);

        let mut fetcher = HttpFetcher::new(
            config.symbol_urls.clone(),
            config.attempt_timeout,
            config.retry_policy,
        );
        fetcher.set_observer(observer.clone());

        let mut symbolicator = Self::from_parts(cache, Arc::new(fetcher));
        symbolicator.set_observer(observer);
        symbolicator.set_job_timeout(config.job_timeout);
        Ok(symbolicator)
    }

    /// Uses an already-open cache and an arbitrary symbol source. No job
    /// timeout is set.
    pub fn from_parts(cache: DiskCache, source: Arc<dyn SymbolSource>) -> Self {
        Self {
            cache: Arc::new(cache),
            source,
            observer: None,
            job_timeout: None,
        }
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn SymbolicationObserver>>) {
        self.observer = observer;
    }

    pub fn set_job_timeout(&mut self, job_timeout: Option<Duration>) {
        self.job_timeout = job_timeout;
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Resolves every frame of every stack in `job`.
    ///
    /// This never fails: frames whose module is unknown, missing, invalid or
    /// unavailable come back unsymbolicated, and [`JobResult::modules`] says
    /// why.
    pub async fn resolve(&self, job: &Job) -> JobResult {
        let ts_start = Instant::now();

        let mut requested = vec![false; job.modules.len()];
        for frame in job.stacks.iter().flatten() {
            if let Some(index) = frame.module_index.filter(|index| *index < job.modules.len()) {
                requested[index] = true;
            }
        }

        let mut keys: Vec<&ModuleKey> = job
            .modules
            .iter()
            .zip(&requested)
            .filter(|(_, requested)| **requested)
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys.dedup();

        let deadline = self
            .job_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        let loads = join_all(keys.iter().map(|key| self.load_before(key, deadline))).await;
        let module_count = keys.len();
        let loaded: HashMap<&ModuleKey, ModuleLoad> = keys.into_iter().zip(loads).collect();

        // A key listed twice gets the same status for both entries.
        let modules = job
            .modules
            .iter()
            .map(|key| {
                loaded
                    .get(key)
                    .map_or(ModuleStatus::NotRequested, ModuleLoad::status)
            })
            .collect();

        let stacks = job
            .stacks
            .iter()
            .map(|stack| {
                stack
                    .iter()
                    .enumerate()
                    .map(|(frame_index, frame)| {
                        let Some(key) = job.module_for(frame) else {
                            return ResolvedFrame::unsymbolicated(
                                frame_index,
                                frame.module_offset,
                                None,
                            );
                        };
                        let module = Some(key.debug_file().to_string());
                        match loaded.get(key) {
                            Some(ModuleLoad::Found(table)) => {
                                symbolicate_frame(frame_index, frame.module_offset, module, table)
                            }
                            _ => ResolvedFrame::unsymbolicated(
                                frame_index,
                                frame.module_offset,
                                module,
                            ),
                        }
                    })
                    .collect()
            })
            .collect();

        if let Some(observer) = &self.observer {
            observer.on_job_resolved(job.frame_count(), module_count, ts_start.elapsed());
        }

        JobResult { stacks, modules }
    }

    async fn load_before(
        &self,
        key: &ModuleKey,
        deadline: Option<tokio::time::Instant>,
    ) -> ModuleLoad {
        let Some(deadline) = deadline else {
            return self.load_module(key).await;
        };
        match tokio::time::timeout_at(deadline, self.load_module(key)).await {
            Ok(load) => load,
            Err(_) => {
                log::warn!("Timed out while loading symbols for {}", key);
                ModuleLoad::TimedOut
            }
        }
    }

    async fn load_module(&self, key: &ModuleKey) -> ModuleLoad {
        loop {
            if let Some(entry) = self.cache.get(key).await {
                if let Some(load) = ModuleLoad::from_artifact(entry.artifact()) {
                    return load;
                }
                // A raw file; parse it in a flight, like a fresh download.
            }

            match self.cache.begin_or_join(key) {
                Admission::Exclusive(ticket) => {
                    let flight = Flight {
                        cache: Arc::clone(&self.cache),
                        source: Arc::clone(&self.source),
                        observer: self.observer.clone(),
                    };
                    // Detached: dropping the handle does not cancel the flight.
                    let handle = tokio::spawn(flight.run(key.clone(), ticket));
                    return match handle.await {
                        Ok(outcome) => ModuleLoad::from_outcome(&outcome),
                        Err(e) => {
                            log::error!("Loading symbols for {} failed: {}", key, e);
                            ModuleLoad::Unavailable
                        }
                    };
                }
                Admission::Wait(flight) => match flight.wait().await {
                    Some(outcome) => return ModuleLoad::from_outcome(&outcome),
                    None => {
                        log::debug!("Flight for {} was abandoned, starting over", key);
                    }
                },
            }
        }
    }
}

/// Everything the fetch-parse-store task needs, owned so that it can be
/// spawned.
struct Flight {
    cache: Arc<DiskCache>,
    source: Arc<dyn SymbolSource>,
    observer: Option<Arc<dyn SymbolicationObserver>>,
}

impl Flight {
    async fn run(self, key: ModuleKey, ticket: WriteTicket<FlightOutcome>) -> FlightOutcome {
        let outcome = self.produce(&key).await;
        ticket.complete(outcome.clone());
        outcome
    }

    async fn produce(&self, key: &ModuleKey) -> FlightOutcome {
        // Another flight may have finished between our cache miss and our
        // admission. The miss was already reported.
        let cached = self
            .cache
            .get_quiet(key)
            .await
            .map(|entry| entry.artifact().clone());
        let raw = match cached {
            Some(SymbolArtifact::Raw(bytes)) => bytes,
            Some(artifact) => return FlightOutcome::Ready(artifact),
            None => match self.source.fetch(key).await {
                Ok(bytes) => bytes,
                Err(FetchError::NotFoundAtAnyMirror) => {
                    log::info!("No symbol server has symbols for {}", key);
                    self.store(key, &SymbolArtifact::Missing).await;
                    return FlightOutcome::Ready(SymbolArtifact::Missing);
                }
                Err(e @ FetchError::TransportError(_)) => {
                    log::warn!("Could not fetch symbols for {}: {}", key, e);
                    return FlightOutcome::Unavailable(e.to_string());
                }
            },
        };

        let artifact = self.parse(key, &raw);
        self.store(key, &artifact).await;
        FlightOutcome::Ready(artifact)
    }

    fn parse(&self, key: &ModuleKey, raw: &Bytes) -> SymbolArtifact {
        let ts_start = Instant::now();
        match parse_for_module(raw, key) {
            Ok(table) => {
                if let Some(observer) = &self.observer {
                    observer.on_parse_succeeded(key, table.symbol_count(), ts_start.elapsed());
                }
                SymbolArtifact::Parsed(Arc::new(table))
            }
            Err(e) => {
                if let Some(observer) = &self.observer {
                    observer.on_parse_failed(key, &e);
                }
                SymbolArtifact::Invalid(e.to_string())
            }
        }
    }

    /// A failed write is not fatal; the artifact is still used for this job.
    async fn store(&self, key: &ModuleKey, artifact: &SymbolArtifact) {
        if let Err(e) = self.cache.put(key, artifact).await {
            log::warn!("Continuing without caching {}: {}", key, e);
        }
    }
}

fn symbolicate_frame(
    frame_index: usize,
    module_offset: u64,
    module: Option<String>,
    table: &AddressTable,
) -> ResolvedFrame {
    let Some(lookup) = table.lookup(module_offset) else {
        return ResolvedFrame::unsymbolicated(frame_index, module_offset, module);
    };
    let outer = lookup.outer_frame();
    ResolvedFrame {
        frame: frame_index,
        module_offset,
        module,
        function: Some(outer.function.to_string()),
        function_offset: Some(lookup.function_offset),
        file: outer.file.map(ToOwned::to_owned),
        line: outer.line,
        inlines: lookup
            .inlined_frames()
            .iter()
            .map(|frame| InlineFrame {
                function: frame.function.to_string(),
                file: frame.file.map(ToOwned::to_owned),
                line: frame.line,
            })
            .collect(),
    }
}
