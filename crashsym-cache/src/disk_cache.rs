use std::fs;
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytesize::ByteSize;
use crashsym_table::ModuleKey;

use crate::artifact::SymbolArtifact;
use crate::entry_file;
use crate::error::CacheError;
use crate::file_creation::create_file_cleanly;
use crate::inventory::{EntryInfo, Inventory, PinGuard};
use crate::observer::CacheObserver;
use crate::single_flight::{Admission, SingleFlight};

const ENTRY_EXTENSION: &str = "entry";

/// The result of a fetch-parse-store flight, handed to everyone waiting for
/// the same key.
#[derive(Debug, Clone)]
pub enum FlightOutcome {
    /// The owner produced an artifact (and tried to store it).
    Ready(SymbolArtifact),
    /// The owner could not reach the symbol servers. Nothing was stored.
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct DiskCacheConfig {
    root: PathBuf,
    max_total_size: Option<u64>,
    max_age: Option<Duration>,
    negative_ttl: Duration,
}

impl DiskCacheConfig {
    /// The cache will own `<root>/staging` and `<root>/committed`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_total_size: None,
            max_age: None,
            negative_ttl: Duration::from_secs(60 * 60),
        }
    }

    /// Evict least-recently-used entries when the committed entries exceed
    /// this many bytes.
    pub fn max_total_size(mut self, max_total_size: Option<u64>) -> Self {
        self.max_total_size = max_total_size;
        self
    }

    /// Evict entries which haven't been read for this long.
    pub fn max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// How long `Missing` and `Invalid` entries stay valid.
    pub fn negative_ttl(mut self, negative_ttl: Duration) -> Self {
        self.negative_ttl = negative_ttl;
        self
    }
}

/// A cache entry that was read from disk. The entry stays pinned, i.e. it
/// won't be evicted, for as long as this handle is alive.
#[derive(Debug)]
pub struct CachedArtifact {
    artifact: SymbolArtifact,
    created_at: SystemTime,
    _pin: PinGuard,
}

impl CachedArtifact {
    pub fn artifact(&self) -> &SymbolArtifact {
        &self.artifact
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

impl Deref for CachedArtifact {
    type Target = SymbolArtifact;

    fn deref(&self) -> &SymbolArtifact {
        &self.artifact
    }
}

/// A durable cache of symbol artifacts, keyed by [`ModuleKey`].
///
/// Entries live in `<root>/committed/<debug_file>/<DEBUG_ID>.entry`. Writes
/// go through `<root>/staging` and are renamed into place, so readers never
/// see partial entries.
pub struct DiskCache {
    staging_dir: PathBuf,
    committed_dir: PathBuf,
    max_total_size: Option<u64>,
    max_age: Option<Duration>,
    negative_ttl: Duration,
    inventory: Arc<Mutex<Inventory>>,
    flights: SingleFlight<FlightOutcome>,
    observer: Option<Arc<dyn CacheObserver>>,
}

impl DiskCache {
    /// Opens the cache, creating its directories if needed.
    ///
    /// Leftover files in the staging directory come from writers that died
    /// mid-write and are deleted. The committed entries are scanned to seed
    /// the inventory.
    pub fn open(config: DiskCacheConfig) -> Result<Self, CacheError> {
        let DiskCacheConfig {
            root,
            max_total_size,
            max_age,
            negative_ttl,
        } = config;
        let staging_dir = root.join("staging");
        let committed_dir = root.join("committed");

        purge_staging_dir(&staging_dir)?;
        fs::create_dir_all(&committed_dir)
            .map_err(|e| CacheError::DirectoryCreation(committed_dir.clone(), e))?;

        let mut inventory = Inventory::new();
        let mut existing = list_existing_entries_sync(&committed_dir, negative_ttl);
        existing.sort_by_key(|entry| entry.last_access_time);
        for entry in existing {
            inventory.on_existing_entry_found(
                entry.key,
                entry.size_in_bytes,
                entry.created_at,
                entry.last_access_time,
            );
        }
        log::info!(
            "Opened symbol cache at {:?} with {} entries ({})",
            root,
            inventory.entry_count(),
            ByteSize(inventory.total_size_in_bytes())
        );

        Ok(Self {
            staging_dir,
            committed_dir,
            max_total_size,
            max_age,
            negative_ttl,
            inventory: Arc::new(Mutex::new(inventory)),
            flights: SingleFlight::new(),
            observer: None,
        })
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn CacheObserver>>) {
        self.observer = observer;
    }

    pub fn entry_path(&self, key: &ModuleKey) -> PathBuf {
        self.committed_dir
            .join(key.debug_file())
            .join(format!("{}.{ENTRY_EXTENSION}", key.debug_id_string()))
    }

    /// The total size of all committed entries, as tracked by the inventory.
    pub fn total_size(&self) -> u64 {
        self.inventory.lock().unwrap().total_size_in_bytes()
    }

    /// Looks up `key`. Expired negative entries and unreadable entries are
    /// reported as absent (and removed).
    pub async fn get(&self, key: &ModuleKey) -> Option<CachedArtifact> {
        let entry = self.get_quiet(key).await;
        if let Some(observer) = &self.observer {
            match &entry {
                Some(entry) => observer.on_cache_hit(key, entry.artifact()),
                None => observer.on_cache_miss(key),
            }
        }
        entry
    }

    /// Like [`DiskCache::get`], but without telling the observer. For
    /// re-checking a key that the caller already counted as a miss.
    pub async fn get_quiet(&self, key: &ModuleKey) -> Option<CachedArtifact> {
        let pin = PinGuard::new(&self.inventory, key);
        let path = self.entry_path(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Could not read cache entry {:?}: {}", path, e);
                }
                self.inventory.lock().unwrap().on_entry_deleted(key);
                return None;
            }
        };

        let (artifact, created_at) = match entry_file::decode(&data) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Discarding unreadable cache entry {:?}: {}", path, e);
                drop(pin);
                self.remove_entry_if_unchanged(key, &data).await;
                return None;
            }
        };

        let now = SystemTime::now();
        if artifact.is_negative() && self.is_expired(created_at, now) {
            log::debug!("Negative cache entry for {} has expired", key);
            drop(pin);
            self.remove_entry_if_unchanged(key, &data).await;
            return None;
        }

        self.inventory
            .lock()
            .unwrap()
            .on_entry_accessed(key, data.len() as u64, created_at, now);
        Some(CachedArtifact {
            artifact,
            created_at,
            _pin: pin,
        })
    }

    /// Stores `artifact` under `key`, replacing any existing entry. Returns the
    /// size of the committed entry.
    ///
    /// After a successful write, entries are evicted if the cache has grown
    /// beyond its limits.
    pub async fn put(
        &self,
        key: &ModuleKey,
        artifact: &SymbolArtifact,
    ) -> Result<u64, CacheError> {
        let pin = PinGuard::new(&self.inventory, key);
        let created_at = SystemTime::now();
        let data = entry_file::encode(artifact, created_at);
        let dest_path = self.entry_path(key);

        if let Err(e) = create_file_cleanly(&self.staging_dir, &dest_path, &data).await {
            log::error!("Could not write cache entry for {}: {}", key, e);
            if let Some(observer) = &self.observer {
                observer.on_cache_write_failed(key, &e);
            }
            return Err(e);
        }

        let size = data.len() as u64;
        self.inventory
            .lock()
            .unwrap()
            .on_entry_created(key.clone(), size, created_at);
        log::debug!(
            "Stored {} entry for {} ({})",
            artifact.kind_name(),
            key,
            ByteSize(size)
        );

        self.enforce_limits().await;
        drop(pin);
        Ok(size)
    }

    /// Single-flight admission for `key`. The returned ticket keeps `key`
    /// pinned until it is completed or dropped.
    pub fn begin_or_join(&self, key: &ModuleKey) -> Admission<FlightOutcome> {
        match self.flights.begin_or_join(key) {
            Admission::Exclusive(mut ticket) => {
                ticket.pin = Some(PinGuard::new(&self.inventory, key));
                Admission::Exclusive(ticket)
            }
            wait => wait,
        }
    }

    /// Removes the entry for `key`. Returns whether there was one.
    pub async fn invalidate(&self, key: &ModuleKey) -> Result<bool, CacheError> {
        self.inventory.lock().unwrap().on_entry_deleted(key);
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                log::info!("Invalidated cache entry for {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CacheError::Deletion(path, e)),
        }
    }

    fn is_expired(&self, created_at: SystemTime, now: SystemTime) -> bool {
        match now.duration_since(created_at) {
            Ok(age) => age >= self.negative_ttl,
            // Created in the future, i.e. the clock went backwards.
            Err(_) => false,
        }
    }

    /// Removes the entry for `key` if the file still holds `seen`. A writer
    /// may have renamed a fresh entry into place since `seen` was read.
    async fn remove_entry_if_unchanged(&self, key: &ModuleKey, seen: &[u8]) {
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(current) if current == seen => {}
            Ok(_) => {
                log::debug!("Cache entry for {} was replaced, keeping it", key);
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.inventory.lock().unwrap().on_entry_deleted(key);
                return;
            }
            Err(e) => {
                log::error!("Could not read cache entry {:?}: {}", path, e);
                return;
            }
        }
        if let Err(e) = self.invalidate(key).await {
            log::error!("{}", e);
        }
    }

    async fn enforce_limits(&self) {
        // Enforce max age first, and size limit second.
        // Entries older than the max age need to be deleted anyway, which
        // may already free up enough space.
        if let Some(max_age) = self.max_age {
            let to_delete = match SystemTime::now().checked_sub(max_age) {
                Some(cutoff_time) => self
                    .inventory
                    .lock()
                    .unwrap()
                    .get_entries_last_accessed_before(cutoff_time),
                None => vec![],
            };
            self.evict(to_delete).await;
        }

        if let Some(max_total_size) = self.max_total_size {
            let to_delete = self
                .inventory
                .lock()
                .unwrap()
                .get_entries_to_delete_to_enforce_max_size(max_total_size);
            if !to_delete.is_empty() {
                log::info!(
                    "Cache size {} exceeds the limit of {}, evicting {} entries",
                    ByteSize(self.total_size()),
                    ByteSize(max_total_size),
                    to_delete.len()
                );
            }
            self.evict(to_delete).await;
        }
    }

    async fn evict(&self, entries: Vec<EntryInfo>) {
        for info in entries {
            // The inventory decides; the file is deleted after the lock is
            // released.
            if !self.inventory.lock().unwrap().take_for_eviction(&info) {
                continue;
            }
            let path = self.entry_path(&info.key);
            log::info!(
                "Evicting cache entry {:?} ({})",
                path,
                ByteSize(info.size_in_bytes)
            );
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::error!("Error when deleting {:?}: {}", path, e);
                    continue;
                }
            }
            if let Some(observer) = &self.observer {
                observer.on_cache_eviction(&info.key, info.size_in_bytes);
            }
        }
    }
}

fn purge_staging_dir(staging_dir: &Path) -> Result<(), CacheError> {
    match fs::remove_dir_all(staging_dir) {
        Ok(()) => log::debug!("Purged staging directory {:?}", staging_dir),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(CacheError::StagingCleanup(staging_dir.to_path_buf(), e)),
    }
    fs::create_dir_all(staging_dir)
        .map_err(|e| CacheError::DirectoryCreation(staging_dir.to_path_buf(), e))
}

struct ExistingEntry {
    key: ModuleKey,
    size_in_bytes: u64,
    created_at: SystemTime,
    last_access_time: SystemTime,
}

/// Walks `<committed>/<debug_file>/<DEBUG_ID>.entry`. Negative entries that
/// have already expired are deleted on the way.
fn list_existing_entries_sync(
    committed_dir: &Path,
    negative_ttl: Duration,
) -> Vec<ExistingEntry> {
    let now = SystemTime::now();
    let mut entries = Vec::new();
    let module_dirs = match fs::read_dir(committed_dir) {
        Ok(dirs) => dirs,
        Err(e) => {
            log::error!("Failed to read directory {:?}: {}", committed_dir, e);
            return entries;
        }
    };
    for module_dir in module_dirs.flatten() {
        let module_path = module_dir.path();
        if !module_path.is_dir() {
            continue;
        }
        let debug_file = module_dir.file_name().to_string_lossy().into_owned();
        let files = match fs::read_dir(&module_path) {
            Ok(files) => files,
            Err(e) => {
                log::error!("Failed to read directory {:?}: {}", module_path, e);
                continue;
            }
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(debug_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Ok(key) = ModuleKey::new(debug_file.as_str(), debug_id) else {
                log::warn!("Ignoring unexpected file {:?} in the cache", path);
                continue;
            };
            let (size_in_bytes, header, last_access_time) = match read_entry_info(&path) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("Ignoring unreadable cache entry {:?}: {}", path, e);
                    continue;
                }
            };
            let expired =
                matches!(now.duration_since(header.created_at), Ok(age) if age >= negative_ttl);
            if header.is_negative && expired {
                if let Err(e) = fs::remove_file(&path) {
                    log::error!("Error when deleting {:?}: {}", path, e);
                }
                continue;
            }
            entries.push(ExistingEntry {
                key,
                size_in_bytes,
                created_at: header.created_at,
                last_access_time,
            });
        }
    }
    entries
}

fn read_entry_info(
    path: &Path,
) -> Result<(u64, entry_file::EntryHeader, SystemTime), Box<dyn std::error::Error>> {
    let mut file = fs::File::open(path)?;
    let metadata = file.metadata()?;
    let mut header = [0; entry_file::HEADER_LEN];
    file.read_exact(&mut header)?;
    let header = entry_file::decode_header(&header)?;
    let last_access_time = metadata
        .accessed()
        .ok()
        .filter(|accessed| *accessed >= header.created_at)
        .unwrap_or(header.created_at);
    Ok((metadata.len(), header, last_access_time))
}
