//! A durable on-disk cache for symbol artifacts.
//!
//! Entries are written to a private staging directory, flushed, and then
//! atomically renamed into the committed directory, so concurrent readers
//! (in this process or others) never see partial entries. Negative results
//! (`Missing`, `Invalid`) are cached too, with a shorter retention.
//!
//! The cache also hosts the single-flight registry: [`DiskCache::begin_or_join`]
//! makes sure that only one caller fetches and parses a given module at a
//! time, while the others wait for its outcome.
//!
//! Size and age limits are enforced after each write by evicting the
//! least-recently-used entries. Entries that are currently being read or
//! written are pinned and never evicted.

mod artifact;
mod disk_cache;
mod entry_file;
mod error;
mod file_creation;
mod inventory;
mod observer;
mod single_flight;

pub use artifact::SymbolArtifact;
pub use disk_cache::{CachedArtifact, DiskCache, DiskCacheConfig, FlightOutcome};
pub use error::{CacheError, EntryDecodeError};
pub use observer::CacheObserver;
pub use single_flight::{Admission, PendingFlight, SingleFlight, WriteTicket};
