use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crashsym_table::ModuleKey;

/// Keeps track of the committed cache entries (size, creation time, last
/// access) and of which keys are currently pinned.
///
/// You tell the inventory when entries are added / deleted / accessed.
///
/// When the time comes to enforce a limit on the total size or max age,
/// you can ask it for a list of entries to delete. Pinned entries are never
/// part of that list.
///
/// The inventory never touches files. It just stores and queries information.
#[derive(Debug, Default)]
pub struct Inventory {
    entries: HashMap<ModuleKey, EntryInfo>,
    pins: HashMap<ModuleKey, usize>,
    total_size: u64,
    /// Incremented on every access; gives a strict LRU order even when
    /// several accesses share a timestamp.
    access_counter: u64,
}

/// Information about an entry that `Inventory` keeps track of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: ModuleKey,
    pub size_in_bytes: u64,
    pub created_at: SystemTime,
    pub last_access_time: SystemTime,
    access_order: u64,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifies the inventory that an entry has been created or replaced.
    pub fn on_entry_created(&mut self, key: ModuleKey, size_in_bytes: u64, created_at: SystemTime) {
        self.insert(key, size_in_bytes, created_at, created_at);
    }

    /// Adds an entry that was found on disk when the cache was opened.
    ///
    /// Call this in order of increasing `last_access_time`.
    pub fn on_existing_entry_found(
        &mut self,
        key: ModuleKey,
        size_in_bytes: u64,
        created_at: SystemTime,
        last_access_time: SystemTime,
    ) {
        self.insert(key, size_in_bytes, created_at, last_access_time);
    }

    /// Notifies the inventory that an entry has been read.
    ///
    /// Entries that are read without being known (for example because another
    /// process created them) are added.
    pub fn on_entry_accessed(
        &mut self,
        key: &ModuleKey,
        size_in_bytes: u64,
        created_at: SystemTime,
        access_time: SystemTime,
    ) {
        self.access_counter += 1;
        let access_order = self.access_counter;
        match self.entries.get_mut(key) {
            Some(info) => {
                info.last_access_time = access_time;
                info.access_order = access_order;
            }
            None => self.insert(key.clone(), size_in_bytes, created_at, access_time),
        }
    }

    /// Notifies the inventory that an entry has been deleted, or that no entry
    /// file has been observed for this key.
    pub fn on_entry_deleted(&mut self, key: &ModuleKey) -> Option<EntryInfo> {
        let info = self.entries.remove(key)?;
        self.total_size -= info.size_in_bytes;
        Some(info)
    }

    /// Removes the entry for eviction, but only if it is still the entry that
    /// was picked for eviction and nobody has pinned it since.
    pub fn take_for_eviction(&mut self, picked: &EntryInfo) -> bool {
        let unchanged = matches!(
            self.entries.get(&picked.key),
            Some(info)
                if info.created_at == picked.created_at
                    && info.access_order == picked.access_order
        );
        if !unchanged || self.is_pinned(&picked.key) {
            return false;
        }
        self.on_entry_deleted(&picked.key);
        true
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the total size of all tracked entries. This only uses the
    /// information stored in the inventory, it doesn't look at the file system.
    pub fn total_size_in_bytes(&self) -> u64 {
        self.total_size
    }

    pub fn is_pinned(&self, key: &ModuleKey) -> bool {
        self.pins.contains_key(key)
    }

    fn pin(&mut self, key: &ModuleKey) {
        *self.pins.entry(key.clone()).or_insert(0) += 1;
    }

    fn unpin(&mut self, key: &ModuleKey) {
        if let Some(count) = self.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(key);
            }
        }
    }

    fn insert(
        &mut self,
        key: ModuleKey,
        size_in_bytes: u64,
        created_at: SystemTime,
        last_access_time: SystemTime,
    ) {
        self.access_counter += 1;
        let info = EntryInfo {
            key: key.clone(),
            size_in_bytes,
            created_at,
            last_access_time,
            access_order: self.access_counter,
        };
        if let Some(old) = self.entries.insert(key, info) {
            self.total_size -= old.size_in_bytes;
        }
        self.total_size += size_in_bytes;
    }

    fn unpinned_entries_lru_first(&self) -> Vec<EntryInfo> {
        let mut entries: Vec<EntryInfo> = self
            .entries
            .values()
            .filter(|info| !self.is_pinned(&info.key))
            .cloned()
            .collect();
        entries.sort_unstable_by_key(|info| info.access_order);
        entries
    }

    /// Returns a list of entries. Deleting all the listed entries will reduce
    /// the total size below `max_size_bytes`, unless pinned entries alone
    /// exceed it.
    pub fn get_entries_to_delete_to_enforce_max_size(&self, max_size_bytes: u64) -> Vec<EntryInfo> {
        let total_size = self.total_size_in_bytes();
        if total_size <= max_size_bytes {
            // Nothing needs to be deleted.
            return vec![];
        }
        let mut excess_bytes = total_size - max_size_bytes;

        // Add entries to a list until we've accumulated enough size.
        let mut entries_to_delete = vec![];
        let mut freed_bytes = 0;
        for info in self.unpinned_entries_lru_first() {
            freed_bytes += info.size_in_bytes;
            entries_to_delete.push(info);
            if freed_bytes >= excess_bytes {
                break;
            }
        }

        // Now we know: Deleting all entries in `entries_to_delete` frees up
        // enough space (or as much as we can).
        // But it may free up more space than necessary! There might be some really
        // big entries at the end of the list, making it unnecessary to delete some
        // of the smaller, less recently accessed entries near the start of the list.
        if freed_bytes > excess_bytes {
            let mut available_bytes = freed_bytes - excess_bytes;

            // Visit the most-recently used entries first.
            entries_to_delete.reverse();
            entries_to_delete.retain(|info| {
                if info.size_in_bytes <= available_bytes {
                    // This entry can stay.
                    available_bytes -= info.size_in_bytes;
                    false
                } else {
                    true
                }
            });
        } else {
            excess_bytes -= freed_bytes;
            if excess_bytes > 0 {
                log::warn!(
                    "Cannot get below the size limit: {} bytes are held by pinned entries",
                    excess_bytes
                );
            }
        }

        // Delete the largest entries first.
        entries_to_delete.sort_unstable_by_key(|info| {
            (std::cmp::Reverse(info.size_in_bytes), info.access_order)
        });
        entries_to_delete
    }

    /// Returns all unpinned entries whose last access time is older than
    /// `cutoff_time`.
    pub fn get_entries_last_accessed_before(&self, cutoff_time: SystemTime) -> Vec<EntryInfo> {
        self.unpinned_entries_lru_first()
            .into_iter()
            .filter(|info| info.last_access_time < cutoff_time)
            .collect()
    }
}

/// Keeps a key pinned in the inventory for as long as it is alive.
#[derive(Debug)]
pub struct PinGuard {
    inventory: Arc<Mutex<Inventory>>,
    key: ModuleKey,
}

impl PinGuard {
    pub fn new(inventory: &Arc<Mutex<Inventory>>, key: &ModuleKey) -> Self {
        inventory.lock().unwrap().pin(key);
        Self {
            inventory: Arc::clone(inventory),
            key: key.clone(),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Ok(mut inventory) = self.inventory.lock() {
            inventory.unpin(&self.key);
        }
    }
}
