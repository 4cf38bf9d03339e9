//! blockstore
//!
//! A write-through cache for partitioned block files, backed by a pluggable
//! durable store, focused on:
//! - absorbing all writes in memory and flushing them on a cadence
//! - copy-on-write buffers so the flusher drains to storage without
//!   blocking writers
//! - circular files whose retained payload wraps modulo a fixed window
//! - concurrency via DashMap for the entry registry, with per-buffer
//!   dirty/flushing flags coordinating writers and the flusher
//! - Prometheus metrics, and simple YAML-based configuration
//!
//! This is not a read cache: reads are served from resident pages when
//! possible and fall through to the backing store otherwise. The cache
//! exists to absorb writes.
//!
//! Configuration keys (top-level, parsed by this crate):
//! - `block-store-part-size`: bytes per part (default 64 KiB)
//! - `block-store-flush-interval-ms`: flush cadence (default 5000)
//! - `block-store-disk-root`: root directory for [`FsStorage`] data
//!   (env fallback: `BLOCK_STORE_DIR`)
//!
//! Metrics exported:
//! - counters: `block_store_cache_hits_total`, `block_store_cache_misses_total`,
//!   `block_store_flushed_entries_total`, `block_store_flushed_parts_total`,
//!   `block_store_flush_errors_total`
//! - gauges: `block_store_cache_entries`
//! - histogram: `block_store_flush_seconds`

mod cache;
pub mod config;
mod storage;

pub use cache::{BlockFile, FileMeta, FileOpts, WriteIntention};
pub use config::{BlockStoreBuilder, BlockStoreConfig};
pub use storage::{
    BlockStorage, FsStorage, MemoryStorage, PartUpload, StorageError, StorageResult,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::warn;
use once_cell::sync::Lazy;
use prometheus::{
    Histogram, IntCounter, IntGauge, register_histogram, register_int_counter, register_int_gauge,
};
use thiserror::Error;

use cache::{now_ms, CacheEntry, CacheKey, FileBuffer, PartBuffer};

/// Bytes per part unless overridden through the builder.
pub const DEFAULT_PART_SIZE: i64 = 64 * 1024;
/// Cadence of the background flusher.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

// Prometheus metrics
static MET_CACHE_HITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("block_store_cache_hits_total", "Total metadata cache hits").unwrap()
});
static MET_CACHE_MISSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "block_store_cache_misses_total",
        "Total metadata cache misses"
    )
    .unwrap()
});
static MET_FLUSHED_ENTRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "block_store_flushed_entries_total",
        "Entries written to the backing store by flush passes"
    )
    .unwrap()
});
static MET_FLUSHED_PARTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "block_store_flushed_parts_total",
        "Parts written to the backing store by flush passes"
    )
    .unwrap()
});
static MET_FLUSH_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "block_store_flush_errors_total",
        "Per-entry flush failures left for the next pass"
    )
    .unwrap()
});
static GAUGE_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("block_store_cache_entries", "Number of resident cache entries").unwrap()
});
static HIST_FLUSH_SECS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("block_store_flush_seconds", "Latency of flush passes in seconds").unwrap()
});

/// Failure modes of the public operations.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("file exists")]
    FileExists,
    #[error("file is deleted but has active requests")]
    FileBusy,
    #[error("file not found")]
    NotFound,
    #[error("file is deleted")]
    FileDeleted,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{context}: {source}")]
    BackingStore {
        context: &'static str,
        #[source]
        source: StorageError,
    },
}

pub type BlockStoreResult<T> = std::result::Result<T, BlockStoreError>;

fn backing(context: &'static str) -> impl FnOnce(StorageError) -> BlockStoreError {
    move |source| BlockStoreError::BackingStore { context, source }
}

/// Write-through cache over a [`BlockStorage`] backend.
///
/// All writes land in resident buffers and are drained to the backend by
/// the flusher; reads overlay resident pages on whatever the backend
/// returns. Entry registration, pins, intentions and buffer slot
/// assignments are serialized per key by the registry's shard guards.
pub struct BlockStore {
    cache: DashMap<CacheKey, CacheEntry>,
    storage: Arc<dyn BlockStorage>,
    /// Monotonic id source for write intentions; 0 stays the "no entry"
    /// sentinel.
    next_intention_id: AtomicU64,
    part_size: i64,
    flush_interval: Duration,
    stop_flush: AtomicBool,
    /// Serializes flush passes: overlapping passes could clear each other's
    /// flags out of order.
    flush_lock: tokio::sync::Mutex<()>,
}

fn cache_key(block_id: &str, name: &str) -> CacheKey {
    CacheKey {
        block_id: block_id.to_string(),
        name: name.to_string(),
    }
}

/// Counted reference keeping a cache entry alive across backing-store I/O.
/// Dropping the guard unpins, so every exit path (including cancellation)
/// releases.
struct PinGuard<'a> {
    store: &'a BlockStore,
    key: CacheKey,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.store.unpin(&self.key);
    }
}

struct IntentionGuard<'a> {
    store: &'a BlockStore,
    key: CacheKey,
    intention_id: u64,
}

impl Drop for IntentionGuard<'_> {
    fn drop(&mut self) {
        if self.intention_id != 0 {
            self.store.clear_intention(&self.key, self.intention_id);
        }
    }
}

/// Cache-side view of a file descriptor.
enum CacheView {
    /// No entry for the key.
    Miss,
    /// Deep copy of the resident descriptor.
    Hit(BlockFile),
    /// Entry is marked deleted and still draining.
    Deleted,
    /// Entry exists (pinned or intended) but holds no descriptor yet.
    Unloaded,
}

enum FlushSelection {
    Missing,
    Clean,
    Batch {
        file: Option<Arc<FileBuffer>>,
        parts: Vec<Arc<PartBuffer>>,
    },
}

impl BlockStore {
    /// Create a store over `storage` with default part size and flush
    /// interval.
    pub fn new(storage: Arc<dyn BlockStorage>) -> Self {
        Self::builder().with_storage(storage).build()
    }

    /// Start a builder for advanced configuration.
    pub fn builder() -> BlockStoreBuilder {
        BlockStoreBuilder::new()
    }

    /// Create from a [`BlockStoreConfig`] (parsed from YAML) via the builder.
    pub fn from_config(cfg: &BlockStoreConfig, storage: Arc<dyn BlockStorage>) -> Self {
        let mut builder = BlockStoreBuilder::new().with_storage(storage);
        if let Some(part_size) = cfg.part_size {
            builder = builder.with_part_size(part_size);
        }
        if let Some(ms) = cfg.flush_interval_ms {
            builder = builder.with_flush_interval(Duration::from_millis(ms));
        }
        builder.build()
    }

    pub(crate) fn with_options(
        storage: Arc<dyn BlockStorage>,
        part_size: i64,
        flush_interval: Duration,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            storage,
            next_intention_id: AtomicU64::new(1),
            part_size,
            flush_interval,
            stop_flush: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn part_size(&self) -> i64 {
        self.part_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Number of resident cache entries.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    fn update_entries_gauge(&self) {
        GAUGE_ENTRIES.set(self.cache.len() as i64);
    }

    // ---- pins and intentions ----

    fn pin(&self, key: &CacheKey) -> PinGuard<'_> {
        match self.cache.entry(key.clone()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().pin_count += 1,
            Entry::Vacant(vacant) => {
                let mut entry = CacheEntry::new();
                entry.pin_count = 1;
                vacant.insert(entry);
            }
        }
        self.update_entries_gauge();
        PinGuard {
            store: self,
            key: key.clone(),
        }
    }

    fn unpin(&self, key: &CacheKey) {
        match self.cache.get_mut(key) {
            Some(mut entry) => {
                if entry.pin_count == 0 {
                    warn!(
                        "unpinning cache entry with zero pins {}/{}",
                        key.block_id, key.name
                    );
                } else {
                    entry.pin_count -= 1;
                }
            }
            None => warn!(
                "unpinning non-existent cache entry {}/{}",
                key.block_id, key.name
            ),
        }
    }

    /// Record a pending write against an existing entry; returns the
    /// sentinel 0 when there is no entry to attach it to.
    fn register_intention(&self, key: &CacheKey, intention: WriteIntention) -> u64 {
        match self.cache.get_mut(key) {
            Some(mut entry) => {
                let intention_id = self.next_intention_id.fetch_add(1, Ordering::Relaxed);
                entry.write_intentions.insert(intention_id, intention);
                intention_id
            }
            None => 0,
        }
    }

    fn clear_intention(&self, key: &CacheKey, intention_id: u64) {
        let Some(mut entry) = self.cache.get_mut(key) else {
            warn!(
                "cannot find write intention to clear {}/{}",
                key.block_id, key.name
            );
            return;
        };
        if entry.write_intentions.remove(&intention_id).is_none() {
            warn!(
                "cannot find write intention to clear {}/{}",
                key.block_id, key.name
            );
        }
    }

    fn intend(&self, key: &CacheKey, intention: WriteIntention) -> IntentionGuard<'_> {
        let intention_id = self.register_intention(key, intention);
        IntentionGuard {
            store: self,
            key: key.clone(),
            intention_id,
        }
    }

    /// Remove the entry if nothing pins it and no write intends to touch
    /// it. Absence counts as success.
    fn try_evict(&self, key: &CacheKey) -> bool {
        let removed = match self.cache.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().can_evict() => {
                occupied.remove();
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant(_) => true,
        };
        self.update_entries_gauge();
        removed
    }

    /// Run `f` with the entry guard held, requiring a live entry with
    /// loaded file metadata.
    fn with_existing<R>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry) -> BlockStoreResult<R>,
    ) -> BlockStoreResult<R> {
        let Some(mut entry) = self.cache.get_mut(key) else {
            return Err(BlockStoreError::NotFound);
        };
        if entry.deleted || entry.file.is_none() {
            return Err(BlockStoreError::NotFound);
        }
        f(&mut *entry)
    }

    fn file_from_cache(&self, key: &CacheKey) -> CacheView {
        let Some(entry) = self.cache.get(key) else {
            return CacheView::Miss;
        };
        if entry.deleted {
            return CacheView::Deleted;
        }
        match &entry.file {
            Some(file_buffer) => CacheView::Hit(file_buffer.file.clone()),
            None => CacheView::Unloaded,
        }
    }

    // ---- file lifecycle ----

    /// Create a new file. Fails `FileExists` for a live file and `FileBusy`
    /// for a deleted entry that still has pins or intentions. On
    /// backing-store failure the cache is unchanged.
    pub async fn make_file(
        &self,
        block_id: &str,
        name: &str,
        meta: FileMeta,
        mut opts: FileOpts,
    ) -> BlockStoreResult<()> {
        if opts.max_size < 0 {
            return Err(BlockStoreError::InvalidArgument(
                "max size must be non-negative".to_string(),
            ));
        }
        if opts.circular && opts.max_size <= 0 {
            return Err(BlockStoreError::InvalidArgument(
                "circular file must have a max size".to_string(),
            ));
        }
        if opts.circular && opts.ijson {
            return Err(BlockStoreError::InvalidArgument(
                "circular file cannot be ijson".to_string(),
            ));
        }
        if opts.circular && opts.max_size % self.part_size != 0 {
            opts.max_size = (opts.max_size / self.part_size + 1) * self.part_size;
        }
        match self.cache.entry(cache_key(block_id, name)) {
            Entry::Occupied(occupied) => {
                if !occupied.get().deleted {
                    return Err(BlockStoreError::FileExists);
                }
                if occupied.get().can_evict() {
                    occupied.remove();
                } else {
                    return Err(BlockStoreError::FileBusy);
                }
            }
            Entry::Vacant(_) => {}
        }
        self.update_entries_gauge();
        let now = now_ms();
        let file = BlockFile {
            block_id: block_id.to_string(),
            name: name.to_string(),
            opts,
            created_ts: now,
            size: 0,
            mod_ts: now,
            meta,
        };
        match self.storage.insert_file(&file).await {
            Ok(()) => Ok(()),
            Err(StorageError::AlreadyExists) => Err(BlockStoreError::FileExists),
            Err(err) => Err(backing("error inserting file")(err)),
        }
    }

    /// Delete a file from the backing store and the cache. An entry with
    /// active pins or intentions is marked deleted and drains later.
    pub async fn delete_file(&self, block_id: &str, name: &str) -> BlockStoreResult<()> {
        self.storage
            .delete_file(block_id, name)
            .await
            .map_err(backing("error deleting file"))?;
        match self.cache.entry(cache_key(block_id, name)) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().can_evict() {
                    occupied.remove();
                } else {
                    occupied.get_mut().deleted = true;
                }
            }
            Entry::Vacant(_) => {}
        }
        self.update_entries_gauge();
        Ok(())
    }

    /// Delete every file in a namespace.
    pub async fn delete_block(&self, block_id: &str) -> BlockStoreResult<()> {
        let names = self
            .storage
            .list_file_names(block_id)
            .await
            .map_err(backing("error getting block files"))?;
        for name in names {
            self.delete_file(block_id, &name).await?;
        }
        Ok(())
    }

    /// Cached descriptor when resident, otherwise the backing store's
    /// record. Never materializes a cache entry.
    pub async fn stat(&self, block_id: &str, name: &str) -> BlockStoreResult<BlockFile> {
        match self.file_from_cache(&cache_key(block_id, name)) {
            CacheView::Hit(file) => {
                MET_CACHE_HITS.inc();
                Ok(file)
            }
            CacheView::Deleted => Err(BlockStoreError::NotFound),
            CacheView::Miss | CacheView::Unloaded => {
                MET_CACHE_MISSES.inc();
                self.storage
                    .get_file(block_id, name)
                    .await
                    .map_err(backing("error getting file"))?
                    .ok_or(BlockStoreError::NotFound)
            }
        }
    }

    pub async fn get_all_block_ids(&self) -> BlockStoreResult<Vec<String>> {
        self.storage
            .list_namespaces()
            .await
            .map_err(backing("error getting block ids"))
    }

    /// List a namespace's files, washing each record through the cache: a
    /// resident descriptor replaces the stored one, and entries that are
    /// deleted or hold no descriptor drop out of the result.
    pub async fn list_files(&self, block_id: &str) -> BlockStoreResult<Vec<BlockFile>> {
        let files = self
            .storage
            .list_files(block_id)
            .await
            .map_err(backing("error getting block files"))?;
        let mut rtn = Vec::with_capacity(files.len());
        for stored in files {
            match self.file_from_cache(&cache_key(&stored.block_id, &stored.name)) {
                CacheView::Miss => rtn.push(stored),
                CacheView::Hit(file) => rtn.push(file),
                CacheView::Deleted | CacheView::Unloaded => {}
            }
        }
        Ok(rtn)
    }

    // ---- load paths ----

    /// Cache-or-fetch of the file descriptor; installs a buffer on miss.
    async fn load_file_info(&self, key: &CacheKey) -> BlockStoreResult<BlockFile> {
        match self.file_from_cache(key) {
            CacheView::Hit(file) => {
                MET_CACHE_HITS.inc();
                return Ok(file);
            }
            CacheView::Deleted => return Err(BlockStoreError::NotFound),
            CacheView::Miss | CacheView::Unloaded => {}
        }
        MET_CACHE_MISSES.inc();
        let stored = self
            .storage
            .get_file(&key.block_id, &key.name)
            .await
            .map_err(backing("error getting file"))?
            .ok_or(BlockStoreError::NotFound)?;
        // the entry may have been installed or deleted while we were
        // fetching; re-check under the guard
        let result = match self.cache.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.deleted {
                    Err(BlockStoreError::FileDeleted)
                } else if let Some(file_buffer) = &entry.file {
                    Ok(file_buffer.file.clone())
                } else {
                    entry.file = Some(Arc::new(FileBuffer::new(stored.clone())));
                    Ok(stored)
                }
            }
            Entry::Vacant(vacant) => {
                let mut entry = CacheEntry::new();
                entry.file = Some(Arc::new(FileBuffer::new(stored.clone())));
                vacant.insert(entry);
                Ok(stored)
            }
        };
        self.update_entries_gauge();
        result
    }

    async fn load_data_parts(&self, key: &CacheKey, parts: &[usize]) -> BlockStoreResult<()> {
        if parts.is_empty() {
            return Ok(());
        }
        let loaded = self
            .storage
            .get_parts(&key.block_id, &key.name, parts)
            .await
            .map_err(backing("error getting file parts"))?;
        let max_part = parts.iter().copied().max().unwrap_or(0);
        self.with_existing(key, |entry| {
            entry.install_loaded_parts(max_part, loaded);
            Ok(())
        })
    }

    /// Load only the file's trailing incomplete part, so an append does not
    /// overwrite the partially filled tail with zeros.
    async fn load_last_data_part(&self, key: &CacheKey) -> BlockStoreResult<()> {
        let part_size = self.part_size;
        let last = self.with_existing(key, |entry| {
            Ok(entry
                .file
                .as_ref()
                .and_then(|file_buffer| file_buffer.file.last_incomplete_part(part_size)))
        })?;
        match last {
            Some(part_idx) => self.load_data_parts(key, &[part_idx]).await,
            None => Ok(()),
        }
    }

    // ---- writes ----

    /// Update file metadata. With `merge`, `null` values delete their keys;
    /// otherwise the mapping is replaced wholesale.
    pub async fn write_meta(
        &self,
        block_id: &str,
        name: &str,
        meta: FileMeta,
        merge: bool,
    ) -> BlockStoreResult<()> {
        let key = cache_key(block_id, name);
        let _pin = self.pin(&key);
        self.load_file_info(&key).await?;
        self.with_existing(&key, |entry| {
            entry.modify_file(|file| {
                if merge {
                    for (meta_key, value) in meta {
                        if value.is_null() {
                            file.meta.remove(&meta_key);
                        } else {
                            file.meta.insert(meta_key, value);
                        }
                    }
                } else {
                    file.meta = meta;
                }
            });
            Ok(())
        })
    }

    /// Append bytes at the file's current size.
    pub async fn append_data(
        &self,
        block_id: &str,
        name: &str,
        data: &[u8],
    ) -> BlockStoreResult<()> {
        let key = cache_key(block_id, name);
        let _pin = self.pin(&key);
        let _intention = self.intend(&key, WriteIntention::Append);
        self.load_file_info(&key).await?;
        self.load_last_data_part(&key).await?;
        let part_size = self.part_size;
        self.with_existing(&key, |entry| {
            let offset = entry
                .file
                .as_ref()
                .map(|file_buffer| file_buffer.file.size)
                .unwrap_or(0);
            entry.write_at_to_cache(part_size, offset, data, false);
            Ok(())
        })
    }

    /// Replace the file's entire contents.
    pub async fn write_file(
        &self,
        block_id: &str,
        name: &str,
        data: &[u8],
    ) -> BlockStoreResult<()> {
        let key = cache_key(block_id, name);
        let _pin = self.pin(&key);
        let _intention = self.intend(&key, WriteIntention::Replace);
        self.load_file_info(&key).await?;
        let part_size = self.part_size;
        self.with_existing(&key, |entry| {
            entry.write_at_to_cache(part_size, 0, data, true);
            Ok(())
        })
    }

    /// Write at a fixed offset. The offset must lie within the current
    /// file size (no sparse holes). On circular files a write entirely
    /// behind the live window succeeds with no effect, and one straddling
    /// the window's start is trimmed to the retained range.
    pub async fn write_at(
        &self,
        block_id: &str,
        name: &str,
        mut offset: i64,
        data: &[u8],
    ) -> BlockStoreResult<()> {
        let key = cache_key(block_id, name);
        let _pin = self.pin(&key);
        let file = self.load_file_info(&key).await?;
        if offset < 0 {
            return Err(BlockStoreError::InvalidArgument(
                "offset must be non-negative".to_string(),
            ));
        }
        if offset > file.size {
            return Err(BlockStoreError::InvalidArgument(
                "offset is past the end of the file".to_string(),
            ));
        }
        let mut data = data;
        if file.opts.circular {
            let window_start = file.size - file.opts.max_size;
            if offset + (data.len() as i64) < window_start {
                return Ok(());
            }
            if offset < window_start {
                let before_window = (window_start - offset) as usize;
                offset = window_start;
                data = &data[before_window..];
            }
        }
        let part_size = self.part_size;
        let part_map = file.compute_part_map(part_size, offset, data.len() as i64);
        let _intention = self.intend(&key, WriteIntention::Parts(part_map.clone()));
        // complete parts get fully overwritten, only incomplete ones need
        // their current payload
        let incomplete: Vec<usize> = part_map
            .iter()
            .filter(|(_, &planned)| planned != part_size)
            .map(|(&part_idx, _)| part_idx)
            .collect();
        self.load_data_parts(&key, &incomplete).await?;
        self.with_existing(&key, |entry| {
            entry.write_at_to_cache(part_size, offset, data, false);
            Ok(())
        })
    }

    // ---- reads ----

    /// Overlay resident part payloads on top of a fetched map; returns the
    /// cache's view of the file size when a live descriptor is resident.
    fn overlay_cached_parts(
        &self,
        key: &CacheKey,
        parts_needed: &[usize],
        part_data: &mut HashMap<usize, Bytes>,
    ) -> Option<i64> {
        let entry = self.cache.get(key)?;
        if entry.deleted {
            return None;
        }
        let size = entry.file.as_ref().map(|file_buffer| file_buffer.file.size);
        for &part_idx in parts_needed {
            if let Some(Some(part)) = entry.parts.get(part_idx) {
                part_data.insert(part_idx, Bytes::copy_from_slice(&part.data));
            }
        }
        size
    }

    /// Read `size` bytes at `offset`, returning the offset actually read
    /// from along with the bytes. On a circular file a request larger than
    /// the retained window advances the offset to the oldest retained byte.
    /// Parts resident in neither the cache nor the backing store read as
    /// zeros.
    pub async fn read_at(
        &self,
        block_id: &str,
        name: &str,
        mut offset: i64,
        mut size: i64,
    ) -> BlockStoreResult<(i64, Bytes)> {
        let key = cache_key(block_id, name);
        let _pin = self.pin(&key);
        let file = self.stat(block_id, name).await?;
        if offset < 0 {
            return Err(BlockStoreError::InvalidArgument(
                "offset must be non-negative".to_string(),
            ));
        }
        if file.opts.circular && size > file.opts.max_size {
            // only max_size bytes are retained; read the tail of the request
            offset += size - file.opts.max_size;
        }
        let part_size = self.part_size;
        let mut parts_needed: Vec<usize> = Vec::new();
        if size > 0 {
            let first = offset / part_size;
            let last = (offset + size - 1) / part_size;
            for logical in first..=last {
                let part_idx = file.part_idx_at_offset(part_size, logical * part_size);
                if !parts_needed.contains(&part_idx) {
                    parts_needed.push(part_idx);
                }
            }
        }
        let mut part_data = self
            .storage
            .get_parts(block_id, name, &parts_needed)
            .await
            .map_err(backing("error loading data parts"))?;
        let cached_size = self.overlay_cached_parts(&key, &parts_needed, &mut part_data);
        // limit the read to live data, preferring the cache's size
        let live_size = cached_size.unwrap_or(file.size);
        if offset + size > live_size {
            size = live_size - offset;
        }
        let mut rtn: Vec<u8> = Vec::with_capacity(size.max(0) as usize);
        let mut amt_left = size;
        let mut read_offset = offset;
        while amt_left > 0 {
            let part_idx = file.part_idx_at_offset(part_size, read_offset);
            let part_offset = read_offset % part_size;
            let amt = (part_size - part_offset).min(amt_left);
            append_part_range(&mut rtn, part_data.get(&part_idx), part_offset, amt);
            amt_left -= amt;
            read_offset += amt;
        }
        Ok((offset, Bytes::from(rtn)))
    }

    /// Read the whole file: `read_at(0, size)` under the current `stat`.
    pub async fn read_file(&self, block_id: &str, name: &str) -> BlockStoreResult<(i64, Bytes)> {
        let file = self.stat(block_id, name).await?;
        self.read_at(block_id, name, 0, file.size).await
    }

    // ---- flushing ----

    fn dirty_cache_keys(&self) -> Vec<CacheKey> {
        let mut dirty_keys = Vec::new();
        for item in self.cache.iter() {
            let entry = item.value();
            let file_dirty = entry
                .file
                .as_ref()
                .map(|file_buffer| file_buffer.dirty.load(Ordering::SeqCst))
                .unwrap_or(false);
            let parts_dirty = entry
                .parts
                .iter()
                .flatten()
                .any(|part| part.dirty.load(Ordering::SeqCst));
            if file_dirty || parts_dirty {
                dirty_keys.push(item.key().clone());
            }
        }
        dirty_keys
    }

    /// Select one entry's dirty buffers and mark them flushing, all under
    /// the entry guard; the backing-store write happens without it.
    fn select_dirty(&self, key: &CacheKey) -> FlushSelection {
        let Some(entry) = self.cache.get(key) else {
            return FlushSelection::Missing;
        };
        if entry.deleted || entry.file.is_none() {
            return FlushSelection::Clean;
        }
        let file = entry
            .file
            .as_ref()
            .filter(|file_buffer| file_buffer.dirty.load(Ordering::SeqCst))
            .cloned();
        let parts: Vec<Arc<PartBuffer>> = entry
            .parts
            .iter()
            .flatten()
            .filter(|part| part.dirty.load(Ordering::SeqCst))
            .cloned()
            .collect();
        if file.is_none() && parts.is_empty() {
            return FlushSelection::Clean;
        }
        if let Some(file_buffer) = &file {
            file_buffer.flushing.store(true, Ordering::SeqCst);
        }
        for part in &parts {
            part.flushing.store(true, Ordering::SeqCst);
        }
        FlushSelection::Batch { file, parts }
    }

    async fn flush_entry(&self, key: &CacheKey) -> BlockStoreResult<()> {
        let (file, parts) = match self.select_dirty(key) {
            FlushSelection::Missing => return Ok(()),
            FlushSelection::Clean => {
                self.try_evict(key);
                return Ok(());
            }
            FlushSelection::Batch { file, parts } => (file, parts),
        };
        let uploads: Vec<PartUpload> = parts
            .iter()
            .map(|part| PartUpload {
                block_id: key.block_id.clone(),
                name: key.name.clone(),
                part_idx: part.part_idx,
                data: Bytes::copy_from_slice(&part.data),
            })
            .collect();
        let file_record = file.as_ref().map(|file_buffer| file_buffer.file.clone());
        self.storage
            .write_cache_entry(file_record.as_ref(), &uploads)
            .await
            .map_err(backing("error writing cache entry"))?;
        // on failure the flags stay set and the next pass retries; on
        // success they clear dirty-before-flushing (see cache.rs)
        if let Some(file_buffer) = &file {
            file_buffer.mark_clean();
        }
        for part in &parts {
            part.mark_clean();
        }
        MET_FLUSHED_ENTRIES.inc();
        MET_FLUSHED_PARTS.inc_by(uploads.len() as u64);
        Ok(())
    }

    /// Run one synchronous flush pass over every dirty entry. Per-entry
    /// failures are logged and left for the next pass; the pass itself
    /// never aborts early.
    pub async fn flush_cache(&self) -> BlockStoreResult<()> {
        let _pass = self.flush_lock.lock().await;
        let start = Instant::now();
        for key in self.dirty_cache_keys() {
            if let Err(err) = self.flush_entry(&key).await {
                MET_FLUSH_ERRORS.inc();
                warn!(
                    "error flushing cache entry {}/{}: {}",
                    key.block_id, key.name, err
                );
            }
        }
        HIST_FLUSH_SECS.observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Spawn the periodic flusher. The task runs a pass every
    /// `flush_interval` and exits on the first tick after
    /// [`BlockStore::stop_flusher`].
    pub fn start_flusher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if store.stop_flush.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = store.flush_cache().await {
                    warn!("flush pass failed: {err}");
                }
            }
        })
    }

    /// Ask the periodic flusher to stop after its current pass.
    pub fn stop_flusher(&self) {
        self.stop_flush.store(true, Ordering::SeqCst);
    }
}

fn append_part_range(out: &mut Vec<u8>, part: Option<&Bytes>, part_offset: i64, amt: i64) {
    let start = part_offset as usize;
    let end = (part_offset + amt) as usize;
    match part {
        Some(data) => {
            let copy_end = end.min(data.len());
            if start < copy_end {
                out.extend_from_slice(&data[start..copy_end]);
            }
            if copy_end < end {
                // short or absent tail reads as zeros
                out.resize(out.len() + (end - copy_end.max(start)), 0);
            }
        }
        None => out.resize(out.len() + (end - start), 0),
    }
}
