use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File metadata map. Only top-level keys are ever reassigned; nested values
/// are treated as immutable snapshots, so a map clone is a deep copy.
pub type FileMeta = HashMap<String, Value>;

/// Creation options for a block file.
///
/// A circular file must have `max_size > 0` and cannot be ijson; its
/// `max_size` is rounded up to a multiple of the part size at creation.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOpts {
    #[serde(rename = "maxsize")]
    pub max_size: i64,
    #[serde(default)]
    pub circular: bool,
    #[serde(default)]
    pub ijson: bool,
}

/// Descriptor of a block file as held by the cache and the backing store.
///
/// `block_id`, `name`, `opts` and `created_ts` are static; `size`, `mod_ts`
/// and `meta` are mutable. For circular files `size` is a logical counter
/// that keeps growing past `opts.max_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFile {
    #[serde(rename = "blockid")]
    pub block_id: String,
    pub name: String,
    pub opts: FileOpts,
    #[serde(rename = "createdts")]
    pub created_ts: i64,
    pub size: i64,
    #[serde(rename = "modts")]
    pub mod_ts: i64,
    #[serde(default)]
    pub meta: FileMeta,
}

impl BlockFile {
    pub(crate) fn part_idx_at_offset(&self, part_size: i64, offset: i64) -> usize {
        let mut part_idx = offset / part_size;
        if self.opts.circular {
            let max_part = self.opts.max_size / part_size;
            part_idx %= max_part;
        }
        part_idx as usize
    }

    /// Part holding the byte at `size - 1`, when the tail part is not full.
    pub(crate) fn last_incomplete_part(&self, part_size: i64) -> Option<usize> {
        if self.size % part_size == 0 {
            None
        } else {
            Some(self.part_idx_at_offset(part_size, self.size))
        }
    }

    /// Bytes a write of `size` at `start_offset` would place into each part.
    /// A part is incomplete iff its planned count is less than `part_size`;
    /// only incomplete parts need loading before the write.
    pub(crate) fn compute_part_map(
        &self,
        part_size: i64,
        start_offset: i64,
        size: i64,
    ) -> HashMap<usize, i64> {
        let mut part_map = HashMap::new();
        let end_offset = start_offset + size;
        let mut test_offset = start_offset - (start_offset % part_size);
        while test_offset < end_offset {
            let part_idx = self.part_idx_at_offset(part_size, test_offset);
            let part_start = test_offset;
            let part_end = test_offset + part_size;
            let write_start = if start_offset > part_start && start_offset < part_end {
                start_offset - part_start
            } else {
                0
            };
            let write_end = if end_offset > part_start && end_offset < part_end {
                end_offset - part_start
            } else {
                part_size
            };
            part_map.insert(part_idx, write_end - write_start);
            test_offset += part_size;
        }
        part_map
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub block_id: String,
    pub name: String,
}

// `dirty` and `flushing` rules:
// - either flag may be set to true only while holding the entry's guard
// - the flusher clears them without the guard once it is done reading the
//   buffer, `dirty` strictly before `flushing`
// - everyone else tests `flushing` before `dirty`; a buffer with `flushing`
//   set is never written in place, it is detached and the slot replaced

/// One fixed-size region of a file's payload, at most `part_size` bytes.
#[derive(Debug)]
pub(crate) struct PartBuffer {
    pub part_idx: usize,
    pub dirty: AtomicBool,
    pub flushing: AtomicBool,
    pub data: Vec<u8>,
}

impl PartBuffer {
    pub(crate) fn new(part_idx: usize, part_size: i64) -> Self {
        Self {
            part_idx,
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            data: Vec::with_capacity(part_size as usize),
        }
    }

    /// A clean buffer holding payload fetched from the backing store.
    pub(crate) fn loaded(part_idx: usize, data: Bytes) -> Self {
        Self {
            part_idx,
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            data: data.to_vec(),
        }
    }

    /// Detached copy for a writer that found `flushing` set: payload and
    /// `dirty` carry over, `flushing` starts clear.
    fn detach(&self) -> Self {
        Self {
            part_idx: self.part_idx,
            dirty: AtomicBool::new(self.dirty.load(Ordering::SeqCst)),
            flushing: AtomicBool::new(false),
            data: self.data.clone(),
        }
    }

    fn write_at(&mut self, part_offset: i64, data: &[u8], part_size: i64) -> usize {
        let left_in_part = (part_size - part_offset) as usize;
        let to_write = data.len().min(left_in_part);
        let end = part_offset as usize + to_write;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[part_offset as usize..end].copy_from_slice(&data[..to_write]);
        self.dirty.store(true, Ordering::SeqCst);
        to_write
    }

    pub(crate) fn mark_clean(&self) {
        // dirty strictly before flushing: a racing writer either still sees
        // flushing=true and detaches, or sees both flags clear
        self.dirty.store(false, Ordering::SeqCst);
        self.flushing.store(false, Ordering::SeqCst);
    }
}

impl Clone for PartBuffer {
    // needed by Arc::make_mut; flag values carry over, the explicit detach
    // path runs first whenever `flushing` is set
    fn clone(&self) -> Self {
        Self {
            part_idx: self.part_idx,
            dirty: AtomicBool::new(self.dirty.load(Ordering::SeqCst)),
            flushing: AtomicBool::new(self.flushing.load(Ordering::SeqCst)),
            data: self.data.clone(),
        }
    }
}

/// Mutable image of the file descriptor, under the same flag rules as
/// [`PartBuffer`].
#[derive(Debug)]
pub(crate) struct FileBuffer {
    pub dirty: AtomicBool,
    pub flushing: AtomicBool,
    pub file: BlockFile,
}

impl FileBuffer {
    pub(crate) fn new(file: BlockFile) -> Self {
        Self {
            dirty: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            file,
        }
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
        self.flushing.store(false, Ordering::SeqCst);
    }
}

impl Clone for FileBuffer {
    fn clone(&self) -> Self {
        Self {
            dirty: AtomicBool::new(self.dirty.load(Ordering::SeqCst)),
            flushing: AtomicBool::new(self.flushing.load(Ordering::SeqCst)),
            file: self.file.clone(),
        }
    }
}

/// Shape of a pending write, registered before any backing-store I/O. An
/// intention keeps its entry alive and carries the planned per-part byte
/// counts for partial writes.
#[derive(Debug, Clone)]
pub enum WriteIntention {
    Append,
    Replace,
    Parts(HashMap<usize, i64>),
}

/// Per-(namespace, name) cache record.
///
/// Structural fields are only touched while holding the entry's map guard.
/// `file` may be absent while the entry is merely pinned; `parts` is sparse,
/// absent slots mean "not loaded".
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub pin_count: u32,
    pub deleted: bool,
    pub write_intentions: HashMap<u64, WriteIntention>,
    pub file: Option<Arc<FileBuffer>>,
    pub parts: Vec<Option<Arc<PartBuffer>>>,
}

impl CacheEntry {
    pub(crate) fn new() -> Self {
        Self {
            pin_count: 0,
            deleted: false,
            write_intentions: HashMap::new(),
            file: None,
            parts: Vec::new(),
        }
    }

    pub(crate) fn can_evict(&self) -> bool {
        self.pin_count == 0 && self.write_intentions.is_empty()
    }

    fn ensure_len(&mut self, len: usize) {
        if self.parts.len() < len {
            self.parts.resize_with(len, || None);
        }
    }

    /// Install fetched parts into empty slots only; a slot a writer already
    /// populated keeps its in-flight dirty data.
    pub(crate) fn install_loaded_parts(&mut self, max_part: usize, loaded: HashMap<usize, Bytes>) {
        self.ensure_len(max_part + 1);
        for (part_idx, data) in loaded {
            let slot = &mut self.parts[part_idx];
            if slot.is_none() {
                *slot = Some(Arc::new(PartBuffer::loaded(part_idx, data)));
            }
        }
    }

    fn ensure_part(&mut self, part_idx: usize, part_size: i64) -> &mut Arc<PartBuffer> {
        self.ensure_len(part_idx + 1);
        self.parts[part_idx].get_or_insert_with(|| Arc::new(PartBuffer::new(part_idx, part_size)))
    }

    /// Split a caller write across parts, detaching any buffer the flusher
    /// is currently draining. Requires loaded file metadata.
    fn write_at(&mut self, part_size: i64, mut offset: i64, mut data: &[u8], replace: bool) {
        if replace {
            self.parts.clear();
        }
        let (circular, max_part) = match &self.file {
            Some(fb) => (fb.file.opts.circular, fb.file.opts.max_size / part_size),
            None => return,
        };
        while !data.is_empty() {
            let mut part_idx = offset / part_size;
            if circular {
                part_idx %= max_part;
            }
            let part_offset = offset % part_size;
            let slot = self.ensure_part(part_idx as usize, part_size);
            if slot.flushing.load(Ordering::SeqCst) {
                *slot = Arc::new(slot.detach());
            }
            let written = Arc::make_mut(slot).write_at(part_offset, data, part_size);
            data = &data[written..];
            offset += written as i64;
        }
    }

    /// Mutate the file descriptor under the copy-on-write discipline and
    /// mark the buffer dirty.
    pub(crate) fn modify_file(&mut self, f: impl FnOnce(&mut BlockFile)) {
        let Some(slot) = self.file.as_mut() else {
            return;
        };
        if slot.flushing.load(Ordering::SeqCst) {
            *slot = Arc::new(FileBuffer::new(slot.file.clone()));
        }
        let fb = Arc::make_mut(slot);
        fb.dirty.store(true, Ordering::SeqCst);
        f(&mut fb.file);
    }

    /// Write payload and bump `size`/`mod_ts` accordingly. With `replace`
    /// the size is reset to exactly the write extent.
    pub(crate) fn write_at_to_cache(
        &mut self,
        part_size: i64,
        offset: i64,
        data: &[u8],
        replace: bool,
    ) {
        let end_write = offset + data.len() as i64;
        self.write_at(part_size, offset, data, replace);
        self.modify_file(|file| {
            if end_write > file.size || replace {
                file.size = end_write;
            }
            file.mod_ts = now_ms();
        });
    }
}
