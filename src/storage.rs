use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::cache::BlockFile;

/// Failure of the durable backend. The cache wraps these with the name of
/// the failing step before surfacing them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("already exists")]
    AlreadyExists,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// One dirty part handed to the backing store by the flusher.
#[derive(Debug, Clone)]
pub struct PartUpload {
    pub block_id: String,
    pub name: String,
    pub part_idx: usize,
    pub data: Bytes,
}

/// Durable backend behind the cache.
///
/// The cache owns no persistent state of its own: descriptors live under
/// `(block_id, name)` and payload parts under `(block_id, name, part_idx)`.
/// `write_cache_entry` must be atomic with respect to other observers of
/// the same store.
#[async_trait]
pub trait BlockStorage: Send + Sync {
    /// Insert a freshly created descriptor. Fails
    /// [`StorageError::AlreadyExists`] when the key is taken.
    async fn insert_file(&self, file: &BlockFile) -> StorageResult<()>;

    /// Remove a descriptor and all of its parts. Removing an absent file is
    /// not an error.
    async fn delete_file(&self, block_id: &str, name: &str) -> StorageResult<()>;

    async fn get_file(&self, block_id: &str, name: &str) -> StorageResult<Option<BlockFile>>;

    async fn list_files(&self, block_id: &str) -> StorageResult<Vec<BlockFile>>;

    async fn list_namespaces(&self) -> StorageResult<Vec<String>>;

    async fn list_file_names(&self, block_id: &str) -> StorageResult<Vec<String>>;

    /// Fetch the requested parts; absent parts are simply missing from the
    /// returned map.
    async fn get_parts(
        &self,
        block_id: &str,
        name: &str,
        parts: &[usize],
    ) -> StorageResult<HashMap<usize, Bytes>>;

    /// Persist a flush batch: the descriptor when its buffer was dirty, and
    /// every selected part payload.
    async fn write_cache_entry(
        &self,
        file: Option<&BlockFile>,
        parts: &[PartUpload],
    ) -> StorageResult<()>;
}

#[derive(Default)]
struct MemoryTables {
    files: HashMap<(String, String), BlockFile>,
    parts: HashMap<(String, String, usize), Bytes>,
}

/// In-memory [`BlockStorage`], the default backend and the one the tests
/// run against. Descriptors and parts live in two maps behind one mutex,
/// which also makes `write_cache_entry` trivially atomic.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<MemoryTables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStorage for MemoryStorage {
    async fn insert_file(&self, file: &BlockFile) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        let key = (file.block_id.clone(), file.name.clone());
        if tables.files.contains_key(&key) {
            return Err(StorageError::AlreadyExists);
        }
        tables.files.insert(key, file.clone());
        Ok(())
    }

    async fn delete_file(&self, block_id: &str, name: &str) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .files
            .remove(&(block_id.to_string(), name.to_string()));
        tables
            .parts
            .retain(|(b, n, _), _| !(b == block_id && n == name));
        Ok(())
    }

    async fn get_file(&self, block_id: &str, name: &str) -> StorageResult<Option<BlockFile>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .files
            .get(&(block_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_files(&self, block_id: &str) -> StorageResult<Vec<BlockFile>> {
        let tables = self.tables.lock().await;
        let mut files: Vec<BlockFile> = tables
            .files
            .values()
            .filter(|f| f.block_id == block_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<String> = tables.files.keys().map(|(b, _)| b.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn list_file_names(&self, block_id: &str) -> StorageResult<Vec<String>> {
        let tables = self.tables.lock().await;
        let mut names: Vec<String> = tables
            .files
            .keys()
            .filter(|(b, _)| b == block_id)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get_parts(
        &self,
        block_id: &str,
        name: &str,
        parts: &[usize],
    ) -> StorageResult<HashMap<usize, Bytes>> {
        let tables = self.tables.lock().await;
        let mut rtn = HashMap::new();
        for &part_idx in parts {
            let key = (block_id.to_string(), name.to_string(), part_idx);
            if let Some(data) = tables.parts.get(&key) {
                rtn.insert(part_idx, data.clone());
            }
        }
        Ok(rtn)
    }

    async fn write_cache_entry(
        &self,
        file: Option<&BlockFile>,
        parts: &[PartUpload],
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(file) = file {
            tables
                .files
                .insert((file.block_id.clone(), file.name.clone()), file.clone());
        }
        for part in parts {
            tables.parts.insert(
                (part.block_id.clone(), part.name.clone(), part.part_idx),
                part.data.clone(),
            );
        }
        Ok(())
    }
}

/// Directory-tree [`BlockStorage`]: one directory per file holding a
/// `meta.json` descriptor and `part_<idx>.bin` payload files. Path segments
/// are hex-encoded so arbitrary namespace and file names stay
/// filesystem-safe. Every write lands in a tmp sibling, is fsynced, and is
/// renamed into place; an internal RwLock keeps flush batches atomic with
/// respect to in-process readers.
pub struct FsStorage {
    root: PathBuf,
    publish: RwLock<()>,
}

fn hex_encode(s: &str) -> String {
    s.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<String> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(s.len() / 2);
    for pair in s.as_bytes().chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        bytes.push((hi * 16 + lo) as u8);
    }
    String::from_utf8(bytes).ok()
}

async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let tmp = path.with_extension("tmp");
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut f = fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.sync_all().await?;
    drop(f);
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            publish: RwLock::new(()),
        }
    }

    fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    fn namespace_dir(&self, block_id: &str) -> PathBuf {
        self.blocks_dir().join(hex_encode(block_id))
    }

    fn file_dir(&self, block_id: &str, name: &str) -> PathBuf {
        self.namespace_dir(block_id).join(hex_encode(name))
    }

    fn meta_path(dir: &Path) -> PathBuf {
        dir.join("meta.json")
    }

    fn part_path(dir: &Path, part_idx: usize) -> PathBuf {
        dir.join(format!("part_{part_idx}.bin"))
    }

    async fn read_meta(path: &Path) -> StorageResult<Option<BlockFile>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl BlockStorage for FsStorage {
    async fn insert_file(&self, file: &BlockFile) -> StorageResult<()> {
        let _publish = self.publish.write().await;
        let dir = self.file_dir(&file.block_id, &file.name);
        let meta_path = Self::meta_path(&dir);
        if fs::try_exists(&meta_path).await? {
            return Err(StorageError::AlreadyExists);
        }
        write_atomic(&meta_path, &serde_json::to_vec(file)?).await
    }

    async fn delete_file(&self, block_id: &str, name: &str) -> StorageResult<()> {
        let _publish = self.publish.write().await;
        match fs::remove_dir_all(self.file_dir(block_id, name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_file(&self, block_id: &str, name: &str) -> StorageResult<Option<BlockFile>> {
        let _publish = self.publish.read().await;
        let dir = self.file_dir(block_id, name);
        Self::read_meta(&Self::meta_path(&dir)).await
    }

    async fn list_files(&self, block_id: &str) -> StorageResult<Vec<BlockFile>> {
        let _publish = self.publish.read().await;
        let ns_dir = self.namespace_dir(block_id);
        let mut rd = match fs::read_dir(&ns_dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if let Some(file) = Self::read_meta(&Self::meta_path(&entry.path())).await? {
                files.push(file);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<String>> {
        let _publish = self.publish.read().await;
        let mut rd = match fs::read_dir(self.blocks_dir()).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if let Some(block_id) = entry.file_name().to_str().and_then(hex_decode) {
                ids.push(block_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn list_file_names(&self, block_id: &str) -> StorageResult<Vec<String>> {
        let _publish = self.publish.read().await;
        let mut rd = match fs::read_dir(self.namespace_dir(block_id)).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            if let Some(name) = entry.file_name().to_str().and_then(hex_decode) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_parts(
        &self,
        block_id: &str,
        name: &str,
        parts: &[usize],
    ) -> StorageResult<HashMap<usize, Bytes>> {
        let _publish = self.publish.read().await;
        let dir = self.file_dir(block_id, name);
        let mut rtn = HashMap::new();
        for &part_idx in parts {
            match fs::read(Self::part_path(&dir, part_idx)).await {
                Ok(data) => {
                    rtn.insert(part_idx, Bytes::from(data));
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(rtn)
    }

    async fn write_cache_entry(
        &self,
        file: Option<&BlockFile>,
        parts: &[PartUpload],
    ) -> StorageResult<()> {
        let _publish = self.publish.write().await;
        for part in parts {
            let dir = self.file_dir(&part.block_id, &part.name);
            write_atomic(&Self::part_path(&dir, part.part_idx), &part.data).await?;
        }
        // descriptor last, so a committed size never precedes its payload
        if let Some(file) = file {
            let dir = self.file_dir(&file.block_id, &file.name);
            write_atomic(&Self::meta_path(&dir), &serde_json::to_vec(file)?).await?;
        }
        Ok(())
    }
}
