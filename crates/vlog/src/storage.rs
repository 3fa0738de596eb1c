//! Storage traits and implementations

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Result;

/// Random-access byte storage, the backing of the oplog and of
/// [`FlatNodeStore`](crate::FlatNodeStore).
pub trait RandomAccess: Send + Sync {
    /// Read up to `len` bytes at `offset`. Returns fewer bytes when the
    /// storage ends first.
    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>>;
    /// Write `data` at `offset`, zero-filling any gap past the current end.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn truncate(&mut self, len: u64) -> Result<()>;
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory byte storage. Clones share the same bytes, so a clone handed
/// to a second opener behaves like reopening a file.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RandomAccess for MemoryStorage {
    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let data = self.data.read();
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(len) as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

/// File-backed byte storage.
pub struct FileStorage {
    file: RwLock<File>,
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file: RwLock::new(file) })
    }
}

impl RandomAccess for FileStorage {
    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        // Seeking needs &mut File, so reads take the write side of the lock.
        let mut file = self.file.write();
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset);
        let mut buf = vec![0u8; len as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        let file = self.file.get_mut();
        file.set_len(len)?;
        file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }
}

/// Block payload storage, keyed by sequence position.
pub trait BlockStore: Send + Sync {
    fn get(&self, index: u64) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, index: u64, value: &[u8]) -> Result<()>;
    /// Remove `length` blocks starting at `start`.
    fn del(&mut self, start: u64, length: u64) -> Result<()>;

    fn put_batch(&mut self, start: u64, values: &[Vec<u8>]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.put(start + i as u64, value)?;
        }
        Ok(())
    }
}

/// In-memory block storage (for testing and demos)
#[derive(Clone, Default)]
pub struct InMemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<u64, Vec<u8>>>>,
}

impl InMemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(&index).cloned())
    }

    fn put(&mut self, index: u64, value: &[u8]) -> Result<()> {
        self.blocks.write().insert(index, value.to_vec());
        Ok(())
    }

    fn del(&mut self, start: u64, length: u64) -> Result<()> {
        let mut blocks = self.blocks.write();
        let end = start.saturating_add(length);
        let doomed: Vec<u64> = blocks.range(start..end).map(|(i, _)| *i).collect();
        for index in doomed {
            blocks.remove(&index);
        }
        Ok(())
    }
}
