use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use fs4::fs_std::FileExt;
use memmap2::{Mmap, MmapMut};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::header::{SampleFileHeader, ODB_MAGIC, ODB_VERSION};
use crate::OdbError;

/// One slot of the node array: a key, its accumulated count, and the index
/// of the next node in the same bucket chain (0 terminates).
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct OdbNode {
    pub key: u64,
    pub value: u32,
    pub next: u32,
}

const NODE_SIZE: usize = 16;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
struct OdbDescriptor {
    /// Allocated node slots, including the index-0 sentinel.
    capacity: u32,
    /// Index of the first unused node slot; starts at 1.
    next_free: u32,
    /// Power of two.
    bucket_count: u32,
    reserved: [u32; 5],
}

const DESCR_OFFSET: usize = SampleFileHeader::SIZE;
const DESCR_SIZE: usize = 32;
const BUCKET_OFFSET: usize = DESCR_OFFSET + DESCR_SIZE;

/// Initial node capacity of a fresh database.
pub const DEFAULT_CAPACITY: u32 = 2048;

static OPEN_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Number of currently open databases in this process. The sample-file
/// manager consults this when deciding how hard to evict.
pub fn open_count() -> usize {
    OPEN_COUNT.load(Ordering::Relaxed)
}

fn node_offset(bucket_count: u32) -> usize {
    BUCKET_OFFSET + bucket_count as usize * 4
}

fn file_size(capacity: u32, bucket_count: u32) -> usize {
    node_offset(bucket_count) + capacity as usize * NODE_SIZE
}

/// The pinned key hash. Sample files persist across daemon runs, so this
/// must never change: splitmix64's finalizer, masked to the bucket count.
fn hash_key(key: u64) -> u64 {
    let mut h = key;
    h ^= h >> 30;
    h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 27;
    h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^= h >> 31;
    h
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OdbMode {
    ReadOnly,
    ReadWrite,
}

enum Map {
    /// A zero-length read-only file: iterates as empty.
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::Empty => &[],
            Map::ReadOnly(m) => m,
            Map::ReadWrite(m) => m,
        }
    }
}

/// A memory-mapped sample database: an associative `u64 -> u32` map with
/// insert-or-add and node-order iteration. Writable handles hold an
/// exclusive advisory lock on the underlying file for their lifetime.
pub struct Odb {
    file: File,
    map: Map,
    path: PathBuf,
}

fn io_err(path: &Path, source: io::Error) -> OdbError {
    if source.raw_os_error() == Some(libc::EMFILE) {
        OdbError::TooManyOpenFiles
    } else {
        OdbError::Io { path: path.to_owned(), source }
    }
}

impl Odb {
    /// Open or create a sample database. Creation happens for a writable
    /// open of a missing or zero-length file; the caller is expected to
    /// fill in the header via [`set_header`] afterwards.
    ///
    /// Running out of file descriptors is reported as the distinguished
    /// [`OdbError::TooManyOpenFiles`] so the caller can evict and retry.
    ///
    /// [`set_header`]: Odb::set_header
    pub fn open(path: &Path, mode: OdbMode) -> Result<Odb, OdbError> {
        let file = match mode {
            OdbMode::ReadOnly => File::open(path).map_err(|e| io_err(path, e))?,
            OdbMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| io_err(path, e))?,
        };

        if mode == OdbMode::ReadWrite {
            match file.try_lock_exclusive() {
                Ok(true) => {}
                Ok(false) => {
                    return Err(OdbError::Locked { path: path.to_owned() });
                }
                Err(e) => return Err(io_err(path, e)),
            }
        }

        let len = file.metadata().map_err(|e| io_err(path, e))?.len() as usize;

        let map = match (mode, len) {
            (OdbMode::ReadOnly, 0) => Map::Empty,
            (OdbMode::ReadOnly, _) => {
                let m = unsafe { Mmap::map(&file) }.map_err(|e| io_err(path, e))?;
                Map::ReadOnly(m)
            }
            (OdbMode::ReadWrite, 0) => {
                let size = file_size(DEFAULT_CAPACITY, DEFAULT_CAPACITY);
                file.set_len(size as u64).map_err(|e| io_err(path, e))?;
                let mut m = unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err(path, e))?;
                let header = SampleFileHeader::default();
                m[..SampleFileHeader::SIZE].copy_from_slice(header.as_bytes());
                let descr = OdbDescriptor {
                    capacity: DEFAULT_CAPACITY,
                    next_free: 1,
                    bucket_count: DEFAULT_CAPACITY,
                    reserved: [0; 5],
                };
                m[DESCR_OFFSET..DESCR_OFFSET + DESCR_SIZE].copy_from_slice(descr.as_bytes());
                Map::ReadWrite(m)
            }
            (OdbMode::ReadWrite, _) => {
                let m = unsafe { MmapMut::map_mut(&file) }.map_err(|e| io_err(path, e))?;
                Map::ReadWrite(m)
            }
        };

        // Counted before validation: the Drop impl decrements either way.
        OPEN_COUNT.fetch_add(1, Ordering::Relaxed);
        let odb = Odb { file, map, path: path.to_owned() };
        odb.validate()?;
        Ok(odb)
    }

    fn validate(&self) -> Result<(), OdbError> {
        let bytes = self.map.bytes();
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() < BUCKET_OFFSET {
            return Err(self.corrupt("file shorter than header"));
        }
        let header = self.header();
        if header.magic != ODB_MAGIC || header.version != ODB_VERSION {
            return Err(OdbError::VersionMismatch { path: self.path.clone() });
        }
        let descr = self.descr();
        if descr.capacity == 0
            || !descr.bucket_count.is_power_of_two()
            || descr.next_free == 0
            || descr.next_free > descr.capacity
        {
            return Err(self.corrupt("bad descriptor"));
        }
        if bytes.len() < file_size(descr.capacity, descr.bucket_count) {
            return Err(self.corrupt("file shorter than node array"));
        }
        Ok(())
    }

    fn corrupt(&self, reason: &'static str) -> OdbError {
        OdbError::Corrupt { path: self.path.clone(), reason }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> SampleFileHeader {
        let bytes = self.map.bytes();
        if bytes.len() < SampleFileHeader::SIZE {
            return SampleFileHeader::default();
        }
        SampleFileHeader::read_from_bytes(&bytes[..SampleFileHeader::SIZE]).unwrap()
    }

    pub fn set_header(&mut self, header: &SampleFileHeader) -> Result<(), OdbError> {
        match &mut self.map {
            Map::ReadWrite(m) => {
                m[..SampleFileHeader::SIZE].copy_from_slice(header.as_bytes());
                Ok(())
            }
            _ => Err(OdbError::ReadOnly),
        }
    }

    fn descr(&self) -> OdbDescriptor {
        let bytes = self.map.bytes();
        OdbDescriptor::read_from_bytes(&bytes[DESCR_OFFSET..DESCR_OFFSET + DESCR_SIZE]).unwrap()
    }

    fn set_descr(&mut self, descr: &OdbDescriptor) {
        if let Map::ReadWrite(m) = &mut self.map {
            m[DESCR_OFFSET..DESCR_OFFSET + DESCR_SIZE].copy_from_slice(descr.as_bytes());
        }
    }

    fn bucket(&self, b: u32) -> u32 {
        let off = BUCKET_OFFSET + b as usize * 4;
        u32::read_from_bytes(&self.map.bytes()[off..off + 4]).unwrap()
    }

    fn set_bucket(&mut self, b: u32, idx: u32) {
        let off = BUCKET_OFFSET + b as usize * 4;
        if let Map::ReadWrite(m) = &mut self.map {
            m[off..off + 4].copy_from_slice(idx.as_bytes());
        }
    }

    fn node(&self, bucket_count: u32, idx: u32) -> OdbNode {
        let off = node_offset(bucket_count) + idx as usize * NODE_SIZE;
        OdbNode::read_from_bytes(&self.map.bytes()[off..off + NODE_SIZE]).unwrap()
    }

    fn set_node(&mut self, bucket_count: u32, idx: u32, node: &OdbNode) {
        let off = node_offset(bucket_count) + idx as usize * NODE_SIZE;
        if let Map::ReadWrite(m) = &mut self.map {
            m[off..off + NODE_SIZE].copy_from_slice(node.as_bytes());
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        if self.map.bytes().is_empty() {
            return 0;
        }
        (self.descr().next_free - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `delta` to the count stored under `key`, creating the entry if
    /// needed. Counts saturate at `u32::MAX`.
    pub fn insert(&mut self, key: u64, delta: u32) -> Result<(), OdbError> {
        if !matches!(self.map, Map::ReadWrite(_)) {
            return Err(OdbError::ReadOnly);
        }

        let mut descr = self.descr();
        let b = (hash_key(key) & (descr.bucket_count - 1) as u64) as u32;

        let mut idx = self.bucket(b);
        while idx != 0 {
            let mut node = self.node(descr.bucket_count, idx);
            if node.key == key {
                node.value = node.value.saturating_add(delta);
                self.set_node(descr.bucket_count, idx, &node);
                return Ok(());
            }
            idx = node.next;
        }

        if descr.next_free == descr.capacity {
            self.grow()?;
            descr = self.descr();
        }

        // The bucket count may have changed during growth.
        let b = (hash_key(key) & (descr.bucket_count - 1) as u64) as u32;
        let new_idx = descr.next_free;
        let node = OdbNode { key, value: delta, next: self.bucket(b) };
        self.set_node(descr.bucket_count, new_idx, &node);
        self.set_bucket(b, new_idx);
        descr.next_free += 1;
        self.set_descr(&descr);
        Ok(())
    }

    /// Double the node array. The bucket directory keeps its
    /// capacity-proportional size, so it grows too; the node bytes are
    /// shifted up wholesale and every live node is rehashed. Node indices
    /// are unchanged, so values returned by earlier lookups stay valid.
    fn grow(&mut self) -> Result<(), OdbError> {
        let old = self.descr();
        let new_capacity = old.capacity.checked_mul(2).ok_or(OdbError::Full)?;
        let new_bucket_count = new_capacity.next_power_of_two();

        let old_node_off = node_offset(old.bucket_count);
        let new_node_off = node_offset(new_bucket_count);
        let used_node_bytes = old.next_free as usize * NODE_SIZE;
        let new_size = file_size(new_capacity, new_bucket_count);

        // Remap at the new size before moving anything.
        self.map = Map::Empty;
        self.file
            .set_len(new_size as u64)
            .map_err(|e| io_err(&self.path, e))?;
        let mut m = unsafe { MmapMut::map_mut(&self.file) }.map_err(|e| io_err(&self.path, e))?;

        m.copy_within(old_node_off..old_node_off + used_node_bytes, new_node_off);
        m[BUCKET_OFFSET..new_node_off].fill(0);

        let descr = OdbDescriptor {
            capacity: new_capacity,
            next_free: old.next_free,
            bucket_count: new_bucket_count,
            reserved: [0; 5],
        };
        m[DESCR_OFFSET..DESCR_OFFSET + DESCR_SIZE].copy_from_slice(descr.as_bytes());
        self.map = Map::ReadWrite(m);

        for idx in 1..old.next_free {
            let mut node = self.node(new_bucket_count, idx);
            let b = (hash_key(node.key) & (new_bucket_count - 1) as u64) as u32;
            node.next = self.bucket(b);
            self.set_node(new_bucket_count, idx, &node);
            self.set_bucket(b, idx);
        }
        Ok(())
    }

    /// Iterate all entries in node-array order (not key order). The borrow
    /// prevents mutation for the iterator's lifetime.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let (bucket_count, next_free) = if self.map.bytes().is_empty() {
            (1, 1)
        } else {
            let d = self.descr();
            (d.bucket_count, d.next_free)
        };
        (1..next_free).map(move |idx| {
            let node = self.node(bucket_count, idx);
            (node.key, node.value)
        })
    }

    /// Ask the OS to write dirty pages back. Not a durability fence.
    pub fn sync(&self) -> Result<(), OdbError> {
        match &self.map {
            Map::ReadWrite(m) => m.flush_async().map_err(|e| io_err(&self.path, e)),
            _ => Ok(()),
        }
    }
}

impl Drop for Odb {
    fn drop(&mut self) {
        OPEN_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}
