use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::DEFAULT_KEY_LEN;
use crate::byte_store::ShardFile;
use crate::error::{Result, ShardError, UsageError};
use crate::format::{self, FORMAT_VERSION, HEADER_SIZE, Header, IndexRef, Layout, SlotStatus, SlotTag};
use crate::phf;

/// Where a [`Shard`] is in its open → load → close lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    Created,
    Loaded,
    Closed,
}

/// Facts recorded in the header at finalize time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub object_count: u64,
    pub key_len: usize,
    pub data_len: u64,
    pub bucket_count: u64,
    pub seed: u64,
}

struct LoadedShard {
    file: ShardFile,
    map: Mmap,
    header: Header,
    layout: Layout,
}

impl LoadedShard {
    fn view(&self, path: &Path) -> Result<IndexRef<'_>> {
        self.layout
            .view(&self.map)
            .map_err(|e| ShardError::integrity(path, format!("index region is unreadable: {e}")))
    }

    fn data(&self) -> &[u8] {
        // bounds were checked against the file length at load
        let start = self.header.data_offset as usize;
        &self.map[start..start + self.header.data_len as usize]
    }
}

enum ShardState {
    Created(ShardFile),
    Loaded(Box<LoadedShard>),
    Closed,
}

struct Resolved {
    slot: usize,
    tag: SlotTag,
    len: u64,
}

/// Read side of a finalized shard file.
///
/// Lookups are O(1): one hash, one displacement, one slot. The file is mapped
/// read-only and may be shared by any number of `Shard`s in any number of
/// processes. `delete` writes a tombstone into the slot in place.
///
/// ```no_run
/// use shardstore::Shard;
///
/// # fn main() -> shardstore::Result<()> {
/// let shard = Shard::<4>::open("objects.shard")?;
/// match shard.lookup(b"AAAA") {
///     Ok(object) => println!("{} bytes", object.len()),
///     Err(e) if e.is_not_found() => println!("absent"),
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
pub struct Shard<const K: usize = DEFAULT_KEY_LEN> {
    path: PathBuf,
    state: ShardState,
}

impl<const K: usize> Shard<K> {
    /// Opens the file handle without looking at its contents.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = ShardFile::open(&path).map_err(|e| ShardError::io(&path, e))?;
        Ok(Self {
            path,
            state: ShardState::Created(file),
        })
    }

    /// [`new`](Self::new) followed by [`load`](Self::load).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut shard = Self::new(path)?;
        shard.load()?;
        Ok(shard)
    }

    /// Opens and loads the shard, runs `f`, then closes it whether `f` succeeded or not.
    pub fn with_open<P, T, F>(path: P, f: F) -> Result<T>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let mut shard = Self::open(path)?;
        let result = f(&mut shard);
        let closed = match shard.phase() {
            ShardPhase::Closed => Ok(()),
            _ => shard.close(),
        };
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(close)) => {
                warn!(path = %shard.path.display(), error = %close, "could not close shard");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Tombstones `key` in the shard at `path`.
    pub fn delete_in<P: AsRef<Path>>(path: P, key: &[u8]) -> Result<()> {
        Self::with_open(path, |shard| shard.delete(key))
    }

    /// Length every key must have.
    pub const fn key_len() -> usize {
        K
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> ShardPhase {
        match self.state {
            ShardState::Created(_) => ShardPhase::Created,
            ShardState::Loaded(_) => ShardPhase::Loaded,
            ShardState::Closed => ShardPhase::Closed,
        }
    }

    /// Maps the file and checks that it is a finalized shard with `K`-byte keys.
    /// On failure the shard stays `Created`.
    pub fn load(&mut self) -> Result<()> {
        let file = match std::mem::replace(&mut self.state, ShardState::Closed) {
            ShardState::Created(file) => file,
            ShardState::Loaded(loaded) => {
                self.state = ShardState::Loaded(loaded);
                return Err(UsageError::AlreadyLoaded.into());
            }
            ShardState::Closed => return Err(UsageError::Closed.into()),
        };

        match self.validate(&file) {
            Ok((map, header, layout)) => {
                debug!(
                    path = %self.path.display(),
                    objects = header.object_count,
                    data_bytes = header.data_len,
                    writable = file.is_writable(),
                    "loaded shard"
                );
                self.state = ShardState::Loaded(Box::new(LoadedShard {
                    file,
                    map,
                    header,
                    layout,
                }));
                Ok(())
            }
            Err(e) => {
                self.state = ShardState::Created(file);
                Err(e)
            }
        }
    }

    fn validate(&self, file: &ShardFile) -> Result<(Mmap, Header, Layout)> {
        let integrity = |reason: String| ShardError::integrity(&self.path, reason);

        let file_len = file.len().map_err(|e| ShardError::io(&self.path, e))?;
        if file_len < HEADER_SIZE as u64 {
            return Err(integrity(format!(
                "file is {file_len} bytes, too small for a shard header"
            )));
        }
        let map = file.map().map_err(|e| ShardError::io(&self.path, e))?;
        let header = Header::read(&map)
            .ok_or_else(|| integrity("shard header is unreadable".to_string()))?;

        if !header.is_finalized() {
            return Err(integrity(
                "missing shard magic; the build was never finalized".to_string(),
            ));
        }
        if header.version != FORMAT_VERSION {
            return Err(integrity(format!(
                "unsupported format version {}",
                header.version
            )));
        }
        if header.key_len as usize != K {
            return Err(integrity(format!(
                "file holds {}-byte keys but the reader expects {K}",
                header.key_len
            )));
        }

        let object_count = usize::try_from(header.object_count)
            .ok()
            .filter(|&n| n <= u32::MAX as usize);
        let bucket_count = usize::try_from(header.bucket_count).ok();
        let layout = match (object_count, bucket_count) {
            (Some(n), Some(b)) if b <= n && (n == 0) == (b == 0) => Layout::new(n, b, K),
            _ => None,
        }
        .ok_or_else(|| {
            integrity(format!(
                "inconsistent counts: {} objects in {} buckets",
                header.object_count, header.bucket_count
            ))
        })?;

        if layout.data_offset as u64 != header.data_offset {
            return Err(integrity(format!(
                "data region starts at {} instead of {}",
                header.data_offset, layout.data_offset
            )));
        }
        match header.data_offset.checked_add(header.data_len) {
            Some(end) if end <= file_len => {}
            _ => {
                return Err(integrity(format!(
                    "data region of {} bytes runs past the end of the file ({file_len} bytes)",
                    header.data_len
                )));
            }
        }

        {
            let view = layout
                .view(&map)
                .map_err(|e| integrity(format!("index region is unreadable: {e}")))?;
            if format::checksum(&header, view.displacements, view.keys()) != header.checksum {
                return Err(integrity("index checksum mismatch".to_string()));
            }
        }

        Ok((map, header, layout))
    }

    fn loaded(&self) -> Result<&LoadedShard> {
        match &self.state {
            ShardState::Loaded(loaded) => Ok(loaded),
            ShardState::Created(_) => Err(UsageError::NotLoaded.into()),
            ShardState::Closed => Err(UsageError::Closed.into()),
        }
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.len() != K {
            return Err(UsageError::KeyLength {
                actual: key.len(),
                expected: K,
            }
            .into());
        }
        Ok(())
    }

    fn resolve(&self, loaded: &LoadedShard, key: &[u8]) -> Result<Resolved> {
        let view = loaded.view(&self.path)?;
        let slot = phf::slot_of(
            key,
            loaded.header.seed,
            view.displacements,
            loaded.layout.object_count,
        )
        .ok_or(ShardError::NotFound)?;

        let tag = view.load_tag(slot);
        match tag.status() {
            SlotStatus::Live => {}
            SlotStatus::Deleted => return Err(ShardError::NotFound),
            status @ (SlotStatus::Empty | SlotStatus::Reserved) => {
                return Err(ShardError::integrity(
                    &self.path,
                    format!("slot {slot} has status {status:?}"),
                ));
            }
        }

        let entry = &view.slots[slot];
        if entry.fingerprint != phf::fingerprint(key) {
            return Err(ShardError::NotFound);
        }
        if view.key_at(slot) != key {
            return Err(ShardError::integrity(
                &self.path,
                format!("slot {slot} resolves but holds a different key"),
            ));
        }

        Ok(Resolved {
            slot,
            tag,
            len: entry.len,
        })
    }

    /// The object stored under `key`, borrowed from the mapping.
    pub fn lookup(&self, key: &[u8]) -> Result<&[u8]> {
        let loaded = self.loaded()?;
        Self::check_key(key)?;
        let resolved = self.resolve(loaded, key)?;
        object_at(loaded.data(), resolved.tag, resolved.len).ok_or_else(|| {
            ShardError::integrity(
                &self.path,
                format!("object in slot {} runs past the data region", resolved.slot),
            )
        })
    }

    /// `lookup` as a membership test: `NotFound` becomes `false`, other errors pass through.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        match self.lookup(key) {
            Ok(_) => Ok(true),
            Err(ShardError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Marks `key` as removed. The object bytes stay where they are.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let loaded = self.loaded()?;
        Self::check_key(key)?;
        let resolved = self.resolve(loaded, key)?;

        let pos = loaded.layout.tag_position(resolved.slot);
        loaded
            .file
            .write_word_at(pos, resolved.tag.tombstone().into())
            .map_err(|e| ShardError::io(&self.path, e))?;
        debug!(path = %self.path.display(), slot = resolved.slot, "tombstoned key");
        Ok(())
    }

    /// Releases the mapping and the file handle. Terminal.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, ShardState::Closed) {
            ShardState::Closed => Err(UsageError::Closed.into()),
            _ => {
                debug!(path = %self.path.display(), "closed shard");
                Ok(())
            }
        }
    }

    pub fn info(&self) -> Result<ShardInfo> {
        let header = &self.loaded()?.header;
        Ok(ShardInfo {
            object_count: header.object_count,
            key_len: header.key_len as usize,
            data_len: header.data_len,
            bucket_count: header.bucket_count,
            seed: header.seed,
        })
    }

    /// Number of objects the shard was built with, deleted ones included.
    pub fn len(&self) -> Result<usize> {
        Ok(self.loaded()?.layout.object_count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Live `(key, object)` pairs in slot order.
    pub fn iter(&self) -> Result<ShardIter<'_>> {
        let loaded = self.loaded()?;
        Ok(ShardIter {
            view: loaded.view(&self.path)?,
            data: loaded.data(),
            path: &self.path,
            slot: 0,
        })
    }
}

fn object_at(data: &[u8], tag: SlotTag, len: u64) -> Option<&[u8]> {
    let start = usize::try_from(tag.offset()).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    data.get(start..end)
}

pub struct ShardIter<'a> {
    view: IndexRef<'a>,
    data: &'a [u8],
    path: &'a Path,
    slot: usize,
}

impl<'a> Iterator for ShardIter<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.view.slots.len() {
            let slot = self.slot;
            self.slot += 1;

            let tag = self.view.load_tag(slot);
            match tag.status() {
                SlotStatus::Live => {}
                SlotStatus::Deleted => continue,
                status => {
                    return Some(Err(ShardError::integrity(
                        self.path,
                        format!("slot {slot} has status {status:?}"),
                    )));
                }
            }

            let object = object_at(self.data, tag, self.view.slots[slot].len).ok_or_else(|| {
                ShardError::integrity(
                    self.path,
                    format!("object in slot {slot} runs past the data region"),
                )
            });
            return Some(object.map(|object| (self.view.key_at(slot), object)));
        }
        None
    }
}
