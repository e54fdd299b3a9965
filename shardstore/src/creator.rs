use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::DEFAULT_KEY_LEN;
use crate::byte_store::IndexMap;
use crate::config::BuildConfig;
use crate::error::{Result, ShardError, UsageError};
use crate::format::{self, FORMAT_VERSION, HEADER_SIZE, Header, Layout, MAGIC, MAX_DATA_OFFSET, Slot};
use crate::phf;

/// Where a [`ShardCreator`] is in its prepare → write* → finalize lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Created,
    /// Prepared, nothing written yet.
    Preparing,
    Writing,
    Finalized,
    Aborted,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Created => "created",
            BuildPhase::Preparing => "preparing",
            BuildPhase::Writing => "writing",
            BuildPhase::Finalized => "finalized",
            BuildPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: u64,
}

/// Everything a build holds between `prepare` and `finalize`.
struct BuildState<const K: usize> {
    data: BufWriter<File>,
    layout: Layout,
    keys: Vec<[u8; K]>,
    extents: Vec<Extent>,
    data_len: u64,
}

enum CreatorState<const K: usize> {
    Created,
    Writing(Box<BuildState<K>>),
    Finalized,
    Aborted,
}

/// Write-once builder for a shard file.
///
/// The number of objects must be known up front: the perfect hash index is
/// sized from it and built over the complete key set at [`finalize`](Self::finalize).
/// Objects are streamed straight into the data region as they are written,
/// only keys and extents stay in memory.
///
/// ```no_run
/// use shardstore::ShardCreator;
///
/// # fn main() -> shardstore::Result<()> {
/// ShardCreator::<4>::build("objects.shard", 2, |creator| {
///     creator.write(b"AAAA", b"hello")?;
///     creator.write(b"BBBB", b"world")
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct ShardCreator<const K: usize = DEFAULT_KEY_LEN> {
    path: PathBuf,
    object_count: u64,
    written: u64,
    config: BuildConfig,
    state: CreatorState<K>,
}

impl<const K: usize> ShardCreator<K> {
    /// Records the destination and the exact object count. Does not touch the filesystem.
    pub fn new<P: AsRef<Path>>(path: P, object_count: u64) -> Self {
        Self::with_config(path, object_count, BuildConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(path: P, object_count: u64, config: BuildConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            object_count,
            written: 0,
            config,
            state: CreatorState::Created,
        }
    }

    /// Runs `f` between `prepare` and `finalize`. If `f` fails the partial
    /// file is removed and `f`'s error is returned; if `finalize` fails the
    /// partial file is removed too.
    pub fn build<P, T, F>(path: P, object_count: u64, f: F) -> Result<T>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        Self::build_with_config(path, object_count, BuildConfig::default(), f)
    }

    pub fn build_with_config<P, T, F>(
        path: P,
        object_count: u64,
        config: BuildConfig,
        f: F,
    ) -> Result<T>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let mut creator = Self::with_config(path, object_count, config);
        creator.prepare()?;

        match f(&mut creator) {
            Ok(value) => {
                // the closure may have finalized or aborted on its own
                if matches!(creator.phase(), BuildPhase::Finalized | BuildPhase::Aborted) {
                    return Ok(value);
                }
                match creator.finalize() {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        if let Err(cleanup) = remove_partial(&creator.path) {
                            warn!(path = %creator.path.display(), error = %cleanup, "could not remove failed shard build");
                        }
                        Err(e)
                    }
                }
            }
            Err(e) => {
                if let Err(abort) = creator.abort() {
                    warn!(path = %creator.path.display(), error = %abort, "could not abort shard build");
                }
                Err(e)
            }
        }
    }

    /// Length every key must have.
    pub const fn key_len() -> usize {
        K
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn object_count(&self) -> u64 {
        self.object_count
    }

    /// Number of successful `write` calls so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn phase(&self) -> BuildPhase {
        match &self.state {
            CreatorState::Created => BuildPhase::Created,
            CreatorState::Writing(_) if self.written == 0 => BuildPhase::Preparing,
            CreatorState::Writing(_) => BuildPhase::Writing,
            CreatorState::Finalized => BuildPhase::Finalized,
            CreatorState::Aborted => BuildPhase::Aborted,
        }
    }

    /// Creates or truncates the file and reserves its index region.
    pub fn prepare(&mut self) -> Result<()> {
        match self.state {
            CreatorState::Created => {}
            CreatorState::Writing(_) => return Err(UsageError::AlreadyPrepared.into()),
            _ => return Err(UsageError::BuildFinished(self.phase()).into()),
        }

        let count = usize::try_from(self.object_count)
            .ok()
            .filter(|&count| count <= u32::MAX as usize)
            .ok_or(UsageError::TooManyObjects(self.object_count))?;
        let buckets = phf::bucket_count(count, self.config.lambda());
        let layout = Layout::new(count, buckets, K)
            .ok_or(UsageError::TooManyObjects(self.object_count))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| ShardError::io(&self.path, e))?;
        // zero-filled, so the header reads as unfinalized until the very end
        file.set_len(layout.index_len() as u64)
            .map_err(|e| ShardError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(layout.data_offset as u64))
            .map_err(|e| ShardError::io(&self.path, e))?;

        debug!(
            path = %self.path.display(),
            objects = count,
            buckets,
            index_bytes = layout.index_len(),
            "prepared shard build"
        );

        self.written = 0;
        self.state = CreatorState::Writing(Box::new(BuildState {
            data: BufWriter::new(file),
            layout,
            keys: Vec::with_capacity(count),
            extents: Vec::with_capacity(count),
            data_len: 0,
        }));
        Ok(())
    }

    /// Appends one object to the data region and remembers its key.
    pub fn write(&mut self, key: &[u8], object: &[u8]) -> Result<()> {
        let phase = self.phase();
        let state = match &mut self.state {
            CreatorState::Writing(state) => state,
            CreatorState::Created => return Err(UsageError::NotPrepared.into()),
            _ => return Err(UsageError::BuildFinished(phase).into()),
        };

        let key: [u8; K] = key.try_into().map_err(|_| UsageError::KeyLength {
            actual: key.len(),
            expected: K,
        })?;
        if self.written >= self.object_count {
            return Err(UsageError::Overrun {
                declared: self.object_count,
            }
            .into());
        }

        let len = object.len() as u64;
        let data_len = state
            .data_len
            .checked_add(len)
            .filter(|&end| end.saturating_add(state.layout.data_offset as u64) <= MAX_DATA_OFFSET)
            .ok_or(UsageError::DataTooLarge)?;

        // a failed write may leave part of the object in the data region, after
        // which no recorded extent can be trusted
        if let Err(e) = state.data.write_all(object) {
            self.state = CreatorState::Aborted;
            warn!(
                path = %self.path.display(),
                written = self.written,
                error = %e,
                "object write failed; aborting shard build"
            );
            if let Err(cleanup) = remove_partial(&self.path) {
                warn!(path = %self.path.display(), error = %cleanup, "could not remove failed shard build");
            }
            return Err(ShardError::io(&self.path, e));
        }
        state.keys.push(key);
        state.extents.push(Extent {
            offset: state.data_len,
            len,
        });
        state.data_len = data_len;
        self.written += 1;
        Ok(())
    }

    /// Builds the perfect hash over every written key, writes the index and
    /// commits the header. Any failure leaves the builder `Aborted` and the
    /// file without a valid header.
    pub fn finalize(&mut self) -> Result<()> {
        let phase = self.phase();
        let state = match std::mem::replace(&mut self.state, CreatorState::Aborted) {
            CreatorState::Writing(state) => state,
            other => {
                self.state = other;
                let err = match phase {
                    BuildPhase::Created => UsageError::NotPrepared,
                    _ => UsageError::BuildFinished(phase),
                };
                return Err(err.into());
            }
        };

        match self.commit(*state) {
            Ok(()) => {
                self.state = CreatorState::Finalized;
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "shard finalize failed");
                Err(e)
            }
        }
    }

    /// Drops the build state and removes the partial file. Aborting twice is a no-op.
    pub fn abort(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, CreatorState::Aborted) {
            CreatorState::Created => Ok(()),
            CreatorState::Writing(state) => {
                drop(state);
                warn!(
                    path = %self.path.display(),
                    written = self.written,
                    declared = self.object_count,
                    "aborted shard build"
                );
                remove_partial(&self.path).map_err(|e| ShardError::io(&self.path, e))
            }
            CreatorState::Finalized => {
                self.state = CreatorState::Finalized;
                Err(UsageError::BuildFinished(BuildPhase::Finalized).into())
            }
            CreatorState::Aborted => Ok(()),
        }
    }

    fn commit(&self, state: BuildState<K>) -> Result<()> {
        if self.written != self.object_count {
            return Err(ShardError::CountMismatch {
                declared: self.object_count,
                written: self.written,
            });
        }

        let perfect = phf::build(&state.keys, &self.config).map_err(|e| ShardError::Build {
            reason: e.to_string(),
        })?;

        let io_err = |e: io::Error| ShardError::io(&self.path, e);
        let file = state
            .data
            .into_inner()
            .map_err(|e| io_err(e.into_error()))?;

        let layout = &state.layout;
        let mut index = IndexMap::new(&file, layout.index_len()).map_err(io_err)?;
        let header = {
            let view = layout.split_mut(index.as_mut()).map_err(|e| {
                ShardError::integrity(&self.path, format!("index region is misaligned: {e}"))
            })?;

            view.displacements.copy_from_slice(&perfect.displacements);
            for (slot, &key_idx) in perfect.slots.iter().enumerate() {
                let key = &state.keys[key_idx as usize];
                let extent = state.extents[key_idx as usize];
                view.slots[slot] = Slot::live(extent.offset, extent.len, phf::fingerprint(key));
                view.keys[slot * K..(slot + 1) * K].copy_from_slice(key);
            }

            let mut header = Header {
                magic: MAGIC,
                version: FORMAT_VERSION,
                key_len: K as u32,
                object_count: self.object_count,
                seed: perfect.seed,
                bucket_count: perfect.displacements.len() as u64,
                data_offset: layout.data_offset as u64,
                data_len: state.data_len,
                checksum: 0,
            };
            header.checksum = format::checksum(&header, view.displacements, view.keys);
            header
        };

        index.flush().map_err(io_err)?;
        if self.config.sync_on_finalize {
            file.sync_all().map_err(io_err)?;
        }

        // the header goes last: until it lands the file reads as unfinalized
        index.as_mut()[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        index.flush_range(0, HEADER_SIZE).map_err(io_err)?;
        if self.config.sync_on_finalize {
            file.sync_all().map_err(io_err)?;
        }

        info!(
            path = %self.path.display(),
            objects = self.object_count,
            buckets = header.bucket_count,
            seed_attempts = perfect.attempts,
            data_bytes = header.data_len,
            "finalized shard"
        );
        Ok(())
    }
}

impl<const K: usize> Drop for ShardCreator<K> {
    fn drop(&mut self) {
        if let CreatorState::Writing(_) = self.state {
            warn!(
                path = %self.path.display(),
                written = self.written,
                declared = self.object_count,
                "dropping unfinished shard build; the file is not a valid shard"
            );
        }
    }
}

fn remove_partial(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::shard::Shard;
    use tempfile::TempDir;

    type Creator = ShardCreator<4>;

    #[test]
    fn test_phases() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 2);
        assert_eq!(creator.phase(), BuildPhase::Created);
        creator.prepare().unwrap();
        assert_eq!(creator.phase(), BuildPhase::Preparing);
        creator.write(b"AAAA", b"one").unwrap();
        assert_eq!(creator.phase(), BuildPhase::Writing);
        creator.write(b"BBBB", b"two").unwrap();
        assert_eq!(creator.written(), 2);
        creator.finalize().unwrap();
        assert_eq!(creator.phase(), BuildPhase::Finalized);
        assert_eq!(Creator::key_len(), 4);
    }

    #[test]
    fn test_prepare_does_not_happen_in_constructor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lazy.shard");
        let _creator = Creator::new(&path, 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_before_prepare() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 1);
        let err = creator.write(b"AAAA", b"x").unwrap_err();
        assert!(matches!(err, ShardError::Usage(UsageError::NotPrepared)));
        let err = creator.finalize().unwrap_err();
        assert!(matches!(err, ShardError::Usage(UsageError::NotPrepared)));
    }

    #[test]
    fn test_prepare_twice() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 1);
        creator.prepare().unwrap();
        let err = creator.prepare().unwrap_err();
        assert!(matches!(err, ShardError::Usage(UsageError::AlreadyPrepared)));
    }

    #[test]
    fn test_key_length_rejected() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 1);
        creator.prepare().unwrap();
        for key in [&b""[..], b"AAA", b"AAAAA"] {
            let err = creator.write(key, b"x").unwrap_err();
            assert_eq!(
                err.to_string(),
                format!("invalid usage: key length is {} instead of 4", key.len())
            );
        }
        assert_eq!(creator.written(), 0);
    }

    #[test]
    fn test_overrun_rejected() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 1);
        creator.prepare().unwrap();
        creator.write(b"AAAA", b"x").unwrap();
        let err = creator.write(b"BBBB", b"y").unwrap_err();
        assert!(matches!(
            err,
            ShardError::Usage(UsageError::Overrun { declared: 1 })
        ));
        assert_eq!(creator.written(), 1);
        creator.finalize().unwrap();
    }

    #[test]
    fn test_count_mismatch_leaves_unloadable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.shard");
        let mut creator = Creator::new(&path, 2);
        creator.prepare().unwrap();
        creator.write(b"AAAA", b"x").unwrap();

        let err = creator.finalize().unwrap_err();
        assert!(matches!(
            err,
            ShardError::CountMismatch {
                declared: 2,
                written: 1
            }
        ));
        assert_eq!(creator.phase(), BuildPhase::Aborted);

        let err = Shard::<4>::open(&path).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_finalize_twice() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("a.shard"), 0);
        creator.prepare().unwrap();
        creator.finalize().unwrap();
        let err = creator.finalize().unwrap_err();
        assert!(matches!(
            err,
            ShardError::Usage(UsageError::BuildFinished(BuildPhase::Finalized))
        ));
        let err = creator.write(b"AAAA", b"x").unwrap_err();
        assert!(matches!(
            err,
            ShardError::Usage(UsageError::BuildFinished(BuildPhase::Finalized))
        ));
    }

    #[test]
    fn test_duplicate_key_is_build_error() {
        let dir = TempDir::new().unwrap();
        let mut creator = Creator::new(dir.path().join("dup.shard"), 2);
        creator.prepare().unwrap();
        creator.write(b"KEY1", b"first").unwrap();
        creator.write(b"KEY1", b"second").unwrap();
        let err = creator.finalize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Build);
        assert!(err.to_string().contains("possible duplicate key"));
        assert_eq!(err.raw_os_error(), None);
    }

    #[test]
    fn test_prepare_in_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("a.shard");
        let mut creator = Creator::new(&path, 1);
        let err = creator.prepare().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.raw_os_error().is_some());
        assert!(err.to_string().contains("a.shard"));
        assert_eq!(creator.phase(), BuildPhase::Created);
    }

    #[test]
    fn test_abort_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.shard");
        let mut creator = Creator::new(&path, 2);
        creator.prepare().unwrap();
        creator.write(b"AAAA", b"x").unwrap();
        assert!(path.exists());
        creator.abort().unwrap();
        assert!(!path.exists());
        assert_eq!(creator.phase(), BuildPhase::Aborted);

        let err = creator.write(b"BBBB", b"y").unwrap_err();
        assert!(matches!(
            err,
            ShardError::Usage(UsageError::BuildFinished(BuildPhase::Aborted))
        ));
    }

    #[test]
    fn test_failed_object_write_aborts_build() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failing.shard");
        let mut creator = Creator::new(&path, 3);
        creator.prepare().unwrap();
        creator.write(b"AAAA", b"hello").unwrap();

        // a read-only handle makes every write to the data region fail
        if let CreatorState::Writing(state) = &mut creator.state {
            state.data.flush().unwrap();
            state.data = BufWriter::new(File::open(&path).unwrap());
        }
        let err = creator.write(b"BBBB", &[b'x'; 20_000]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(creator.phase(), BuildPhase::Aborted);
        assert_eq!(creator.written(), 1);
        assert!(!path.exists());

        let err = creator.write(b"CCCC", b"world").unwrap_err();
        assert!(matches!(
            err,
            ShardError::Usage(UsageError::BuildFinished(BuildPhase::Aborted))
        ));
        assert!(matches!(
            creator.finalize().unwrap_err(),
            ShardError::Usage(UsageError::BuildFinished(BuildPhase::Aborted))
        ));
        creator.abort().unwrap();
        assert!(Shard::<4>::open(&path).is_err());
    }

    #[test]
    fn test_build_aborts_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scoped.shard");
        let result: Result<()> = Creator::build(&path, 2, |creator| {
            creator.write(b"AAAA", b"x")?;
            Err(ShardError::NotFound)
        });
        assert!(matches!(result, Err(ShardError::NotFound)));
        assert!(!path.exists());
    }

    #[test]
    fn test_build_finalizes_on_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scoped.shard");
        let written = Creator::build(&path, 1, |creator| {
            creator.write(b"AAAA", b"payload")?;
            Ok(creator.written())
        })
        .unwrap();
        assert_eq!(written, 1);

        let shard = Shard::<4>::open(&path).unwrap();
        assert_eq!(shard.lookup(b"AAAA").unwrap(), b"payload");
    }

    #[test]
    fn test_build_removes_file_when_finalize_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scoped.shard");
        let err = Creator::build(&path, 3, |creator| creator.write(b"AAAA", b"x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CountMismatch);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_unfinished_build() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dropped.shard");
        {
            let mut creator = Creator::new(&path, 1);
            creator.prepare().unwrap();
        }
        let err = Shard::<4>::open(&path).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_unsynced_build_is_readable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nosync.shard");
        let config = BuildConfig {
            sync_on_finalize: false,
            ..BuildConfig::default()
        };
        Creator::build_with_config(&path, 2, config, |creator| {
            creator.write(b"AAAA", b"a")?;
            creator.write(b"BBBB", b"")
        })
        .unwrap();

        let shard = Shard::<4>::open(&path).unwrap();
        assert_eq!(shard.lookup(b"AAAA").unwrap(), b"a");
        assert_eq!(shard.lookup(b"BBBB").unwrap(), b"");
    }
}
