use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

/// Writable mapping over the index prefix of a shard file under construction.
/// The data region that follows is written through the file handle instead.
pub struct IndexMap {
    mmap: MmapMut,
}

impl IndexMap {
    pub fn new(file: &File, len: usize) -> io::Result<Self> {
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self { mmap })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> io::Result<()> {
        self.mmap.flush_range(offset, len)
    }
}

impl AsRef<[u8]> for IndexMap {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

impl AsMut<[u8]> for IndexMap {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

/// Handle on a finalized shard file. Opened read-write when the OS allows it,
/// so tombstones can be written; otherwise read-only.
pub struct ShardFile {
    file: File,
    writable: bool,
}

impl ShardFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Self {
                file,
                writable: true,
            }),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
            ) =>
            {
                let file = OpenOptions::new().read(true).open(path)?;
                Ok(Self {
                    file,
                    writable: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Maps the whole file read-only. Writes made through [`ShardFile::write_word_at`]
    /// are visible through the mapping since both go through the page cache.
    pub fn map(&self) -> io::Result<Mmap> {
        unsafe { Mmap::map(&self.file) }
    }

    /// Writes one 8-byte word at `pos` with a single positioned write.
    pub fn write_word_at(&self, pos: u64, word: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "shard file was opened read-only",
            ));
        }
        write_all_at(&self.file, &word.to_le_bytes(), pos)
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], pos: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut pos: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, pos) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(mut file: &File, buf: &[u8], pos: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(pos))?;
    file.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_word_write_visible_through_map() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("words.bin");
        File::create(&path)?.write_all(&[0u8; 32])?;

        let file = ShardFile::open(&path)?;
        assert!(file.is_writable());
        assert_eq!(file.len()?, 32);

        let map = file.map()?;
        file.write_word_at(8, 0xDEAD_BEEF)?;
        assert_eq!(&map[8..16], &0xDEAD_BEEFu64.to_le_bytes());
        assert_eq!(&map[..8], &[0u8; 8]);
        Ok(())
    }

    #[test]
    fn test_index_map_writes_prefix() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("prefix.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(64)?;

        let mut map = IndexMap::new(&file, 16)?;
        assert_eq!(map.as_ref().len(), 16);
        map.as_mut()[..4].copy_from_slice(b"head");
        map.flush()?;
        drop(map);

        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..4], b"head");
        Ok(())
    }

    #[test]
    fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ShardFile::open(&dir.path().join("nope")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
