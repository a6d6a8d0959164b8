use super::{Access, Error, Strategy};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
    ptr, slice,
};
use tracing::{debug, warn};

/// Implementation of a memory-mapped region.
///
/// The struct owns both the open file and the mapping; the mapping is released
/// (and, for [Strategy::ReadWriteManual], flushed) on drop.
pub struct Region {
    file: File,
    strategy: Strategy,
    ptr: *mut u8,
    len: usize,
}

impl Region {
    /// Open `path` and map its entire current length.
    ///
    /// Fails with [Error::Io] if the file cannot be opened under the requested
    /// access (a missing file surfaces `NotFound`) and with [Error::EmptyFile]
    /// if there is nothing to map.
    pub fn open(path: impl AsRef<Path>, strategy: Strategy) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = match strategy {
            Strategy::ReadOnly => OpenOptions::new().read(true).open(path)?,
            _ => OpenOptions::new().read(true).write(true).open(path)?,
        };
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::EmptyFile);
        }
        let ptr = Self::map(&file, len, strategy)?;
        debug!(path = ?path, len, "mapped region");
        Ok(Self {
            file,
            strategy,
            ptr,
            len,
        })
    }

    /// Length of the mapping in bytes (equal to the file length at the last
    /// open or resize).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    ///
    /// Only true after a failed [Region::resize] left the region unmapped; a
    /// healthy region always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region refuses mutation.
    pub fn is_read_only(&self) -> bool {
        self.strategy == Strategy::ReadOnly
    }

    /// Borrow the mapped bytes.
    pub fn as_ref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // Safety: ptr/len describe the live mapping and the borrow of self
        // keeps it alive for the lifetime of the slice.
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Borrow the mapped bytes mutably. Refused for read-only regions.
    pub fn as_mut(&mut self) -> Result<&mut [u8], Error> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if self.len == 0 {
            return Ok(&mut []);
        }
        // Safety: as in as_ref, plus the mapping was created PROT_WRITE.
        Ok(unsafe { slice::from_raw_parts_mut(self.ptr, self.len) })
    }

    /// Extend the file to `new_len` bytes and replace the mapping with one
    /// covering the new length.
    ///
    /// On a remap failure the file keeps its new length but the region is left
    /// unmapped; every view is empty until a subsequent resize succeeds.
    pub fn resize(&mut self, new_len: usize) -> Result<(), Error> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        if new_len == 0 {
            return Err(Error::EmptyFile);
        }
        if new_len == self.len {
            return Ok(());
        }
        self.file.set_len(new_len as u64)?;
        if self.len != 0 {
            // Safety: ptr/len describe the live mapping.
            let ret = unsafe { libc::munmap(self.ptr.cast(), self.len) };
            if ret != 0 {
                return Err(Error::UnmapFailed(io::Error::last_os_error()));
            }
            self.ptr = ptr::null_mut();
            self.len = 0;
        }
        self.ptr = Self::map(&self.file, new_len, self.strategy)?;
        self.len = new_len;
        debug!(len = new_len, "remapped region");
        Ok(())
    }

    /// Durability barrier for `len` bytes starting at `offset`: block until the
    /// covered pages have been written to the file.
    ///
    /// The range is clamped to the mapping and widened to page boundaries as
    /// `msync` requires.
    pub fn flush(&self, offset: usize, len: usize) -> Result<(), Error> {
        let end = offset.saturating_add(len).min(self.len);
        if offset >= end {
            return Ok(());
        }
        let start = offset - (offset % page_size());
        // Safety: start/end lie within the live mapping and start is
        // page-aligned.
        let ret = unsafe {
            libc::msync(
                self.ptr.add(start).cast(),
                end - start,
                libc::MS_SYNC,
            )
        };
        if ret != 0 {
            return Err(Error::FlushFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Flush the entire mapping and the file's metadata to stable storage.
    pub fn sync(&self) -> Result<(), Error> {
        self.flush(0, self.len)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Hint the expected access pattern for the whole mapping to the OS.
    pub fn advise(&self, access: Access) -> Result<(), Error> {
        if self.len == 0 {
            return Ok(());
        }
        let advice = match access {
            Access::Normal => libc::MADV_NORMAL,
            Access::Random => libc::MADV_RANDOM,
            Access::Sequential => libc::MADV_SEQUENTIAL,
            Access::WillNeed => libc::MADV_WILLNEED,
            Access::DontNeed => libc::MADV_DONTNEED,
        };
        // Safety: ptr/len describe the live mapping.
        let ret = unsafe { libc::madvise(self.ptr.cast(), self.len, advice) };
        if ret != 0 {
            return Err(Error::AdviseFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Map `len` bytes of `file` with protection matching `strategy`.
    fn map(file: &File, len: usize, strategy: Strategy) -> Result<*mut u8, Error> {
        let prot = match strategy {
            Strategy::ReadOnly => libc::PROT_READ,
            _ => libc::PROT_READ | libc::PROT_WRITE,
        };
        // Safety: len is nonzero and the descriptor is open with access
        // matching prot.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::MapFailed(io::Error::last_os_error()));
        }
        Ok(ptr.cast())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if self.strategy == Strategy::ReadWriteManual {
            if let Err(err) = self.flush(0, self.len) {
                warn!(?err, "failed to flush region on drop");
            }
        }
        // Safety: ptr/len describe the live mapping; nothing can borrow it
        // past drop.
        unsafe { libc::munmap(self.ptr.cast(), self.len) };
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no memory effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(contents: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("region.bin");
        std::fs::write(&path, contents).expect("Failed to seed file");
        (dir, path)
    }

    #[test]
    fn test_region_read() {
        let (_dir, path) = scratch(b"some mapped bytes");
        let region = Region::open(&path, Strategy::ReadOnly).expect("Failed to open region");
        assert_eq!(region.len(), 17);
        assert_eq!(region.as_ref(), b"some mapped bytes");
    }

    #[test]
    fn test_region_write_visible_after_reopen() {
        let (_dir, path) = scratch(&[0u8; 16]);
        {
            let mut region =
                Region::open(&path, Strategy::ReadWriteManual).expect("Failed to open region");
            region.as_mut().expect("Failed to get mutable view")[..5].copy_from_slice(b"hello");
            region.flush(0, 5).expect("Failed to flush region");
        }
        let contents = std::fs::read(&path).expect("Failed to read file");
        assert_eq!(&contents[..5], b"hello");

        // Writes are also visible through a fresh mapping.
        let region = Region::open(&path, Strategy::ReadOnly).expect("Failed to reopen region");
        assert_eq!(&region.as_ref()[..5], b"hello");
    }

    #[test]
    fn test_region_resize_grows() {
        let (_dir, path) = scratch(&[1u8; 8]);
        let mut region =
            Region::open(&path, Strategy::ReadWriteAuto).expect("Failed to open region");
        region.resize(64).expect("Failed to resize region");
        assert_eq!(region.len(), 64);

        // The original bytes survive and the extension reads as zeros.
        assert_eq!(&region.as_ref()[..8], &[1u8; 8]);
        assert_eq!(&region.as_ref()[8..], &[0u8; 56]);

        // The new tail is writable.
        region.as_mut().expect("Failed to get mutable view")[63] = 7;
        assert_eq!(region.as_ref()[63], 7);

        // The file itself grew.
        let len = std::fs::metadata(&path).expect("Failed to stat file").len();
        assert_eq!(len, 64);
    }

    #[test]
    fn test_region_read_only_refuses_mutation() {
        let (_dir, path) = scratch(&[0u8; 8]);
        let mut region = Region::open(&path, Strategy::ReadOnly).expect("Failed to open region");
        assert!(matches!(region.as_mut(), Err(Error::ReadOnly)));
        assert!(matches!(region.resize(16), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_region_open_missing() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("absent.bin");
        let err = Region::open(&path, Strategy::ReadOnly)
            .err()
            .expect("open of a missing file should fail");
        match err {
            Error::Io(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            other => panic!("expected NotFound, got {other}"),
        }
    }

    #[test]
    fn test_region_open_empty() {
        let (_dir, path) = scratch(b"");
        assert!(matches!(
            Region::open(&path, Strategy::ReadWriteAuto),
            Err(Error::EmptyFile)
        ));
    }

    #[test]
    fn test_region_advise() {
        let (_dir, path) = scratch(&[0u8; 4096]);
        let region = Region::open(&path, Strategy::ReadWriteAuto).expect("Failed to open region");
        for access in [
            Access::Normal,
            Access::Random,
            Access::Sequential,
            Access::WillNeed,
            Access::DontNeed,
        ] {
            region.advise(access).expect("Failed to advise");
        }
    }
}
