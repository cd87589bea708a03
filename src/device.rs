// Log device: a minimal positional read/write abstraction over a single
// file, consumed only by the allocator. Unlike the
// teacher's sequential-append WAL file handle, pages are written and read at
// arbitrary offsets concurrently, so this uses true positional I/O
// (`pread`/`pwrite` via `FileExt`) rather than a seek-then-write under a
// lock — multiple threads can call `write_at`/`read_at` on the same `File`
// concurrently without racing each other's cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

/// Durable storage backing the allocator's pages.
///
/// A trait so tests can swap in an in-memory fake; production code uses
/// [`FileDevice`].
pub trait LogDevice: Send + Sync + 'static {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn sync(&self) -> Result<()>;
}

/// A single on-disk file accessed via OS-level positional I/O.
pub struct FileDevice {
    file: Arc<File>,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }
}

impl LogDevice for FileDevice {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        // `read_at` (not `read_exact_at`): callers (the read path) size their
        // buffer from an *estimate* and must tolerate a short read at the
        // physical end of the written region, re-issuing with a corrected
        // size rather than treating it as an I/O error.
        let mut total = 0;
        loop {
            if total == buf.len() {
                break;
            }
            match self.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory device for tests that don't need real files.
#[cfg(test)]
pub(crate) struct MemDevice {
    data: parking_lot::Mutex<Vec<u8>>,
}

#[cfg(test)]
impl MemDevice {
    pub(crate) fn new() -> Self {
        Self {
            data: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl LogDevice for MemDevice {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::open(&dir.path().join("seg")).unwrap();
        device.write_at(16, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        let n = device.read_at(16, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn mem_device_short_read_past_end() {
        let device = MemDevice::new();
        device.write_at(0, b"abc").unwrap();
        let mut buf = [0u8; 10];
        let n = device.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 3);
    }
}
