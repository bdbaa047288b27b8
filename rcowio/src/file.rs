// SPDX-License-Identifier: MIT

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::{IoBackendError, IoBackendResult};
use crate::iovec::{IoVec, IoVecMut};

/// Translated open flags for [`FileBackend::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    pub create: bool,
    pub rdwr: bool,
    /// Bypass the host page cache (`O_SYNC`).
    pub sync: bool,
}

/// Positional I/O over one host file.
///
/// All accessors take `&self`; positioning goes through `pread`/`pwrite`
/// rather than a shared cursor, so a backend can be used from several
/// request contexts at once.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Creates (or opens) `path` read-write.
    pub fn create<P: AsRef<Path>>(path: P) -> IoBackendResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Opens `path` with the given mode.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> IoBackendResult<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if mode.create {
            opts.create(true);
        }
        if mode.rdwr || mode.create {
            opts.write(true);
        }
        if mode.sync {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_SYNC);
        }
        let file = opts.open(path)?;
        Ok(Self { file })
    }

    /// Current file length in bytes.
    pub fn len(&self) -> IoBackendResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> IoBackendResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Flushes file data and metadata to stable storage.
    pub fn flush_to_disk(&self) -> IoBackendResult {
        self.file.sync_all()?;
        Ok(())
    }

    /// Reads into `buf` at `offset`, accumulating short reads and retrying
    /// interruptions. Returns the bytes read; an early return below
    /// `buf.len()` means end of file, an error after partial progress
    /// reports the partial count.
    pub fn pread_at(&self, offset: u64, buf: &mut [u8]) -> IoBackendResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(IoBackendError::Io(e));
                }
            }
        }
        Ok(done)
    }

    /// Writes `buf` at `offset` with the same accumulation rules as
    /// [`FileBackend::pread_at`].
    pub fn pwrite_at(&self, offset: u64, buf: &[u8]) -> IoBackendResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(IoBackendError::Io(e));
                }
            }
        }
        Ok(done)
    }

    /// Scatter read: fills the vector's segments in order starting at
    /// `offset`.
    pub fn preadv_at(&self, offset: u64, qiov: &mut IoVecMut<'_>) -> IoBackendResult<u64> {
        let mut pos = offset;
        let mut total = 0u64;
        for seg in qiov.segments_mut() {
            let n = self.pread_at(pos, seg)?;
            total += n as u64;
            if n < seg.len() {
                break;
            }
            pos += n as u64;
        }
        Ok(total)
    }

    /// Gather write: writes the vector's segments in order starting at
    /// `offset`.
    pub fn pwritev_at(&self, offset: u64, qiov: &IoVec<'_>) -> IoBackendResult<u64> {
        let mut pos = offset;
        let mut total = 0u64;
        for seg in qiov.segments() {
            let n = self.pwrite_at(pos, seg)?;
            total += n as u64;
            if n < seg.len() {
                break;
            }
            pos += n as u64;
        }
        Ok(total)
    }

    /// Reads a fixed-layout struct from `offset`.
    pub fn read_struct<T>(&self, offset: u64) -> IoBackendResult<T>
    where
        T: zerocopy::FromBytes + zerocopy::KnownLayout + zerocopy::Immutable,
    {
        let mut buf = vec![0u8; core::mem::size_of::<T>()];
        let n = self.pread_at(offset, &mut buf)?;
        if n < buf.len() {
            return Err(IoBackendError::OutOfBounds);
        }
        T::read_from_bytes(&buf).map_err(|_| IoBackendError::Unsupported)
    }

    /// Writes a fixed-layout struct at `offset`.
    pub fn write_struct<T>(&self, offset: u64, val: &T) -> IoBackendResult
    where
        T: zerocopy::IntoBytes + zerocopy::Immutable,
    {
        let bytes = val.as_bytes();
        let n = self.pwrite_at(offset, bytes)?;
        if n < bytes.len() {
            return Err(IoBackendError::OutOfBounds);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_rw() {
        let tmp = NamedTempFile::new().unwrap();
        let io = FileBackend::create(tmp.path()).unwrap();
        io.pwrite_at(10, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        assert_eq!(io.pread_at(10, &mut out).unwrap(), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(io.len().unwrap(), 14);
    }

    #[test]
    fn test_short_read_at_eof() {
        let tmp = NamedTempFile::new().unwrap();
        let io = FileBackend::create(tmp.path()).unwrap();
        io.pwrite_at(0, &[7u8; 8]).unwrap();

        let mut out = [0u8; 16];
        assert_eq!(io.pread_at(0, &mut out).unwrap(), 8);
        assert_eq!(io.pread_at(100, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_vectored_rw() {
        let tmp = NamedTempFile::new().unwrap();
        let io = FileBackend::create(tmp.path()).unwrap();

        let a = [1u8; 3];
        let b = [2u8; 5];
        let mut v = IoVec::new();
        v.push(&a);
        v.push(&b);
        assert_eq!(io.pwritev_at(4, &v).unwrap(), 8);

        let mut x = [0u8; 2];
        let mut y = [0u8; 6];
        let mut out = IoVecMut::new();
        out.push(&mut x);
        out.push(&mut y);
        assert_eq!(io.preadv_at(4, &mut out).unwrap(), 8);
        assert_eq!(x, [1, 1]);
        assert_eq!(y, [1, 2, 2, 2, 2, 2]);
    }
}
