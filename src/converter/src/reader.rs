//! Random-access readers over converted blobs.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

/// Positional reads over a blob of known size.
///
/// Implementations must be safe to share between threads: Merge reads the
/// bootstrap of every layer concurrently.
pub trait ReaderAt: Send + Sync {
    /// Read into `buf` starting at `offset`, returning the bytes read.
    /// Returns `Ok(0)` only at or past the end of the blob.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total size of the blob in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` completely from `offset`, or fail with `UnexpectedEof`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {}", offset),
                    ))
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// File-backed [`ReaderAt`].
pub struct FileReaderAt {
    file: File,
    size: u64,
}

impl FileReaderAt {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ReaderAt for FileReaderAt {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        if offset >= self.size {
            return Ok(0);
        }
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek_read(buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

impl ReaderAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl ReaderAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

impl<T: ReaderAt + ?Sized> ReaderAt for Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Sequential [`Read`] over the byte range `[offset, offset + len)` of a
/// [`ReaderAt`].
pub struct SectionReader<'a, R: ReaderAt + ?Sized> {
    inner: &'a R,
    pos: u64,
    end: u64,
}

impl<'a, R: ReaderAt + ?Sized> SectionReader<'a, R> {
    pub fn new(inner: &'a R, offset: u64, len: u64) -> Self {
        Self {
            inner,
            pos: offset,
            end: offset.saturating_add(len),
        }
    }

    /// Bytes left in the section.
    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }
}

impl<R: ReaderAt + ?Sized> Read for SectionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let want = (buf.len() as u64).min(self.remaining()) as usize;
        if want == 0 {
            return Ok(0);
        }
        let n = self.inner.read_at(&mut buf[..want], self.pos)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("blob truncated at offset {}", self.pos),
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}
