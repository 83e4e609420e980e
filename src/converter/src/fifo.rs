//! Named pipes used to stream blobs out of the builder.
//!
//! The builder writes its blob into a FIFO while we copy from the other end,
//! so the blob never has to hit the disk. A plain blocking open of the read
//! end would hang forever if the builder died before opening its side, so
//! [`open`] returns the read end together with a [`WriteGuard`]: a write
//! handle held on the builder's behalf. The reader only sees EOF once the
//! builder has closed its end *and* the guard is dropped, which the caller
//! does when the builder process has exited.

use std::fs::File;
use std::path::Path;

use nydus_convert_core::error::{ConvertError, Result};

/// Write handle keeping a FIFO open until the producing process is done.
#[derive(Debug)]
pub struct WriteGuard {
    _file: File,
}

#[cfg(unix)]
mod imp {
    use super::*;
    use std::ffi::CString;
    use std::fs::OpenOptions;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    pub fn create(path: &Path) -> Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            ConvertError::Unsupported(format!("fifo path contains NUL: {}", path.display()))
        })?;
        // SAFETY: c_path is a valid NUL-terminated string for the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn open(path: &Path) -> Result<(File, File)> {
        // Non-blocking open of the read end returns immediately, and makes
        // the non-blocking write open below succeed.
        let reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        let writer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        set_blocking(&reader)?;
        Ok((reader, writer))
    }

    fn set_blocking(file: &File) -> Result<()> {
        let fd = file.as_raw_fd();
        // SAFETY: fd is owned by `file` and stays open for both calls.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod imp {
    use super::*;

    pub fn create(path: &Path) -> Result<()> {
        Err(ConvertError::Unsupported(format!(
            "named pipes are not available on this platform: {}",
            path.display()
        )))
    }

    pub fn open(path: &Path) -> Result<(File, File)> {
        Err(ConvertError::Unsupported(format!(
            "named pipes are not available on this platform: {}",
            path.display()
        )))
    }
}

/// Create a FIFO at `path`.
pub fn create(path: &Path) -> Result<()> {
    imp::create(path)?;
    tracing::debug!(path = %path.display(), "Created fifo");
    Ok(())
}

/// Open the read end of the FIFO at `path` without blocking.
///
/// Drop the returned guard once the writing process has exited, otherwise
/// reads never reach EOF.
pub fn open(path: &Path) -> Result<(tokio::fs::File, WriteGuard)> {
    let (reader, writer) = imp::open(path)?;
    Ok((tokio::fs::File::from_std(reader), WriteGuard { _file: writer }))
}
