//! Nydus tar framing.
//!
//! A framed stream is a sequence of segments, each written as its raw bytes
//! followed by a 512-byte tar header carrying the segment name and size:
//!
//! ```text
//! blob_data | blob_header | bootstrap_data | bootstrap_header
//! ```
//!
//! Because the header trails the data, a writer can stream a segment without
//! knowing its size up front, and a reader finds a segment by walking headers
//! backward from the end of the stream. No padding is inserted between
//! segments.
//!
//! For consumers that can only read forward, [`write_forward_tar`] wraps a
//! single file in a conventional tar (`image/` + `image/<name>`).

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use nydus_convert_core::error::{ConvertError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::BufferPool;
use crate::reader::{ReaderAt, SectionReader};

/// Size of a segment header record.
pub const HEADER_SIZE: u64 = 512;

/// Segment name of the RAFS bootstrap.
pub const BOOTSTRAP_NAME: &str = "image.boot";

/// Segment name of the RAFS data blob.
pub const BLOB_NAME: &str = "image.blob";

/// Directory entry of the forward tar wrapper.
pub const IMAGE_DIR: &str = "image";

const CKSUM_RANGE: std::ops::Range<usize> = 148..156;

/// A named region of a framed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    /// Offset of the first data byte.
    pub offset: u64,
    pub size: u64,
}

/// Encode the trailing header for a segment of `size` bytes.
pub fn segment_header(name: &str, size: u64) -> Result<[u8; HEADER_SIZE as usize]> {
    file_header(name, size, tar::EntryType::Regular, 0o444)
}

fn file_header(
    path: &str,
    size: u64,
    kind: tar::EntryType,
    mode: u32,
) -> Result<[u8; HEADER_SIZE as usize]> {
    let mut header = tar::Header::new_ustar();
    header.set_path(path)?;
    header.set_size(size);
    header.set_mode(mode);
    header.set_entry_type(kind);
    header.set_mtime(0);
    header.set_cksum();
    Ok(*header.as_bytes())
}

/// Decode a header record read at `offset`, returning its name and size.
fn parse_header(buf: &[u8; HEADER_SIZE as usize], offset: u64) -> Result<(Vec<u8>, u64)> {
    let invalid = |reason: String| ConvertError::InvalidFormat { offset, reason };

    let header = tar::Header::from_byte_slice(buf);
    let stored = header
        .cksum()
        .map_err(|e| invalid(format!("unreadable header checksum: {}", e)))?;
    let computed: u32 = buf
        .iter()
        .enumerate()
        .map(|(i, b)| if CKSUM_RANGE.contains(&i) { u32::from(b' ') } else { u32::from(*b) })
        .sum();
    if stored != computed {
        return Err(invalid(format!(
            "header checksum mismatch (stored {}, computed {})",
            stored, computed
        )));
    }

    let size = header
        .entry_size()
        .map_err(|e| invalid(format!("unreadable segment size: {}", e)))?;
    Ok((header.path_bytes().into_owned(), size))
}

/// Find the segment called `name` by walking headers backward from the end.
///
/// The tail-most match wins. Every offset is checked against the stream
/// bounds before it is read, so a truncated or inflated header yields a
/// format error instead of an out-of-range read.
pub fn locate<R: ReaderAt + ?Sized>(reader: &R, name: &str) -> Result<Segment> {
    let mut cur = reader.size();
    let mut buf = [0u8; HEADER_SIZE as usize];

    loop {
        if cur < HEADER_SIZE {
            return Err(ConvertError::SegmentNotFound {
                name: name.to_string(),
            });
        }

        let header_offset = cur - HEADER_SIZE;
        reader
            .read_exact_at(&mut buf, header_offset)
            .map_err(|e| ConvertError::InvalidFormat {
                offset: header_offset,
                reason: format!("truncated header: {}", e),
            })?;
        let (found, size) = parse_header(&buf, header_offset)?;

        if size > header_offset {
            return Err(ConvertError::InvalidFormat {
                offset: header_offset,
                reason: format!(
                    "segment size {} exceeds the {} bytes before its header",
                    size, header_offset
                ),
            });
        }

        let offset = header_offset - size;
        if found == name.as_bytes() {
            tracing::trace!(name, offset, size, "Located segment");
            return Ok(Segment {
                name: name.to_string(),
                offset,
                size,
            });
        }
        cur = offset;
    }
}

/// Copy the bytes of `segment` into `dest`.
///
/// When `cancel` is set by another task the copy stops with an error at the
/// next buffer boundary.
pub fn copy_segment<R, W>(
    reader: &R,
    segment: &Segment,
    dest: &mut W,
    cancel: Option<&AtomicBool>,
) -> Result<u64>
where
    R: ReaderAt + ?Sized,
    W: Write + ?Sized,
{
    let mut section = SectionReader::new(reader, segment.offset, segment.size);
    let mut buf = BufferPool::global().get();
    let mut copied = 0u64;

    loop {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(ConvertError::TaskError(format!(
                "copy of segment {} cancelled",
                segment.name
            )));
        }
        let n = section.read(&mut buf[..])?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

/// Write `src` to `dest` as a segment called `name`, returning its size.
pub fn write_segment<R, W>(src: &mut R, dest: &mut W, name: &str) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = BufferPool::global().get();
    let mut size = 0u64;
    loop {
        let n = src.read(&mut buf[..])?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n])?;
        size += n as u64;
    }
    dest.write_all(&segment_header(name, size)?)?;
    Ok(size)
}

/// Async counterpart of [`write_segment`].
pub async fn write_segment_async<R, W>(src: &mut R, dest: &mut W, name: &str) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BufferPool::global().get();
    let mut size = 0u64;
    loop {
        let n = src.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    dest.write_all(&segment_header(name, size)?).await?;
    Ok(size)
}

/// Write the file at `path` as `image/<name>` inside a forward-readable tar.
pub async fn write_forward_tar<W>(path: &Path, name: &str, dest: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    dest.write_all(&file_header(
        IMAGE_DIR,
        0,
        tar::EntryType::Directory,
        0o755,
    )?)
    .await?;
    dest.write_all(&file_header(
        &format!("{}/{}", IMAGE_DIR, name),
        size,
        tar::EntryType::Regular,
        0o444,
    )?)
    .await?;

    let copied = tokio::io::copy(&mut file, dest).await?;
    if copied != size {
        return Err(ConvertError::InvalidFormat {
            offset: copied,
            reason: format!("{} changed size while wrapping it", path.display()),
        });
    }

    let padding = (HEADER_SIZE - size % HEADER_SIZE) % HEADER_SIZE;
    let trailer = vec![0u8; (padding + 2 * HEADER_SIZE) as usize];
    dest.write_all(&trailer).await?;

    Ok(4 * HEADER_SIZE + size + padding)
}
