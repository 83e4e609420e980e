//! OCI layer tar handling.
//!
//! Layers arrive as tar streams that may be gzip or zstd compressed. The
//! builder consumes a plain directory, so layers are unpacked as-is: whiteout
//! entries (`.wh.<name>`, `.wh..wh..opq`) stay regular files and are
//! interpreted by the builder, not here.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::str::FromStr;

use nydus_convert_core::error::{ConvertError, Result};
use tar::Archive;

use crate::buffer::BUFFER_SIZE;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression of an OCI layer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Uncompressed,
    Gzip,
    Zstd,
}

impl Compression {
    /// Sniff the compression from the first bytes of a stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if magic.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::Uncompressed
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uncompressed" | "none" => Ok(Compression::Uncompressed),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            other => Err(ConvertError::ConfigError(format!(
                "unknown compression '{}'",
                other
            ))),
        }
    }
}

/// Unpack a (possibly compressed) OCI tar stream into `dest`.
///
/// Everything after the end-of-archive marker is read and discarded, so a
/// producer writing into a pipe never blocks on trailing padding.
pub fn unpack_oci_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;

    let mut raw = BufReader::with_capacity(BUFFER_SIZE, reader);
    let compression = Compression::detect(raw.fill_buf()?);

    {
        let mut decoder: Box<dyn Read + '_> = match compression {
            Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(&mut raw)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(&mut raw)?),
            Compression::Uncompressed => Box::new(&mut raw),
        };

        let mut archive = Archive::new(&mut decoder);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_overwrite(true);
        archive.unpack(dest).map_err(|e| {
            ConvertError::IoError(e).context(format!(
                "unpack {} OCI tar to {}",
                compression,
                dest.display()
            ))
        })?;
        drop(archive);

        // Data past the end-of-archive marker is irrelevant, but must be read.
        if let Err(e) = io::copy(&mut decoder, &mut io::sink()) {
            tracing::debug!(error = %e, "Ignoring undecodable data after OCI tar");
        }
    }
    io::copy(&mut raw, &mut io::sink())?;

    tracing::debug!(
        target = %dest.display(),
        %compression,
        "Unpacked OCI tar"
    );
    Ok(())
}

/// Copy `src` into `dest` compressed with `compression`, returning `dest`.
pub fn compress_into<R, W>(src: &mut R, dest: W, compression: Compression) -> Result<W>
where
    R: Read + ?Sized,
    W: Write,
{
    match compression {
        Compression::Uncompressed => {
            let mut dest = dest;
            io::copy(src, &mut dest)?;
            Ok(dest)
        }
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(dest, flate2::Compression::default());
            io::copy(src, &mut encoder)?;
            Ok(encoder.finish()?)
        }
        Compression::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(dest, 0)?;
            io::copy(src, &mut encoder)?;
            Ok(encoder.finish()?)
        }
    }
}
