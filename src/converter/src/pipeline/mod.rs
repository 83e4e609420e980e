//! Streaming Pack / Merge / Unpack pipelines.
//!
//! Every call owns a private work directory (`nydus-converter-*`) that is
//! removed when the call finishes, successfully or not. Background work
//! (OCI tar unpacking, builder invocations, bootstrap extraction) runs in
//! tasks whose results are joined explicitly before a call reports success.

mod merge;
pub mod oci_tar;
mod pack;
mod unpack;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nydus_convert_core::config::ConvertConfig;
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::buffer::BufferPool;
use crate::builder::{Builder, DEFAULT_PREFETCH_PATTERNS};
use crate::digest::Digest;
use crate::reader::ReaderAt;

pub use merge::merge;
pub use pack::{pack, pack_from, PackWriter};
pub use unpack::unpack;

/// Prefix of per-call work directories.
pub const WORK_DIR_PREFIX: &str = "nydus-converter-";

/// A converted layer: the digest of the whole framed blob and random access
/// to its bytes.
#[derive(Clone)]
pub struct Layer {
    pub digest: Digest,
    pub reader: Arc<dyn ReaderAt>,
}

impl Layer {
    pub fn new(digest: Digest, reader: Arc<dyn ReaderAt>) -> Self {
        Self { digest, reader }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("digest", &self.digest)
            .field("size", &self.reader.size())
            .finish()
    }
}

/// Options of [`pack`].
#[derive(Debug, Clone)]
pub struct PackOption {
    pub builder: Builder,
    pub work_dir: PathBuf,
    pub fs_version: String,
    pub chunk_dict_path: Option<PathBuf>,
    pub prefetch_patterns: String,
    pub compressor: Option<String>,
}

impl PackOption {
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self {
            builder: Builder::from_config(config),
            work_dir: config.work_dir.clone(),
            fs_version: config.fs_version.clone(),
            chunk_dict_path: config.chunk_dict_path.clone(),
            prefetch_patterns: config.prefetch_patterns.clone(),
            compressor: config.compressor.clone(),
        }
    }
}

/// Options of [`merge`].
#[derive(Debug, Clone)]
pub struct MergeOption {
    pub builder: Builder,
    pub work_dir: PathBuf,
    pub chunk_dict_path: Option<PathBuf>,
    pub prefetch_patterns: String,
    /// Wrap the merged bootstrap in a forward-readable tar.
    pub with_tar: bool,
}

impl MergeOption {
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self {
            builder: Builder::from_config(config),
            work_dir: config.work_dir.clone(),
            chunk_dict_path: config.chunk_dict_path.clone(),
            prefetch_patterns: config.prefetch_patterns.clone(),
            with_tar: false,
        }
    }

    pub fn with_tar(mut self, with_tar: bool) -> Self {
        self.with_tar = with_tar;
        self
    }
}

/// Options of [`unpack`].
#[derive(Debug, Clone)]
pub struct UnpackOption {
    pub builder: Builder,
    pub work_dir: PathBuf,
}

impl UnpackOption {
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self {
            builder: Builder::from_config(config),
            work_dir: config.work_dir.clone(),
        }
    }
}

fn prefetch_or_default(patterns: &str) -> String {
    if patterns.is_empty() {
        DEFAULT_PREFETCH_PATTERNS.to_string()
    } else {
        patterns.to_string()
    }
}

/// Create the private work directory of one call.
fn work_dir(root: &Path) -> Result<TempDir> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("create work root {}", root.display()))?;
    tempfile::Builder::new()
        .prefix(WORK_DIR_PREFIX)
        .tempdir_in(root)
        .with_context(|| format!("create work directory in {}", root.display()))
}

/// Await a background task, folding a panic or cancellation into the result.
pub(crate) async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| ConvertError::TaskError(e.to_string()))?
}

/// Whether the root cause of `err` is a pipe whose other end hung up.
pub(crate) fn is_broken_pipe(err: &ConvertError) -> bool {
    matches!(err.root(), ConvertError::IoError(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
}

/// Copy `src` into `dest` through a pooled buffer.
async fn copy_buffered<R, W>(src: &mut R, dest: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BufferPool::global().get();
    let mut copied = 0u64;
    loop {
        let n = src.read(&mut buf[..]).await?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n]).await?;
        copied += n as u64;
    }
    Ok(copied)
}
