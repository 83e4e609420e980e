use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use nydus_convert_core::error::{Result, ResultExt};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use super::oci_tar::unpack_oci_tar;
use super::{copy_buffered, is_broken_pipe, join, prefetch_or_default, work_dir, PackOption};
use crate::buffer::BUFFER_SIZE;
use crate::builder::CreateArgs;
use crate::fifo;
use crate::framing::{write_segment_async, BLOB_NAME, BOOTSTRAP_NAME};

/// Write side of a Pack call.
///
/// The OCI tar written into it is unpacked in the background. Nothing is
/// built until [`PackWriter::finish`] is awaited, and only its result says
/// whether the framed stream written to `dest` is complete.
pub struct PackWriter<W> {
    dest: W,
    input: DuplexStream,
    unpack: JoinHandle<Result<()>>,
    source_dir: PathBuf,
    work_dir: TempDir,
    opt: PackOption,
}

/// Start converting an OCI tar stream into a framed nydus stream on `dest`.
pub async fn pack<W>(dest: W, opt: PackOption) -> Result<PackWriter<W>>
where
    W: AsyncWrite + Unpin,
{
    let work_dir = work_dir(&opt.work_dir)?;
    let source_dir = work_dir.path().join("source");
    std::fs::create_dir_all(&source_dir)
        .with_context(|| format!("create source directory {}", source_dir.display()))?;

    let (input, output) = tokio::io::duplex(BUFFER_SIZE);
    let reader = SyncIoBridge::new(output);
    let target = source_dir.clone();
    let unpack = tokio::task::spawn_blocking(move || {
        unpack_oci_tar(reader, &target)
            .with_context(|| format!("unpack to {}", target.display()))
    });

    tracing::debug!(work_dir = %work_dir.path().display(), "Started pack");

    Ok(PackWriter {
        dest,
        input,
        unpack,
        source_dir,
        work_dir,
        opt,
    })
}

/// Pack everything read from `src` into `dest`.
pub async fn pack_from<R, W>(src: &mut R, dest: W, opt: PackOption) -> Result<W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    let mut writer = pack(dest, opt).await?;
    match copy_buffered(src, &mut writer).await {
        Ok(_) => writer.finish().await,
        // The unpack side hung up; its own error says why.
        Err(e) if is_broken_pipe(&e) => writer.finish().await,
        Err(e) => {
            writer.abort().await;
            Err(e.context("read OCI tar"))
        }
    }
}

impl<W> PackWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Stop without building. Waits for the unpacker so the work directory
    /// is no longer in use when it is removed.
    pub async fn abort(self) {
        let PackWriter { input, unpack, .. } = self;
        drop(input);
        if let Err(e) = join(unpack).await {
            tracing::debug!(error = %e, "Unpack stopped by abort");
        }
    }

    /// Close the input, build the nydus blob and write the framed stream.
    ///
    /// Returns the destination once both the blob and bootstrap segments
    /// are written. The work directory is removed on every path.
    pub async fn finish(self) -> Result<W> {
        let PackWriter {
            mut dest,
            mut input,
            unpack,
            source_dir,
            work_dir,
            opt,
        } = self;

        input.shutdown().await.ok();
        drop(input);
        // Closing the pipe does not mean the unpacker has consumed it.
        join(unpack).await?;

        let blob_path = work_dir.path().join("blob");
        let bootstrap_path = work_dir.path().join("bootstrap");
        fifo::create(&blob_path)?;
        let (mut blob, guard) = fifo::open(&blob_path)?;

        let builder = opt.builder.clone();
        let args = CreateArgs {
            source_path: source_dir,
            blob_path: blob_path.clone(),
            bootstrap_path: bootstrap_path.clone(),
            fs_version: opt.fs_version.clone(),
            chunk_dict_path: opt.chunk_dict_path.clone(),
            prefetch_patterns: prefetch_or_default(&opt.prefetch_patterns),
            compressor: opt.compressor.clone(),
        };
        let build = tokio::spawn(async move {
            let result = builder.create(&args).await;
            drop(guard);
            result
        });

        let copied = write_segment_async(&mut blob, &mut dest, BLOB_NAME).await;
        drop(blob);
        let built = join(build).await;

        // A failed copy closes the fifo early, so the builder then dies of
        // SIGPIPE. Its exit status only counts when the copy succeeded.
        let blob_size = match (copied, built) {
            (Ok(size), Ok(())) => size,
            (Err(e), built) => {
                if let Err(build_err) = built {
                    tracing::debug!(error = %build_err, "Builder stopped after blob copy failed");
                }
                return Err(e.context("write blob segment"));
            }
            (Ok(_), Err(e)) => return Err(e.context("build nydus blob")),
        };

        let mut bootstrap = tokio::fs::File::open(&bootstrap_path)
            .await
            .with_context(|| format!("open bootstrap {}", bootstrap_path.display()))?;
        let bootstrap_size = write_segment_async(&mut bootstrap, &mut dest, BOOTSTRAP_NAME)
            .await
            .context("write bootstrap segment")?;
        dest.flush().await?;

        tracing::info!(
            blob_size,
            bootstrap_size,
            work_dir = %work_dir.path().display(),
            "Packed nydus blob"
        );
        Ok(dest)
    }
}

impl<W: Unpin> AsyncWrite for PackWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().input).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().input).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().input).poll_shutdown(cx)
    }
}
