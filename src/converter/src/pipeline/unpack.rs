use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{copy_buffered, join, work_dir, UnpackOption};
use crate::builder::UnpackArgs;
use crate::fifo;
use crate::framing::{self, BLOB_NAME, BOOTSTRAP_NAME};
use crate::reader::ReaderAt;

/// Convert a framed nydus stream back into an OCI tar written to `dest`.
pub async fn unpack<W>(reader: Arc<dyn ReaderAt>, dest: &mut W, opt: &UnpackOption) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let work_dir = work_dir(&opt.work_dir)?;
    let bootstrap_path = work_dir.path().join(BOOTSTRAP_NAME);
    let blob_path = work_dir.path().join(BLOB_NAME);

    let (boot, blob) = (bootstrap_path.clone(), blob_path.clone());
    let has_blob = join(tokio::task::spawn_blocking(move || {
        extract_nydus_tar(reader.as_ref(), &boot, &blob)
    }))
    .await
    .context("unpack nydus tar")?;

    let tar_path = work_dir.path().join("oci.tar");
    fifo::create(&tar_path)?;
    let (mut tar, guard) = fifo::open(&tar_path)?;

    let builder = opt.builder.clone();
    let args = UnpackArgs {
        bootstrap_path,
        blob_path: has_blob.then_some(blob_path),
        tar_path,
    };
    let task = tokio::spawn(async move {
        let result = builder.unpack(&args).await;
        drop(guard);
        result
    });

    let copied = copy_buffered(&mut tar, dest).await;
    drop(tar);

    // An early EOF on the pipe says nothing about why; the builder does.
    join(task).await.context("unpack")?;
    let size = copied.context("copy oci tar")?;
    dest.flush().await?;

    tracing::info!(size, "Unpacked nydus blob to OCI tar");
    Ok(())
}

/// Extract the bootstrap (required) and blob (optional) segments to files.
///
/// Returns whether a blob segment was present.
fn extract_nydus_tar(reader: &dyn ReaderAt, boot_path: &Path, blob_path: &Path) -> Result<bool> {
    let boot = framing::locate(reader, BOOTSTRAP_NAME).context("locate bootstrap")?;
    let mut file = std::fs::File::create(boot_path)
        .with_context(|| format!("write to bootstrap {}", boot_path.display()))?;
    framing::copy_segment(reader, &boot, &mut file, None)?;
    file.flush()?;

    let blob = match framing::locate(reader, BLOB_NAME) {
        Ok(segment) => segment,
        Err(ConvertError::SegmentNotFound { .. }) => return Ok(false),
        Err(e) => return Err(e.context("locate blob")),
    };
    let mut file = std::fs::File::create(blob_path)
        .with_context(|| format!("write to blob {}", blob_path.display()))?;
    framing::copy_segment(reader, &blob, &mut file, None)?;
    file.flush()?;
    Ok(true)
}
