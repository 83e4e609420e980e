use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use super::{copy_buffered, prefetch_or_default, work_dir, Layer, MergeOption};
use crate::builder::MergeArgs;
use crate::digest::Digest;
use crate::framing::{self, write_forward_tar, BOOTSTRAP_NAME};

/// Merge the bootstraps of `layers` into one, written to `dest`.
///
/// Layers are passed to the builder in the given order, lowest first; the
/// order decides deduplication precedence. Returns the blob digests the
/// merged bootstrap references, in the builder's order.
pub async fn merge<W>(layers: &[Layer], dest: &mut W, opt: &MergeOption) -> Result<Vec<Digest>>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let work_dir = work_dir(&opt.work_dir)?;

    let source_paths = extract_bootstraps(layers, work_dir.path())
        .await
        .context("unpack all bootstraps")?;

    let target = work_dir.path().join("bootstrap");
    let args = MergeArgs {
        source_bootstrap_paths: source_paths,
        target_bootstrap_path: target.clone(),
        output_json_path: work_dir.path().join("output.json"),
        chunk_dict_path: opt.chunk_dict_path.clone(),
        prefetch_patterns: prefetch_or_default(&opt.prefetch_patterns),
    };
    let blobs = opt
        .builder
        .merge(&args)
        .await
        .context("merge bootstraps")?;

    if opt.with_tar {
        write_forward_tar(&target, BOOTSTRAP_NAME, dest)
            .await
            .context("pack bootstrap to tar")?;
    } else {
        let mut bootstrap = tokio::fs::File::open(&target)
            .await
            .with_context(|| format!("open merged bootstrap {}", target.display()))?;
        copy_buffered(&mut bootstrap, dest)
            .await
            .context("copy merged bootstrap")?;
    }
    dest.flush().await?;

    tracing::info!(
        layers = layers.len(),
        referenced = blobs.len(),
        "Merged nydus bootstraps"
    );
    Ok(blobs)
}

/// Extract each distinct layer's bootstrap to `<dir>/<hex>` concurrently.
///
/// Returns one path per input layer, duplicates included, in input order.
/// On the first failure the remaining extractions are cancelled; all tasks
/// have stopped touching their readers by the time this returns.
async fn extract_bootstraps(layers: &[Layer], dir: &Path) -> Result<Vec<PathBuf>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    let mut seen = HashSet::new();
    let mut paths = Vec::with_capacity(layers.len());

    for layer in layers {
        let path = dir.join(layer.digest.hex());
        paths.push(path.clone());
        if !seen.insert(layer.digest.clone()) {
            continue;
        }

        let layer = layer.clone();
        let cancel = cancel.clone();
        tasks.spawn_blocking(move || {
            extract_bootstrap(&layer, &path, &cancel)
                .with_context(|| format!("unpack bootstrap of layer {}", layer.digest))
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| ConvertError::TaskError(e.to_string()))
            .and_then(|r| r);
        if let Err(e) = result {
            if first_error.is_none() {
                cancel.store(true, Ordering::Relaxed);
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(paths),
    }
}

fn extract_bootstrap(layer: &Layer, path: &Path, cancel: &AtomicBool) -> Result<()> {
    let reader = layer.reader.as_ref();
    let segment = framing::locate(reader, BOOTSTRAP_NAME)?;
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("create source bootstrap {}", path.display()))?;
    framing::copy_segment(reader, &segment, &mut file, Some(cancel))?;
    file.flush()?;
    tracing::debug!(
        digest = %layer.digest,
        size = segment.size,
        "Extracted layer bootstrap"
    );
    Ok(())
}
