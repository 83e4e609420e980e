use std::collections::HashMap;
use std::io::Write;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use nydus_convert_core::config::ConvertConfig;
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::io::AsyncWriteExt;

use super::stream::{both, spawn_sink};
use super::{stage_draft, ManifestDraft, ManifestHook, Staged};
use crate::content::{ContentStore, ContentWriter, Labels};
use crate::digest::{chain_id, Digest, HashingReader};
use crate::oci::{
    descriptor, is_empty_layer, is_manifest_type, is_nydus_blob, Descriptor, DescriptorExt,
    History, ANNOTATION_NYDUS_BLOB, ANNOTATION_NYDUS_BLOB_IDS, ANNOTATION_NYDUS_BOOTSTRAP,
    ANNOTATION_NYDUS_FS_VERSION, ANNOTATION_UNCOMPRESSED, BOOTSTRAP_HISTORY_COMMENT,
    BOOTSTRAP_HISTORY_CREATED_BY, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_NYDUS_BLOB,
};
use crate::pipeline::oci_tar::{compress_into, Compression};
use crate::pipeline::{join, merge, Layer, MergeOption};

/// Collapses the per-layer nydus blobs of a manifest into one merged
/// bootstrap layer.
pub struct ManifestRewriter {
    opt: MergeOption,
    fs_version: String,
    backend: bool,
}

impl ManifestRewriter {
    /// `backend` says whether blobs are kept in remote storage, in which
    /// case the manifest keeps only the bootstrap layer.
    pub fn new(opt: MergeOption, fs_version: impl Into<String>, backend: bool) -> Self {
        Self {
            opt: opt.with_tar(true),
            fs_version: fs_version.into(),
            backend,
        }
    }

    pub fn from_config(config: &ConvertConfig, backend: bool) -> Self {
        Self::new(MergeOption::from_config(config), &config.fs_version, backend)
    }

    /// Rewrite the committed manifest `new`, converted from `original`, and
    /// commit the result.
    ///
    /// Descriptors other than manifests are returned unchanged.
    pub async fn post_convert(
        &self,
        store: &dyn ContentStore,
        original: &Descriptor,
        new: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !is_manifest_type(new.media_type()) {
            return Ok(Some(new.clone()));
        }
        let draft = ManifestDraft::load(store, new).await?;
        let staged = self
            .rewrite(store, new, draft)
            .await
            .with_context(|| format!("rewrite manifest converted from {}", original.digest()))?;
        Ok(Some(staged.commit(store).await?))
    }

    /// Merge the bootstraps of `blobs` into a gzip layer staged in `store`.
    ///
    /// Returns the staged writer, the uncompressed digest and the blobs the
    /// merged bootstrap references.
    async fn merge_bootstrap(
        &self,
        store: &dyn ContentStore,
        blobs: &[Descriptor],
    ) -> Result<(Box<dyn ContentWriter>, Digest, Vec<Digest>)> {
        let digests = blobs
            .iter()
            .map(DescriptorExt::content_digest)
            .collect::<Result<Vec<_>>>()?;
        let reference = match chain_id(&digests) {
            Some(chain) => format!("nydus-merge-{}", chain),
            None => {
                return Err(ConvertError::ManifestError(
                    "manifest has no nydus blob layers".to_string(),
                ))
            }
        };

        let mut layers = Vec::with_capacity(blobs.len());
        for digest in digests {
            let reader = store
                .reader_at(&digest)
                .await
                .with_context(|| format!("get reader for blob {}", digest))?;
            layers.push(Layer::new(digest, reader));
        }

        let writer = store.writer(&reference).await.context("open bootstrap writer")?;
        let (mut pipe, sink) = spawn_sink(move |pipe| {
            let mut uncompressed = HashingReader::new(pipe);
            let mut writer = compress_into(&mut uncompressed, writer, Compression::Gzip)?;
            writer.flush()?;
            Ok((writer, uncompressed.digest()))
        });

        let merged = async {
            let blobs = merge(&layers, &mut pipe, &self.opt).await?;
            pipe.shutdown().await?;
            Ok::<_, ConvertError>(blobs)
        }
        .await;
        drop(pipe);
        let (referenced, (writer, uncompressed)) =
            both(merged, join(sink).await).context("merge nydus layers")?;
        Ok((writer, uncompressed, referenced))
    }
}

#[async_trait]
impl ManifestHook for ManifestRewriter {
    async fn rewrite(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
        draft: ManifestDraft,
    ) -> Result<Staged> {
        let ManifestDraft {
            mut manifest,
            labels,
            mut config,
            config_labels,
        } = draft;

        let blobs: Vec<Descriptor> = manifest
            .layers()
            .iter()
            .filter(|l| is_nydus_blob(l))
            .cloned()
            .collect();
        let (bootstrap_writer, uncompressed, referenced) =
            self.merge_bootstrap(store, &blobs).await?;

        let blob_ids: Vec<&str> = referenced.iter().map(Digest::hex).collect();
        let bootstrap = descriptor(
            MEDIA_TYPE_LAYER_GZIP,
            &bootstrap_writer.digest(),
            bootstrap_writer.size(),
        )
        .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed.to_string())
        .with_annotation(ANNOTATION_NYDUS_FS_VERSION, &self.fs_version)
        .with_annotation(ANNOTATION_NYDUS_BOOTSTRAP, "true")
        .with_annotation(ANNOTATION_NYDUS_BLOB_IDS, serde_json::to_string(&blob_ids)?);

        let mut layers = Vec::new();
        if !self.backend {
            let known: HashMap<&str, &Descriptor> =
                blobs.iter().map(|b| (b.digest().as_str(), b)).collect();
            for digest in &referenced {
                layers.push(match known.get(digest.as_str()) {
                    Some(blob) => (*blob).clone(),
                    // Blobs of a chunk dictionary are not layers of this image.
                    None => referenced_blob(store, digest).await?,
                });
            }
        }
        layers.push(bootstrap);

        let diff_ids = layers
            .iter()
            .map(|l| match l.annotation(ANNOTATION_UNCOMPRESSED) {
                Some(diff_id) => diff_id.parse::<Digest>(),
                None => l.content_digest(),
            })
            .collect::<Result<Vec<_>>>()
            .context("collect diff ids")?;
        config.set_diff_ids(&diff_ids);
        for layer in &mut layers {
            layer.remove_annotation(ANNOTATION_UNCOMPRESSED);
        }
        record_bootstrap_history(&mut config.history, diff_ids.len());
        let layer_count = layers.len();
        manifest.set_layers(layers);

        let bootstrap_labels = Labels::from([(
            ANNOTATION_UNCOMPRESSED.to_string(),
            uncompressed.to_string(),
        )]);
        let draft = ManifestDraft {
            manifest,
            labels,
            config,
            config_labels,
        };
        let staged =
            stage_draft(store, desc, draft, vec![(bootstrap_writer, bootstrap_labels)]).await?;

        tracing::info!(
            source = %desc.digest(),
            digest = %staged.desc.digest(),
            layers = layer_count,
            referenced = referenced.len(),
            backend = self.backend,
            "Rewrote nydus manifest"
        );
        Ok(staged)
    }
}

/// Descriptor of a referenced blob that is not a layer of the manifest.
async fn referenced_blob(store: &dyn ContentStore, digest: &Digest) -> Result<Descriptor> {
    let info = store
        .info(digest)
        .await
        .with_context(|| format!("get info of referenced blob {}", digest))?;
    Ok(descriptor(MEDIA_TYPE_NYDUS_BLOB, digest, info.size)
        .with_annotation(ANNOTATION_UNCOMPRESSED, digest.to_string())
        .with_annotation(ANNOTATION_NYDUS_BLOB, "true"))
}

/// Append the bootstrap history entry, dropping the history when it no
/// longer describes `layers` layers.
fn record_bootstrap_history(history: &mut Vec<History>, layers: usize) {
    if history.is_empty() {
        return;
    }
    let mut entry = History::default();
    entry.set_created(Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
    entry.set_created_by(Some(BOOTSTRAP_HISTORY_CREATED_BY.to_string()));
    entry.set_comment(Some(BOOTSTRAP_HISTORY_COMMENT.to_string()));
    history.push(entry);
    let non_empty = history.iter().filter(|h| !is_empty_layer(h)).count();
    if non_empty != layers {
        tracing::warn!(
            history = non_empty,
            layers,
            "Image history does not match the merged layers, clearing it"
        );
        history.clear();
    }
}
