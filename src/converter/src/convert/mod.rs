//! Whole-image conversion over a content store.
//!
//! An [`ImageConverter`] walks index → manifests → layers. Each distinct
//! layer goes through a [`LayerConvert`] in its own task. Each manifest is
//! then drafted in memory with the converted layers and handed to a
//! [`ManifestHook`], which stages the final documents. Layer blobs are
//! committed as they are produced, but no manifest, config or index referring
//! to them is written until every manifest of the image has been staged.

mod index;
mod layer;
mod manifest;
mod reconvert;
mod stream;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use nydus_convert_core::config::{ConvertConfig, IndexMarker};
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::task::JoinSet;

use crate::backend::Backend;
use crate::content::{commit, read_json, stage_json, ContentStore, ContentWriter, Labels};
use crate::digest::Digest;
use crate::oci::{
    clear_gc_labels, is_index_type, is_manifest_type, set_manifest_gc_labels, to_oci_media_type,
    Descriptor, DescriptorExt, ImageConfig, ImageIndex, ImageManifest, ANNOTATION_UNCOMPRESSED,
};

pub use index::annotate_index;
pub use layer::LayerConverter;
pub use manifest::ManifestRewriter;
pub use reconvert::{reconvert_manifest, LayerReconverter, ReconvertHook};

use index::stage_index;

/// Converts one layer. `None` leaves the layer unchanged.
#[async_trait]
pub trait LayerConvert: Send + Sync {
    async fn convert_layer(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>>;
}

/// Finalizes a manifest whose layers have been converted.
#[async_trait]
pub trait ManifestHook: Send + Sync {
    /// Rewrite `draft` and stage it. `desc` is the source manifest's
    /// descriptor. Nothing the hook stages may be committed by the hook
    /// itself; the caller commits once every manifest of the image is staged.
    async fn rewrite(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
        draft: ManifestDraft,
    ) -> Result<Staged>;
}

/// Documents staged in a content store and not yet visible.
pub struct Staged {
    /// Descriptor of the document the last writer holds.
    pub desc: Descriptor,
    writers: Vec<(Box<dyn ContentWriter>, Labels)>,
}

impl Staged {
    /// Commit every writer in staging order and return the descriptor.
    pub async fn commit(self, store: &dyn ContentStore) -> Result<Descriptor> {
        for (writer, labels) in self.writers {
            let digest = writer.digest();
            commit(store, writer, labels)
                .await
                .with_context(|| format!("commit {}", digest))?;
        }
        Ok(self.desc)
    }
}

impl fmt::Debug for Staged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Staged")
            .field("desc", &self.desc)
            .field("writers", &self.writers.len())
            .finish()
    }
}

/// A manifest and its config, held in memory with their labels.
#[derive(Debug, Clone)]
pub struct ManifestDraft {
    pub manifest: ImageManifest,
    pub labels: Labels,
    pub config: ImageConfig,
    pub config_labels: Labels,
}

impl ManifestDraft {
    /// Read a committed manifest and its config.
    pub async fn load(store: &dyn ContentStore, desc: &Descriptor) -> Result<Self> {
        let (manifest, labels): (ImageManifest, Labels) = read_json(store, &desc.content_digest()?)
            .await
            .with_context(|| format!("read manifest {}", desc.digest()))?;
        let (config, config_labels) = read_json(store, &manifest.config().content_digest()?)
            .await
            .with_context(|| format!("read config {}", manifest.config().digest()))?;
        Ok(Self {
            manifest,
            labels,
            config,
            config_labels,
        })
    }

    /// Replace converted layers and their DiffIDs. Converted layers must
    /// carry the uncompressed annotation.
    fn apply(&mut self, converted: &HashMap<Digest, Option<Descriptor>>) -> Result<()> {
        let mut diff_ids = self.config.diff_ids()?;
        let mut layers = self.manifest.layers().clone();
        if diff_ids.len() != layers.len() {
            return Err(ConvertError::ManifestError(format!(
                "config has {} diff ids for {} layers",
                diff_ids.len(),
                layers.len()
            )));
        }

        for (i, layer) in layers.iter_mut().enumerate() {
            let digest = layer.content_digest()?;
            let Some(Some(new)) = converted.get(&digest) else {
                continue;
            };
            if new.digest() == layer.digest() {
                continue;
            }
            diff_ids[i] = match new.annotation(ANNOTATION_UNCOMPRESSED) {
                Some(uncompressed) => uncompressed
                    .parse::<Digest>()
                    .with_context(|| format!("uncompressed digest of {}", new.digest()))?,
                None => new.content_digest()?,
            };
            clear_gc_labels(&mut self.labels, &digest);
            *layer = new.clone();
        }
        self.manifest.set_layers(layers);
        self.config.set_diff_ids(&diff_ids);

        let media_type = self.manifest.media_type().as_ref().map(to_oci_media_type);
        self.manifest.set_media_type(media_type);
        let mut config = self.manifest.config().clone();
        config.set_media_type(to_oci_media_type(config.media_type()));
        self.manifest.set_config(config);
        Ok(())
    }
}

/// Stage `draft`'s config and manifest after `blobs`.
///
/// The manifest's GC labels are recomputed from its final layers and config.
/// The returned descriptor is `desc` updated to describe the new manifest.
async fn stage_draft(
    store: &dyn ContentStore,
    desc: &Descriptor,
    draft: ManifestDraft,
    blobs: Vec<(Box<dyn ContentWriter>, Labels)>,
) -> Result<Staged> {
    let ManifestDraft {
        mut manifest,
        mut labels,
        config,
        config_labels,
    } = draft;

    let config_ref = format!("converter-write-json-{}", manifest.config().digest());
    let (config_writer, config_bytes) = stage_json(store, &config_ref, &config).await?;
    let mut config_desc = manifest.config().clone();
    config_desc.set_digest(config_writer.digest().to_string());
    config_desc.set_size(config_bytes.len() as i64);
    manifest.set_config(config_desc);
    set_manifest_gc_labels(&mut labels, &manifest);

    let manifest_ref = format!("converter-write-json-{}", desc.digest());
    let (manifest_writer, manifest_bytes) = stage_json(store, &manifest_ref, &manifest).await?;
    let mut new = desc.clone();
    new.set_digest(manifest_writer.digest().to_string());
    new.set_size(manifest_bytes.len() as i64);
    if let Some(media_type) = manifest.media_type() {
        new.set_media_type(media_type.clone());
    }

    let mut writers = blobs;
    writers.push((config_writer, config_labels));
    writers.push((manifest_writer, labels));
    Ok(Staged { desc: new, writers })
}

/// Converts a whole image with a layer converter and a manifest hook.
pub struct ImageConverter {
    store: Arc<dyn ContentStore>,
    layer: Arc<dyn LayerConvert>,
    hook: Arc<dyn ManifestHook>,
    marker: Option<IndexMarker>,
}

impl ImageConverter {
    pub fn new(
        store: Arc<dyn ContentStore>,
        layer: Arc<dyn LayerConvert>,
        hook: Arc<dyn ManifestHook>,
    ) -> Self {
        Self {
            store,
            layer,
            hook,
            marker: None,
        }
    }

    /// Marker set on converted index entries. Without one, nydus markers
    /// are removed from converted entries instead.
    pub fn with_marker(mut self, marker: Option<IndexMarker>) -> Self {
        self.marker = marker;
        self
    }

    /// OCI → nydus conversion.
    pub fn nydus(
        store: Arc<dyn ContentStore>,
        config: &ConvertConfig,
        backend: Option<Arc<dyn Backend>>,
    ) -> Self {
        Self::new(
            store,
            Arc::new(LayerConverter::from_config(config, backend.clone())),
            Arc::new(ManifestRewriter::from_config(config, backend.is_some())),
        )
        .with_marker(Some(config.index_marker))
    }

    /// nydus → OCI conversion.
    pub fn oci(store: Arc<dyn ContentStore>, config: &ConvertConfig) -> Result<Self> {
        Ok(Self::new(
            store,
            Arc::new(LayerReconverter::from_config(config)?),
            Arc::new(ReconvertHook),
        ))
    }

    /// Convert the image rooted at `root`, returning the new root.
    ///
    /// For an index, every manifest is staged before anything is committed,
    /// so a failure on any manifest leaves no new manifest, config or index.
    pub async fn convert(&self, root: &Descriptor) -> Result<Descriptor> {
        let store = self.store.as_ref();
        if is_manifest_type(root.media_type()) {
            let draft = ManifestDraft::load(store, root).await?;
            let converted = self.convert_layers([&draft.manifest]).await?;
            let staged = self.rewrite(root, draft, &converted).await?;
            return staged.commit(store).await;
        }
        if !is_index_type(root.media_type()) {
            return Err(ConvertError::ManifestError(format!(
                "cannot convert {} of type {}",
                root.digest(),
                root.media_type()
            )));
        }

        let (index, _): (ImageIndex, Labels) = read_json(store, &root.content_digest()?)
            .await
            .with_context(|| format!("read index {}", root.digest()))?;
        let mut drafts = Vec::new();
        for desc in index.manifests().iter().filter(|d| is_manifest_type(d.media_type())) {
            drafts.push((desc, ManifestDraft::load(store, desc).await?));
        }
        let converted = self
            .convert_layers(drafts.iter().map(|(_, draft)| &draft.manifest))
            .await?;

        let mut staged = Vec::with_capacity(drafts.len());
        let mut manifests = HashMap::new();
        for (desc, draft) in drafts {
            let manifest = self.rewrite(desc, draft, &converted).await?;
            manifests.insert(desc.content_digest()?, manifest.desc.clone());
            staged.push(manifest);
        }
        let index = stage_index(store, root, &manifests, self.marker).await?;

        for manifest in staged {
            manifest.commit(store).await?;
        }
        let new = index.commit(store).await.context("commit index")?;
        tracing::info!(source = %root.digest(), digest = %new.digest(), "Rewrote image index");
        Ok(new)
    }

    async fn rewrite(
        &self,
        desc: &Descriptor,
        mut draft: ManifestDraft,
        converted: &HashMap<Digest, Option<Descriptor>>,
    ) -> Result<Staged> {
        draft
            .apply(converted)
            .with_context(|| format!("update manifest {}", desc.digest()))?;
        self.hook
            .rewrite(self.store.as_ref(), desc, draft)
            .await
            .with_context(|| format!("rewrite manifest {}", desc.digest()))
    }

    /// Convert every distinct layer of `manifests` concurrently.
    ///
    /// The first failure aborts the remaining conversions.
    async fn convert_layers<'a>(
        &self,
        manifests: impl IntoIterator<Item = &'a ImageManifest>,
    ) -> Result<HashMap<Digest, Option<Descriptor>>> {
        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();
        for layer in manifests.into_iter().flat_map(|m| m.layers().iter()) {
            let digest = layer.content_digest()?;
            if !seen.insert(digest.clone()) {
                continue;
            }
            let store = self.store.clone();
            let converter = self.layer.clone();
            let desc = layer.clone();
            tasks.spawn(async move {
                let converted = converter
                    .convert_layer(store.as_ref(), &desc)
                    .await
                    .with_context(|| format!("convert layer {}", digest))?;
                Ok::<_, ConvertError>((digest, converted))
            });
        }

        let mut converted = HashMap::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((digest, desc))) => {
                    converted.insert(digest, desc);
                }
                Ok(Err(e)) if first_error.is_none() => {
                    tasks.abort_all();
                    first_error = Some(e);
                }
                Err(e) if first_error.is_none() => {
                    tasks.abort_all();
                    first_error = Some(ConvertError::TaskError(e.to_string()));
                }
                _ => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(
                    layers = converted.len(),
                    converted = converted.values().filter(|d| d.is_some()).count(),
                    "Converted layers"
                );
                Ok(converted)
            }
        }
    }
}
