//! nydus → OCI reconversion.

use std::io::Write;

use async_trait::async_trait;
use nydus_convert_core::config::ConvertConfig;
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::io::AsyncWriteExt;

use super::stream::{both, spawn_sink};
use super::{stage_draft, LayerConvert, ManifestDraft, ManifestHook, Staged};
use crate::content::{commit, ContentStore, Labels};
use crate::digest::HashingReader;
use crate::oci::{
    clear_gc_labels, descriptor, is_empty_layer, is_layer_type, is_manifest_type, is_nydus_blob,
    is_nydus_bootstrap, Descriptor, DescriptorExt, History, ANNOTATION_UNCOMPRESSED, BOOTSTRAP_HISTORY_COMMENT,
    BOOTSTRAP_HISTORY_CREATED_BY, MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_ZSTD,
};
use crate::pipeline::oci_tar::{compress_into, Compression};
use crate::pipeline::{join, unpack, UnpackOption};

/// Unpacks nydus blob layers back into OCI tar layers.
pub struct LayerReconverter {
    opt: UnpackOption,
    compression: Compression,
}

impl LayerReconverter {
    pub fn new(opt: UnpackOption, compression: Compression) -> Self {
        Self { opt, compression }
    }

    pub fn from_config(config: &ConvertConfig) -> Result<Self> {
        let compression = config
            .oci_compressor
            .parse::<Compression>()
            .context("parse OCI compressor")?;
        Ok(Self::new(UnpackOption::from_config(config), compression))
    }

    /// Reconvert one layer. Bootstrap layers are returned as is and layers
    /// that are not nydus blobs are left alone.
    pub async fn reconvert_layer(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !is_layer_type(desc.media_type()) {
            return Ok(None);
        }
        if is_nydus_bootstrap(desc) {
            tracing::debug!(digest = %desc.digest(), "Skip nydus bootstrap layer");
            return Ok(Some(desc.clone()));
        }
        if !is_nydus_blob(desc) {
            return Ok(None);
        }

        let reader = store
            .reader_at(&desc.content_digest()?)
            .await
            .context("get reader")?;
        let reference = format!("convert-oci-from-{}", desc.digest());
        let writer = store
            .writer(&reference)
            .await
            .context("open blob writer")?;

        let compression = self.compression;
        let (mut dest, sink) = spawn_sink(move |pipe| {
            let mut tar = HashingReader::new(pipe);
            let mut writer = compress_into(&mut tar, writer, compression)?;
            writer.flush()?;
            Ok((writer, tar.digest()))
        });

        let unpacked = async {
            unpack(reader, &mut dest, &self.opt).await?;
            dest.shutdown().await?;
            Ok::<_, ConvertError>(())
        }
        .await;
        drop(dest);
        let (_, (writer, uncompressed)) =
            both(unpacked, join(sink).await).context("unpack nydus to tar")?;

        let digest = writer.digest();
        let size = writer.size();
        let labels = Labels::from([(
            ANNOTATION_UNCOMPRESSED.to_string(),
            uncompressed.to_string(),
        )]);
        commit(store, writer, labels)
            .await
            .context("commit to content store")?;

        tracing::info!(
            source = %desc.digest(),
            %digest,
            size,
            compression = %self.compression,
            "Reconverted nydus blob to OCI layer"
        );
        Ok(Some(
            descriptor(layer_media_type(self.compression), &digest, size)
                .with_annotation(ANNOTATION_UNCOMPRESSED, uncompressed.to_string()),
        ))
    }
}

#[async_trait]
impl LayerConvert for LayerReconverter {
    async fn convert_layer(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        self.reconvert_layer(store, desc).await
    }
}

fn layer_media_type(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => MEDIA_TYPE_LAYER_GZIP,
        Compression::Zstd => MEDIA_TYPE_LAYER_ZSTD,
        Compression::Uncompressed => MEDIA_TYPE_LAYER,
    }
}

/// Removes the nydus bootstrap layer from reconverted manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconvertHook;

#[async_trait]
impl ManifestHook for ReconvertHook {
    async fn rewrite(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
        mut draft: ManifestDraft,
    ) -> Result<Staged> {
        strip_bootstrap(&mut draft)?;
        let layers = draft.manifest.layers().len();
        let staged = stage_draft(store, desc, draft, Vec::new()).await?;
        tracing::info!(
            source = %desc.digest(),
            digest = %staged.desc.digest(),
            layers,
            "Rewrote OCI manifest"
        );
        Ok(staged)
    }
}

/// Remove the bootstrap layer from the committed manifest `desc` and commit
/// the result.
///
/// Descriptors other than manifests are returned unchanged.
pub async fn reconvert_manifest(store: &dyn ContentStore, desc: &Descriptor) -> Result<Descriptor> {
    if !is_manifest_type(desc.media_type()) {
        return Ok(desc.clone());
    }
    let draft = ManifestDraft::load(store, desc).await?;
    ReconvertHook.rewrite(store, desc, draft).await?.commit(store).await
}

/// Drop bootstrap layers with their DiffIDs, GC labels and history.
fn strip_bootstrap(draft: &mut ManifestDraft) -> Result<()> {
    let mut diff_ids = draft.config.diff_ids()?;
    let mut layers = draft.manifest.layers().clone();
    let aligned = diff_ids.len() == layers.len();
    for i in (0..layers.len()).rev() {
        if !is_nydus_bootstrap(&layers[i]) {
            continue;
        }
        let layer = layers.remove(i);
        clear_gc_labels(&mut draft.labels, &layer.content_digest()?);
        if aligned {
            diff_ids.remove(i);
        }
    }
    if layers.is_empty() {
        return Err(ConvertError::ManifestError(
            "no layers left without the bootstrap, blobs may live in a remote backend"
                .to_string(),
        ));
    }
    draft.manifest.set_layers(layers);
    draft.config.set_diff_ids(&diff_ids);

    let history = &mut draft.config.history;
    history.retain(|h| !is_empty_layer(h) && !is_bootstrap_history(h));
    if history.len() > diff_ids.len() {
        tracing::warn!(
            history = history.len(),
            diff_ids = diff_ids.len(),
            "Image config has more history entries than diff ids, clearing history"
        );
        history.clear();
    }
    Ok(())
}

fn is_bootstrap_history(history: &History) -> bool {
    history.comment().as_deref() == Some(BOOTSTRAP_HISTORY_COMMENT)
        && history.created_by().as_deref() == Some(BOOTSTRAP_HISTORY_CREATED_BY)
}
