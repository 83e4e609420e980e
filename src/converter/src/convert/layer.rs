use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use nydus_convert_core::config::ConvertConfig;
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tokio::io::AsyncWriteExt;

use super::stream::{both, spawn_sink, spawn_source};
use super::LayerConvert;
use crate::backend::Backend;
use crate::content::{commit, ContentStore, Labels};
use crate::oci::{
    descriptor, is_layer_type, is_nydus_blob, is_nydus_bootstrap, Descriptor, DescriptorExt,
    ANNOTATION_NYDUS_BLOB,
    ANNOTATION_UNCOMPRESSED, MEDIA_TYPE_NYDUS_BLOB,
};
use crate::pipeline::{join, pack_from, PackOption};

/// Packs OCI tar layers into framed nydus blobs.
pub struct LayerConverter {
    opt: PackOption,
    backend: Option<Arc<dyn Backend>>,
}

impl LayerConverter {
    pub fn new(opt: PackOption) -> Self {
        Self { opt, backend: None }
    }

    /// Also push every converted blob to `backend`.
    pub fn with_backend(mut self, backend: Option<Arc<dyn Backend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn from_config(config: &ConvertConfig, backend: Option<Arc<dyn Backend>>) -> Self {
        Self::new(PackOption::from_config(config)).with_backend(backend)
    }
}

#[async_trait]
impl LayerConvert for LayerConverter {
    async fn convert_layer(
        &self,
        store: &dyn ContentStore,
        desc: &Descriptor,
    ) -> Result<Option<Descriptor>> {
        if !is_layer_type(desc.media_type()) || is_nydus_blob(desc) || is_nydus_bootstrap(desc) {
            return Ok(None);
        }

        let reader = store
            .reader_at(&desc.content_digest()?)
            .await
            .context("get source blob reader")?;
        let reference = format!("convert-nydus-from-{}", desc.digest());
        let mut writer = store
            .writer(&reference)
            .await
            .context("open blob writer")?;

        let (mut src, feed) = spawn_source(reader);
        let (dest, sink) = spawn_sink(move |mut pipe| {
            std::io::copy(&mut pipe, &mut writer)?;
            writer.flush()?;
            Ok(writer)
        });

        let packed = match pack_from(&mut src, dest, self.opt.clone()).await {
            Ok(mut dest) => dest.shutdown().await.map_err(ConvertError::from),
            Err(e) => Err(e),
        };
        drop(src);
        let (fed, sunk) = (join(feed).await, join(sink).await);
        let (_, writer) = both(packed, sunk).context("pack tar to nydus")?;
        fed.context("read source blob")?;

        let blob_digest = writer.digest();
        let size = writer.size();
        commit(store, writer, Labels::new())
            .await
            .context("copy nydus blob to content store")?;

        if let Some(backend) = &self.backend {
            if backend.check(&blob_digest).await.context("check storage backend")? {
                tracing::debug!(
                    digest = %blob_digest,
                    backend = backend.kind(),
                    "Blob already in backend"
                );
            } else {
                let blob = store
                    .reader_at(&blob_digest)
                    .await
                    .context("get nydus blob reader")?;
                backend
                    .push(blob, &blob_digest)
                    .await
                    .context("push to storage backend")?;
                tracing::info!(
                    digest = %blob_digest,
                    backend = backend.kind(),
                    "Pushed nydus blob"
                );
            }
        }

        tracing::info!(
            source = %desc.digest(),
            digest = %blob_digest,
            size,
            "Converted layer to nydus blob"
        );
        Ok(Some(
            descriptor(MEDIA_TYPE_NYDUS_BLOB, &blob_digest, size)
                .with_annotation(ANNOTATION_UNCOMPRESSED, blob_digest.to_string())
                .with_annotation(ANNOTATION_NYDUS_BLOB, "true"),
        ))
    }
}
