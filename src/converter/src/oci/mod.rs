//! OCI media types, nydus annotations and content-store GC labels.

mod types;

pub use types::{
    descriptor, is_empty_layer, Arch, Descriptor, DescriptorExt, History, HistoryBuilder,
    ImageConfig, ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType,
    Os, Platform, RootFs, SCHEMA_VERSION,
};

use crate::content::Labels;
use crate::digest::Digest;

pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_DOCKER_LAYER_FOREIGN_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Media type of a framed nydus blob layer.
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";

/// Digest of the uncompressed layer (its DiffID).
pub const ANNOTATION_UNCOMPRESSED: &str = "containerd.io/uncompressed";
pub const ANNOTATION_NYDUS_BLOB: &str = "containerd.io/snapshot/nydus-blob";
pub const ANNOTATION_NYDUS_BOOTSTRAP: &str = "containerd.io/snapshot/nydus-bootstrap";
pub const ANNOTATION_NYDUS_FS_VERSION: &str = "containerd.io/snapshot/nydus-fs-version";
/// JSON array of the hex blob IDs a merged bootstrap references.
pub const ANNOTATION_NYDUS_BLOB_IDS: &str = "containerd.io/snapshot/nydus-blob-ids";

/// Platform feature marking a nydus manifest in an index.
pub const NYDUS_OS_FEATURE: &str = "nydus.remoteimage.v1";
/// Artifact type marking a nydus manifest in an index.
pub const NYDUS_ARTIFACT_TYPE: &str = "application/vnd.nydus.image.manifest.v1+json";

/// History entry recorded for the merged bootstrap layer.
pub const BOOTSTRAP_HISTORY_COMMENT: &str = "Nydus Bootstrap Layer";
pub const BOOTSTRAP_HISTORY_CREATED_BY: &str = "Nydus Converter";

/// Every GC reference label starts with this.
pub const GC_REF_CONTENT: &str = "containerd.io/gc.ref.content";
pub const GC_REF_CONFIG: &str = "containerd.io/gc.ref.content.config";
const GC_REF_LAYER: &str = "containerd.io/gc.ref.content.l";
const GC_REF_MANIFEST: &str = "containerd.io/gc.ref.content.m";

/// GC label pinning the `index`-th layer of a manifest.
pub fn gc_layer_label(index: usize) -> String {
    format!("{}.{}", GC_REF_LAYER, index)
}

/// GC label pinning the `index`-th manifest of an index.
pub fn gc_manifest_label(index: usize) -> String {
    format!("{}.{}", GC_REF_MANIFEST, index)
}

/// Remove every GC reference label pointing at `digest`.
pub fn clear_gc_labels(labels: &mut Labels, digest: &Digest) {
    labels.retain(|key, value| !(key.starts_with(GC_REF_CONTENT) && value == digest.as_str()));
}

/// Remove every GC reference label whose key starts with `prefix`.
pub fn clear_gc_labels_with_prefix(labels: &mut Labels, prefix: &str) {
    labels.retain(|key, _| !key.starts_with(prefix));
}

/// Replace the layer and config GC labels so they pin exactly `manifest`'s
/// layers and config.
pub fn set_manifest_gc_labels(labels: &mut Labels, manifest: &ImageManifest) {
    clear_gc_labels_with_prefix(labels, &format!("{}.", GC_REF_LAYER));
    for (i, layer) in manifest.layers().iter().enumerate() {
        labels.insert(gc_layer_label(i), layer.digest().to_string());
    }
    labels.insert(GC_REF_CONFIG.to_string(), manifest.config().digest().to_string());
}

/// Replace the manifest GC labels so they pin exactly `index`'s entries.
pub fn set_index_gc_labels(labels: &mut Labels, index: &ImageIndex) {
    clear_gc_labels_with_prefix(labels, &format!("{}.", GC_REF_MANIFEST));
    for (i, manifest) in index.manifests().iter().enumerate() {
        labels.insert(gc_manifest_label(i), manifest.digest().to_string());
    }
}

pub fn is_nydus_blob(desc: &Descriptor) -> bool {
    desc.annotation(ANNOTATION_NYDUS_BLOB) == Some("true")
}

pub fn is_nydus_bootstrap(desc: &Descriptor) -> bool {
    desc.annotation(ANNOTATION_NYDUS_BOOTSTRAP) == Some("true")
}

/// Whether a manifest entry of an index carries a nydus marker.
pub fn is_nydus_manifest(desc: &Descriptor) -> bool {
    has_nydus_artifact_type(desc) || platform_has_nydus_feature(desc.platform().as_ref())
}

pub(crate) fn has_nydus_artifact_type(desc: &Descriptor) -> bool {
    desc.artifact_type()
        .as_ref()
        .is_some_and(|t| t.to_string() == NYDUS_ARTIFACT_TYPE)
}

pub(crate) fn platform_has_nydus_feature(platform: Option<&Platform>) -> bool {
    platform
        .and_then(|p| p.os_features().as_ref())
        .is_some_and(|features| features.iter().any(|f| f == NYDUS_OS_FEATURE))
}

pub fn is_layer_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        MEDIA_TYPE_LAYER
            | MEDIA_TYPE_LAYER_GZIP
            | MEDIA_TYPE_LAYER_ZSTD
            | MEDIA_TYPE_NYDUS_BLOB
            | MEDIA_TYPE_DOCKER_LAYER
            | MEDIA_TYPE_DOCKER_LAYER_GZIP
            | MEDIA_TYPE_DOCKER_LAYER_FOREIGN_GZIP
    )
}

pub fn is_manifest_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        MEDIA_TYPE_IMAGE_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST
    )
}

pub fn is_index_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        MEDIA_TYPE_IMAGE_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST
    )
}

pub fn is_config_type(media_type: &MediaType) -> bool {
    matches!(
        media_type.to_string().as_str(),
        MEDIA_TYPE_IMAGE_CONFIG | MEDIA_TYPE_DOCKER_CONFIG
    )
}

/// OCI equivalent of a Docker media type. Other types are returned as is.
pub fn to_oci_media_type(media_type: &MediaType) -> MediaType {
    let mapped = match media_type.to_string().as_str() {
        MEDIA_TYPE_DOCKER_MANIFEST_LIST => MEDIA_TYPE_IMAGE_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST => MEDIA_TYPE_IMAGE_MANIFEST,
        MEDIA_TYPE_DOCKER_CONFIG => MEDIA_TYPE_IMAGE_CONFIG,
        MEDIA_TYPE_DOCKER_LAYER => MEDIA_TYPE_LAYER,
        MEDIA_TYPE_DOCKER_LAYER_GZIP | MEDIA_TYPE_DOCKER_LAYER_FOREIGN_GZIP => MEDIA_TYPE_LAYER_GZIP,
        _ => return media_type.clone(),
    };
    MediaType::from(mapped)
}
