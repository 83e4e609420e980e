//! OCI image documents.
//!
//! Manifests, indexes and descriptors are the `oci-spec` types. The image
//! config is read through [`ImageConfig`] instead, which types only `rootfs`
//! and `history` and keeps every other field (Docker ones included) in
//! `extra`, so rewriting a config never drops fields.

use std::collections::HashMap;

use nydus_convert_core::error::{Result, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use oci_spec::image::{
    Arch, Descriptor, History, HistoryBuilder, ImageIndex, ImageIndexBuilder, ImageManifest,
    ImageManifestBuilder, MediaType, Os, Platform, RootFs,
};

use crate::digest::Digest;

/// Schema version of every manifest and index written.
pub const SCHEMA_VERSION: u32 = 2;

/// Image configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageConfig {
    pub fn diff_ids(&self) -> Result<Vec<Digest>> {
        self.rootfs
            .diff_ids()
            .iter()
            .map(|d| d.parse::<Digest>())
            .collect::<Result<Vec<_>>>()
            .context("parse diff ids")
    }

    pub fn set_diff_ids(&mut self, diff_ids: &[Digest]) {
        self.rootfs
            .set_diff_ids(diff_ids.iter().map(Digest::to_string).collect());
    }
}

/// Whether a history entry created no layer.
pub fn is_empty_layer(history: &History) -> bool {
    matches!(history.empty_layer(), Some(true))
}

/// Descriptor of `size` bytes of `media_type` content at `digest`.
pub fn descriptor(media_type: &str, digest: &Digest, size: u64) -> Descriptor {
    Descriptor::new(MediaType::from(media_type), size as i64, digest.as_str())
}

/// Accessors on [`Descriptor`] in this crate's terms.
pub trait DescriptorExt {
    /// The descriptor's digest, validated.
    fn content_digest(&self) -> Result<Digest>;

    fn content_size(&self) -> u64;

    /// The media type as written in documents.
    fn media_type_str(&self) -> String;

    fn annotation(&self, key: &str) -> Option<&str>;

    fn set_annotation(&mut self, key: &str, value: impl Into<String>);

    fn remove_annotation(&mut self, key: &str) -> Option<String>;

    fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self
    where
        Self: Sized,
    {
        self.set_annotation(key, value);
        self
    }
}

impl DescriptorExt for Descriptor {
    fn content_digest(&self) -> Result<Digest> {
        self.digest()
            .parse::<Digest>()
            .with_context(|| format!("descriptor of {}", self.media_type()))
    }

    fn content_size(&self) -> u64 {
        u64::try_from(self.size()).unwrap_or_default()
    }

    fn media_type_str(&self) -> String {
        self.media_type().to_string()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations()
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        let mut annotations = self.annotations().clone().unwrap_or_default();
        annotations.insert(key.to_string(), value.into());
        self.set_annotations(Some(annotations));
    }

    fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let mut annotations: HashMap<String, String> = self.annotations().clone()?;
        let removed = annotations.remove(key);
        self.set_annotations((!annotations.is_empty()).then_some(annotations));
        removed
    }
}
