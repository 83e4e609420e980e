use std::collections::HashMap;

use nydus_convert_core::config::IndexMarker;
use nydus_convert_core::error::{Result, ResultExt};

use super::Staged;
use crate::content::{read_json, stage_json, ContentStore, Labels};
use crate::digest::Digest;
use crate::oci::{
    has_nydus_artifact_type, set_index_gc_labels, to_oci_media_type, Descriptor, DescriptorExt,
    ImageIndex, MediaType, NYDUS_ARTIFACT_TYPE, NYDUS_OS_FEATURE,
};

/// Rewrite the index `desc`, replacing each manifest found in `converted`.
///
/// Only replaced entries get `marker`. Without a marker, nydus markers are
/// removed from the replaced entries. Returns the committed index.
pub async fn annotate_index(
    store: &dyn ContentStore,
    desc: &Descriptor,
    converted: &HashMap<Digest, Descriptor>,
    marker: Option<IndexMarker>,
) -> Result<Descriptor> {
    let staged = stage_index(store, desc, converted, marker).await?;
    let new = staged.commit(store).await.context("commit index")?;
    tracing::info!(source = %desc.digest(), digest = %new.digest(), "Rewrote image index");
    Ok(new)
}

/// Stage the rewritten index without committing it.
pub(super) async fn stage_index(
    store: &dyn ContentStore,
    desc: &Descriptor,
    converted: &HashMap<Digest, Descriptor>,
    marker: Option<IndexMarker>,
) -> Result<Staged> {
    let (mut index, mut labels): (ImageIndex, Labels) = read_json(store, &desc.content_digest()?)
        .await
        .with_context(|| format!("read index {}", desc.digest()))?;

    let mut replaced = 0;
    let mut manifests = index.manifests().clone();
    for entry in &mut manifests {
        let Some(new) = converted.get(&entry.content_digest()?) else {
            continue;
        };
        let mut new = new.clone();
        if new.platform().is_none() {
            new.set_platform(entry.platform().clone());
        }
        mark(&mut new, marker);
        *entry = new;
        replaced += 1;
    }
    index.set_manifests(manifests);

    let media_type = index.media_type().as_ref().map(to_oci_media_type);
    index.set_media_type(media_type);
    set_index_gc_labels(&mut labels, &index);

    let reference = format!("converter-write-json-{}", desc.digest());
    let (writer, bytes) = stage_json(store, &reference, &index).await?;
    let mut new = desc.clone();
    new.set_digest(writer.digest().to_string());
    new.set_size(bytes.len() as i64);
    if let Some(media_type) = index.media_type() {
        new.set_media_type(media_type.clone());
    }
    tracing::debug!(source = %desc.digest(), digest = %new.digest(), replaced, "Staged image index");
    Ok(Staged {
        desc: new,
        writers: vec![(writer, labels)],
    })
}

fn mark(desc: &mut Descriptor, marker: Option<IndexMarker>) {
    let mut platform = desc.platform().clone();
    match (marker, platform.as_mut()) {
        (Some(IndexMarker::OsFeature), Some(platform)) => {
            let mut features = platform.os_features().clone().unwrap_or_default();
            if !features.iter().any(|f| f == NYDUS_OS_FEATURE) {
                features.push(NYDUS_OS_FEATURE.to_string());
            }
            platform.set_os_features(Some(features));
        }
        // Without a platform there is nowhere to put the feature.
        (Some(IndexMarker::OsFeature), None) | (Some(IndexMarker::ArtifactType), _) => {
            desc.set_artifact_type(Some(MediaType::from(NYDUS_ARTIFACT_TYPE)));
        }
        (None, platform) => {
            if let Some(platform) = platform {
                let features: Vec<String> = platform
                    .os_features()
                    .iter()
                    .flatten()
                    .filter(|f| *f != NYDUS_OS_FEATURE)
                    .cloned()
                    .collect();
                platform.set_os_features((!features.is_empty()).then_some(features));
            }
            if has_nydus_artifact_type(desc) {
                desc.set_artifact_type(None);
            }
        }
    }
    desc.set_platform(platform);
}
