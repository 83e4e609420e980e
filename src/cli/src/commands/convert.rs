//! `nydus-convert convert` command - convert an OCI layout to nydus in place.
//!
//! Every image listed in the layout's `index.json` is converted; the entry
//! is then pointed at the converted image. Original content stays in the
//! layout's blob store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use nydus_convert::oci::{Descriptor, DescriptorExt};
use nydus_convert::{ImageConverter, LocalContentStore};
use nydus_convert_core::ConvertConfig;

#[derive(Args)]
pub struct ConvertArgs {
    /// OCI image layout directory
    pub layout: PathBuf,
}

pub async fn execute(
    args: ConvertArgs,
    config: &ConvertConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(LocalContentStore::open(&args.layout)?);
    let converter = ImageConverter::nydus(store.clone(), config, None);
    let converted = convert_layout(&args.layout, &store, &converter).await?;
    println!(
        "Converted {} image(s) in {} to nydus",
        converted,
        args.layout.display()
    );
    Ok(())
}

/// Convert every entry of the layout index with `converter` and write the
/// updated index. Returns the number of converted entries.
///
/// The index is only rewritten once every entry has been converted.
pub(crate) async fn convert_layout(
    layout: &Path,
    store: &LocalContentStore,
    converter: &ImageConverter,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut index = store.read_layout_index()?;
    if index.manifests().is_empty() {
        return Err(format!("No images in {}", layout.display()).into());
    }

    let mut entries = Vec::with_capacity(index.manifests().len());
    for entry in index.manifests() {
        let new = converter
            .convert(entry)
            .await
            .map_err(|e| format!("Failed to convert {}: {e}", entry.digest()))?;
        tracing::info!(source = %entry.digest(), digest = %new.digest(), "Converted image");
        println!(
            "{} -> {}",
            crate::output::short_digest(entry.digest()),
            crate::output::short_digest(new.digest())
        );
        entries.push(replace_entry(entry, new));
    }

    let converted = entries.len();
    index.set_manifests(entries);
    store.write_layout_index(&index)?;
    Ok(converted)
}

/// The layout entry for `new`, keeping the annotations (such as the image
/// reference name) and platform of the entry it replaces.
fn replace_entry(old: &Descriptor, mut new: Descriptor) -> Descriptor {
    for (key, value) in old.annotations().iter().flatten() {
        if new.annotation(key).is_none() {
            new.set_annotation(key, value.clone());
        }
    }
    if new.platform().is_none() {
        new.set_platform(old.platform().clone());
    }
    new
}
