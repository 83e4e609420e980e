//! `nydus-convert reconvert` command - convert nydus images in an OCI
//! layout back to OCI in place.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use nydus_convert::{ImageConverter, LocalContentStore};
use nydus_convert_core::ConvertConfig;

use super::convert::convert_layout;

#[derive(Args)]
pub struct ReconvertArgs {
    /// OCI image layout directory
    pub layout: PathBuf,
}

pub async fn execute(
    args: ReconvertArgs,
    config: &ConvertConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(LocalContentStore::open(&args.layout)?);
    let converter = ImageConverter::oci(store.clone(), config)?;
    let converted = convert_layout(&args.layout, &store, &converter).await?;
    println!(
        "Reconverted {} image(s) in {} to OCI ({})",
        converted,
        args.layout.display(),
        config.oci_compressor
    );
    Ok(())
}
