//! `nydus-convert pack` command - OCI layer tar to nydus formatted tar.

use std::path::PathBuf;

use clap::Args;
use nydus_convert::{pack_from, PackOption};
use nydus_convert_core::ConvertConfig;
use tokio::io::AsyncWriteExt;

#[derive(Args)]
pub struct PackArgs {
    /// OCI layer tar (uncompressed, gzip or zstd)
    pub input: PathBuf,

    /// Output nydus formatted tar
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(args: PackArgs, config: &ConvertConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut input = tokio::fs::File::open(&args.input)
        .await
        .map_err(|e| format!("Failed to open {}: {e}", args.input.display()))?;
    let output = tokio::fs::File::create(&args.output)
        .await
        .map_err(|e| format!("Failed to create {}: {e}", args.output.display()))?;

    let result = async {
        let mut output = pack_from(&mut input, output, PackOption::from_config(config)).await?;
        output.flush().await?;
        output.sync_all().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;
    if let Err(e) = result {
        // A partial framed tar is not locatable; do not leave it behind.
        let _ = tokio::fs::remove_file(&args.output).await;
        return Err(e);
    }

    let size = tokio::fs::metadata(&args.output).await?.len();
    println!(
        "Packed {} to {} ({})",
        args.input.display(),
        args.output.display(),
        crate::output::format_bytes(size)
    );
    Ok(())
}
