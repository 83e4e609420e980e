//! `nydus-convert unpack` command - nydus formatted tar to OCI layer tar.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use nydus_convert::{unpack, FileReaderAt, UnpackOption};
use nydus_convert_core::ConvertConfig;
use tokio::io::AsyncWriteExt;

#[derive(Args)]
pub struct UnpackArgs {
    /// Nydus formatted tar
    pub input: PathBuf,

    /// Output OCI layer tar (uncompressed)
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn execute(
    args: UnpackArgs,
    config: &ConvertConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader = FileReaderAt::open(&args.input)
        .map_err(|e| format!("Failed to open {}: {e}", args.input.display()))?;
    let mut output = tokio::fs::File::create(&args.output)
        .await
        .map_err(|e| format!("Failed to create {}: {e}", args.output.display()))?;

    let result = async {
        unpack(Arc::new(reader), &mut output, &UnpackOption::from_config(config)).await?;
        output.flush().await?;
        output.sync_all().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    }
    .await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&args.output).await;
        return Err(e);
    }

    let size = tokio::fs::metadata(&args.output).await?.len();
    println!(
        "Unpacked {} to {} ({})",
        args.input.display(),
        args.output.display(),
        crate::output::format_bytes(size)
    );
    Ok(())
}
