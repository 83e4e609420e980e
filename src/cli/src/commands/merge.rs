//! `nydus-convert merge` command - merge layer bootstraps into one.
//!
//! Prints the digests of the blobs the merged bootstrap references, one
//! per line, so they can be fed to a blob uploader.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use nydus_convert::digest::Digester;
use nydus_convert::{merge, Digest, FileReaderAt, Layer, MergeOption};
use nydus_convert_core::ConvertConfig;
use tokio::io::AsyncWriteExt;

#[derive(Args)]
pub struct MergeArgs {
    /// Nydus formatted tars, lowest layer first
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output bootstrap
    #[arg(short, long)]
    pub output: PathBuf,

    /// Wrap the bootstrap in a tar as image/image.boot
    #[arg(long)]
    pub with_tar: bool,
}

pub async fn execute(
    args: MergeArgs,
    config: &ConvertConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut layers = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        layers.push(open_layer(input).await?);
    }

    let mut output = tokio::fs::File::create(&args.output)
        .await
        .map_err(|e| format!("Failed to create {}: {e}", args.output.display()))?;
    let opt = MergeOption::from_config(config).with_tar(args.with_tar);

    let result = async {
        let blobs = merge(&layers, &mut output, &opt).await?;
        output.flush().await?;
        output.sync_all().await?;
        Ok::<_, Box<dyn std::error::Error>>(blobs)
    }
    .await;
    let blobs = match result {
        Ok(blobs) => blobs,
        Err(e) => {
            let _ = tokio::fs::remove_file(&args.output).await;
            return Err(e);
        }
    };

    for blob in &blobs {
        println!("{}", blob);
    }
    eprintln!(
        "Merged {} layers into {} ({} blobs referenced)",
        layers.len(),
        args.output.display(),
        blobs.len()
    );
    Ok(())
}

/// Open a nydus formatted tar as a layer named by its content digest.
async fn open_layer(path: &Path) -> Result<Layer, Box<dyn std::error::Error>> {
    let owned = path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || file_digest(&owned)).await??;
    let reader = FileReaderAt::open(path)
        .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), %digest, "Opened layer");
    Ok(Layer::new(digest, Arc::new(reader)))
}

fn file_digest(path: &Path) -> std::io::Result<Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut digester = Digester::new();
    std::io::copy(&mut file, &mut digester)?;
    Ok(digester.digest())
}
