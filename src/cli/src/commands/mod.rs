//! CLI command definitions and dispatch.

mod convert;
mod merge;
mod pack;
mod reconvert;
mod unpack;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nydus_convert_core::{ConvertConfig, IndexMarker};

/// Nydus Convert - convert OCI images to nydus (RAFS) and back.
#[derive(Parser)]
#[command(name = "nydus-convert", version, about)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Convert an OCI layer tar into a nydus formatted tar
    Pack(pack::PackArgs),
    /// Merge nydus formatted tars into one bootstrap
    Merge(merge::MergeArgs),
    /// Convert a nydus formatted tar back into an OCI layer tar
    Unpack(unpack::UnpackArgs),
    /// Convert the images of an OCI layout to nydus in place
    Convert(convert::ConvertArgs),
    /// Convert the nydus images of an OCI layout back to OCI in place
    Reconvert(reconvert::ReconvertArgs),
}

/// Options shared by every command, layered over the config file.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the nydus-image builder
    #[arg(long, global = true)]
    pub builder: Option<PathBuf>,

    /// Root directory of temporary work directories
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// RAFS format version (5 or 6)
    #[arg(long, global = true)]
    pub fs_version: Option<String>,

    /// Bootstrap of a chunk dictionary
    #[arg(long, global = true)]
    pub chunk_dict: Option<PathBuf>,

    /// Chunk compressor passed to the builder
    #[arg(long, global = true)]
    pub compressor: Option<String>,

    /// Deadline of each builder invocation, in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// How converted manifests are marked in an index (os-feature, artifact-type)
    #[arg(long, global = true)]
    pub index_marker: Option<IndexMarker>,

    /// Compression of reconverted OCI layers (gzip, zstd, uncompressed)
    #[arg(long, global = true)]
    pub oci_compressor: Option<String>,
}

impl ConfigArgs {
    /// Resolve the effective configuration: file, then environment, then
    /// command-line flags.
    pub fn load(&self) -> Result<ConvertConfig, Box<dyn std::error::Error>> {
        let config = match &self.config {
            Some(path) => ConvertConfig::from_file(path)?,
            None => ConvertConfig::default(),
        };
        let config = self.apply(config.with_env());
        config.validate()?;
        tracing::debug!(?config, "Resolved configuration");
        Ok(config)
    }

    fn apply(&self, mut config: ConvertConfig) -> ConvertConfig {
        if let Some(builder) = &self.builder {
            config.builder_path = builder.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(fs_version) = &self.fs_version {
            config.fs_version = fs_version.clone();
        }
        if let Some(chunk_dict) = &self.chunk_dict {
            config.chunk_dict_path = Some(chunk_dict.clone());
        }
        if let Some(compressor) = &self.compressor {
            config.compressor = Some(compressor.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = Some(timeout);
        }
        if let Some(marker) = self.index_marker {
            config.index_marker = marker;
        }
        if let Some(compressor) = &self.oci_compressor {
            config.oci_compressor = compressor.clone();
        }
        config
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.config.load()?;
    match cli.command {
        Command::Pack(args) => pack::execute(args, &config).await,
        Command::Merge(args) => merge::execute(args, &config).await,
        Command::Unpack(args) => unpack::execute(args, &config).await,
        Command::Convert(args) => convert::execute(args, &config).await,
        Command::Reconvert(args) => reconvert::execute(args, &config).await,
    }
}
