//! Invocation contract of the external nydus builder (`nydus-image`).
//!
//! Three operations are driven: `create` (directory to bootstrap and blob),
//! `merge` (many bootstraps to one, reporting referenced blob IDs in a JSON
//! file) and `unpack` (bootstrap and blob back to an OCI tar). The builder's
//! stdout and stderr are forwarded line by line to `tracing`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nydus_convert_core::config::{ConvertConfig, DEFAULT_FS_VERSION};
use nydus_convert_core::error::{ConvertError, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::digest::Digest;

/// Prefetch pattern used when none is given: prefetch the whole tree.
pub const DEFAULT_PREFETCH_PATTERNS: &str = "/";

/// How long output of an exited builder is still forwarded.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Arguments of `nydus-image create`.
#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub source_path: PathBuf,
    pub blob_path: PathBuf,
    pub bootstrap_path: PathBuf,
    pub fs_version: String,
    pub chunk_dict_path: Option<PathBuf>,
    pub prefetch_patterns: String,
    pub compressor: Option<String>,
}

impl CreateArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        let fs_version = if self.fs_version.is_empty() {
            DEFAULT_FS_VERSION
        } else {
            &self.fs_version
        };
        let mut args: Vec<OsString> = vec![
            "create".into(),
            "--log-level".into(),
            "warn".into(),
            "--prefetch-policy".into(),
            "fs".into(),
            "--blob".into(),
            self.blob_path.clone().into(),
            "--bootstrap".into(),
            self.bootstrap_path.clone().into(),
            "--source-type".into(),
            "directory".into(),
            "--whiteout-spec".into(),
            "none".into(),
            "--fs-version".into(),
            fs_version.into(),
        ];
        push_chunk_dict(&mut args, self.chunk_dict_path.as_deref());
        if let Some(compressor) = &self.compressor {
            args.push("--compressor".into());
            args.push(compressor.into());
        }
        args.push(self.source_path.clone().into());
        args
    }
}

/// Arguments of `nydus-image merge`.
#[derive(Debug, Clone)]
pub struct MergeArgs {
    /// Per-layer bootstraps, lowest layer first. Order is significant.
    pub source_bootstrap_paths: Vec<PathBuf>,
    pub target_bootstrap_path: PathBuf,
    pub output_json_path: PathBuf,
    pub chunk_dict_path: Option<PathBuf>,
    pub prefetch_patterns: String,
}

impl MergeArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "merge".into(),
            "--log-level".into(),
            "warn".into(),
            "--prefetch-policy".into(),
            "fs".into(),
            "--output-json".into(),
            self.output_json_path.clone().into(),
            "--bootstrap".into(),
            self.target_bootstrap_path.clone().into(),
        ];
        push_chunk_dict(&mut args, self.chunk_dict_path.as_deref());
        args.extend(self.source_bootstrap_paths.iter().map(|p| p.clone().into()));
        args
    }
}

/// Arguments of `nydus-image unpack`.
#[derive(Debug, Clone)]
pub struct UnpackArgs {
    pub bootstrap_path: PathBuf,
    pub blob_path: Option<PathBuf>,
    pub tar_path: PathBuf,
}

impl UnpackArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "unpack".into(),
            "--log-level".into(),
            "warn".into(),
            "--bootstrap".into(),
            self.bootstrap_path.clone().into(),
            "--output".into(),
            self.tar_path.clone().into(),
        ];
        if let Some(blob) = &self.blob_path {
            args.push("--blob".into());
            args.push(blob.clone().into());
        }
        args
    }
}

fn push_chunk_dict(args: &mut Vec<OsString>, chunk_dict: Option<&Path>) {
    if let Some(path) = chunk_dict {
        let mut value = OsString::from("bootstrap=");
        value.push(path);
        args.push("--chunk-dict".into());
        args.push(value);
    }
}

#[derive(Debug, Deserialize)]
struct MergeOutput {
    #[serde(alias = "Blobs")]
    blobs: Vec<String>,
}

/// Parse the JSON written by `merge --output-json` into blob digests.
pub fn parse_merge_output(path: &Path) -> Result<Vec<Digest>> {
    let output_error = |reason: String| ConvertError::BuilderOutput {
        path: path.to_path_buf(),
        reason,
    };

    let data = std::fs::read(path).map_err(|e| output_error(format!("read: {}", e)))?;
    let output: MergeOutput =
        serde_json::from_slice(&data).map_err(|e| output_error(format!("parse: {}", e)))?;

    output
        .blobs
        .iter()
        .map(|id| Digest::from_hex(id).map_err(|e| output_error(e.to_string())))
        .collect()
}

/// Handle on a builder binary.
#[derive(Debug, Clone)]
pub struct Builder {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl Builder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
        }
    }

    /// Builder described by a configuration.
    pub fn from_config(config: &ConvertConfig) -> Self {
        Self::new(&config.builder_path).with_timeout(config.timeout())
    }

    /// Hard deadline for every invocation; the process is killed on expiry.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a bootstrap and blob from a directory.
    pub async fn create(&self, args: &CreateArgs) -> Result<()> {
        let patterns = if args.prefetch_patterns.is_empty() {
            DEFAULT_PREFETCH_PATTERNS
        } else {
            &args.prefetch_patterns
        };
        self.run("create", args.to_args(), Some(patterns)).await
    }

    /// Merge bootstraps, returning the blob digests the result references.
    pub async fn merge(&self, args: &MergeArgs) -> Result<Vec<Digest>> {
        let patterns = if args.prefetch_patterns.is_empty() {
            DEFAULT_PREFETCH_PATTERNS
        } else {
            &args.prefetch_patterns
        };
        self.run("merge", args.to_args(), Some(patterns)).await?;
        parse_merge_output(&args.output_json_path)
    }

    /// Convert a bootstrap and blob back into an OCI tar.
    pub async fn unpack(&self, args: &UnpackArgs) -> Result<()> {
        self.run("unpack", args.to_args(), None).await
    }

    async fn run(&self, op: &str, args: Vec<OsString>, stdin: Option<&str>) -> Result<()> {
        tracing::debug!(
            builder = %self.path.display(),
            op,
            args = ?args,
            "Running builder"
        );

        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConvertError::IoError(e).context(format!(
                    "spawn builder {} for {}",
                    self.path.display(),
                    op
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, op.to_string(), "stdout")));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, op.to_string(), "stderr")));
        let forwarders: Vec<JoinHandle<()>> = [stdout, stderr].into_iter().flatten().collect();

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // The builder may exit without reading its input.
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ConvertError::IoError(e).context(format!("write {} stdin", op)));
                }
            }
        }

        let status = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    child.kill().await.ok();
                    for forwarder in &forwarders {
                        forwarder.abort();
                    }
                    tracing::error!(
                        builder = %self.path.display(),
                        op,
                        ?timeout,
                        "Builder timed out and was killed"
                    );
                    return Err(ConvertError::BuilderTimeout {
                        op: op.to_string(),
                        timeout,
                    });
                }
            },
            None => child.wait().await?,
        };

        drain_output(op, forwarders).await;
        check_status(op, status)
    }
}

fn check_status(op: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        tracing::error!(op, code, "Builder failed");
        return Err(ConvertError::BuilderFailed {
            op: op.to_string(),
            code,
        });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            tracing::error!(op, signal, "Builder killed by signal");
            return Err(ConvertError::BuilderKilled {
                op: op.to_string(),
                signal,
            });
        }
    }
    Err(ConvertError::BuilderFailed {
        op: op.to_string(),
        code: -1,
    })
}

/// Let the forwarders finish the output of an exited builder. A descendant
/// may still hold the pipes open, so forwarding stops after
/// [`OUTPUT_DRAIN_TIMEOUT`].
async fn drain_output(op: &str, forwarders: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
    for mut forwarder in forwarders {
        if tokio::time::timeout_at(deadline, &mut forwarder).await.is_err() {
            forwarder.abort();
            tracing::warn!(op, "Builder output still open after exit, stopped forwarding");
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, op: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::info!(target: "nydus_convert::builder", op = %op, stream, "{}", line)
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(op = %op, stream, error = %e, "Failed to read builder output");
                break;
            }
        }
    }
}
