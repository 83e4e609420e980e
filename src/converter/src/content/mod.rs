//! Content-addressable storage seam.
//!
//! Converters read layers and write their results through [`ContentStore`].
//! Writes are staged: a [`ContentWriter`] is invisible to readers until it is
//! committed, so a caller can prepare several blobs and commit them only once
//! the whole operation has succeeded.

mod local;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::reader::{ReaderAt, SectionReader};

pub use local::LocalContentStore;

/// Labels attached to stored content.
pub type Labels = BTreeMap<String, String>;

/// Metadata of committed content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub digest: Digest,
    pub size: u64,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A content store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Metadata of committed content.
    async fn info(&self, digest: &Digest) -> Result<Info>;

    /// Merge `labels` into the content's labels. An empty value removes the
    /// label.
    async fn update_labels(&self, digest: &Digest, labels: Labels) -> Result<Info>;

    /// Random access to committed content.
    async fn reader_at(&self, digest: &Digest) -> Result<Arc<dyn ReaderAt>>;

    /// Open a staged writer. `reference` names the write for diagnostics.
    async fn writer(&self, reference: &str) -> Result<Box<dyn ContentWriter>>;
}

/// Staged write into a [`ContentStore`]. Dropping it without committing
/// discards the data.
pub trait ContentWriter: Write + Send {
    /// Digest of everything written so far.
    fn digest(&self) -> Digest;

    /// Bytes written so far.
    fn size(&self) -> u64;

    /// Make the content visible under its digest.
    ///
    /// Fails with `AlreadyExists` when the store already holds the content,
    /// and with a content error when `expected` does not match.
    fn commit(self: Box<Self>, expected: Option<&Digest>, labels: Labels) -> Result<Digest>;
}

/// Commit `writer`, treating already-present content as success.
///
/// When the content exists its labels are updated instead.
pub async fn commit<S>(store: &S, writer: Box<dyn ContentWriter>, labels: Labels) -> Result<Digest>
where
    S: ContentStore + ?Sized,
{
    let digest = writer.digest();
    match writer.commit(Some(&digest), labels.clone()) {
        Ok(digest) => Ok(digest),
        Err(e) if e.is_already_exists() => {
            if !labels.is_empty() {
                store.update_labels(&digest, labels).await?;
            }
            Ok(digest)
        }
        Err(e) => Err(e),
    }
}

/// Read the whole of a blob into memory.
pub async fn read_blob<S>(store: &S, digest: &Digest) -> Result<Vec<u8>>
where
    S: ContentStore + ?Sized,
{
    let reader = store.reader_at(digest).await?;
    tokio::task::spawn_blocking(move || {
        let mut data = Vec::with_capacity(reader.size() as usize);
        SectionReader::new(reader.as_ref(), 0, reader.size()).read_to_end(&mut data)?;
        Ok::<_, ConvertError>(data)
    })
    .await
    .map_err(|e| ConvertError::TaskError(e.to_string()))?
}

/// Read and decode a JSON document together with its labels.
pub async fn read_json<S, T>(store: &S, digest: &Digest) -> Result<(T, Labels)>
where
    S: ContentStore + ?Sized,
    T: DeserializeOwned,
{
    let info = store.info(digest).await?;
    let data = read_blob(store, digest).await?;
    let value = serde_json::from_slice(&data).with_context(|| format!("decode json {}", digest))?;
    Ok((value, info.labels))
}

/// Encode `value` as JSON into a staged writer, returning it uncommitted.
///
/// Object keys are written in sorted order so that equal documents always
/// produce the same digest.
pub async fn stage_json<S, T>(
    store: &S,
    reference: &str,
    value: &T,
) -> Result<(Box<dyn ContentWriter>, Vec<u8>)>
where
    S: ContentStore + ?Sized,
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec(&serde_json::to_value(value)?)?;
    let mut writer = store.writer(reference).await?;
    writer.write_all(&data)?;
    Ok((writer, data))
}

/// Encode and commit `value` as JSON with `labels`.
pub async fn write_json<S, T>(store: &S, reference: &str, value: &T, labels: Labels) -> Result<Digest>
where
    S: ContentStore + ?Sized,
    T: Serialize + ?Sized,
{
    let (writer, _) = stage_json(store, reference, value).await?;
    commit(store, writer, labels)
        .await
        .with_context(|| format!("commit {}", reference))
}
