//! Filesystem content store over an OCI image layout.
//!
//! ```text
//! <root>/oci-layout             layout version marker
//! <root>/index.json             layout entry points
//! <root>/blobs/sha256/<hex>     committed content
//! <root>/labels/<hex>.json      labels and timestamps
//! <root>/ingest/<ref>-*         staged writes
//! ```

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nydus_convert_core::error::{ConvertError, Result, ResultExt};
use tempfile::NamedTempFile;

use super::{ContentStore, ContentWriter, Info, Labels};
use crate::digest::{Digest, Digester};
use crate::oci::{ImageIndex, ImageIndexBuilder, MediaType, SCHEMA_VERSION};
use crate::reader::{FileReaderAt, ReaderAt};

const OCI_LAYOUT: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_JSON: &str = "index.json";

/// Content store rooted at an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    /// Open (creating if needed) a store at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in ["blobs/sha256", "labels", "ingest"] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("create {}", root.join(dir).display()))?;
        }
        let layout = root.join(OCI_LAYOUT);
        if !layout.exists() {
            std::fs::write(&layout, OCI_LAYOUT_CONTENT)
                .with_context(|| format!("write {}", layout.display()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of committed content.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    /// The layout's `index.json`, empty when the layout has none yet.
    pub fn read_layout_index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_JSON);
        match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("decode {}", path.display())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => ImageIndexBuilder::default()
                .schema_version(SCHEMA_VERSION)
                .media_type(MediaType::ImageIndex)
                .manifests(Vec::new())
                .build()
                .map_err(|e| ConvertError::ManifestError(e.to_string())),
            Err(e) => Err(ConvertError::IoError(e).context(format!("read {}", path.display()))),
        }
    }

    /// Atomically replace the layout's `index.json`.
    pub fn write_layout_index(&self, index: &ImageIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&data)?;
        tmp.persist(self.root.join(INDEX_JSON))
            .map_err(|e| ConvertError::IoError(e.error).context("write index.json"))?;
        Ok(())
    }

    fn labels_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("labels").join(format!("{}.json", digest.hex()))
    }

    async fn load_info(&self, digest: &Digest) -> Result<Info> {
        let metadata = match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConvertError::NotFound {
                    digest: digest.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        match tokio::fs::read(self.labels_path(digest)).await {
            Ok(data) => {
                let mut info: Info = serde_json::from_slice(&data)
                    .with_context(|| format!("decode labels of {}", digest))?;
                info.size = metadata.len();
                Ok(info)
            }
            // Content placed in the layout by other tools has no labels yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let modified: DateTime<Utc> = metadata
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Info {
                    digest: digest.clone(),
                    size: metadata.len(),
                    labels: Labels::new(),
                    created_at: modified,
                    updated_at: modified,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn save_info(path: &Path, info: &Info) -> Result<()> {
    let data = serde_json::to_vec_pretty(info)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&data)?;
    tmp.persist(path).map_err(|e| ConvertError::IoError(e.error))?;
    Ok(())
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn info(&self, digest: &Digest) -> Result<Info> {
        self.load_info(digest).await
    }

    async fn update_labels(&self, digest: &Digest, labels: Labels) -> Result<Info> {
        let mut info = self.load_info(digest).await?;
        for (key, value) in labels {
            if value.is_empty() {
                info.labels.remove(&key);
            } else {
                info.labels.insert(key, value);
            }
        }
        info.updated_at = Utc::now();
        save_info(&self.labels_path(digest), &info)?;
        tracing::debug!(%digest, labels = info.labels.len(), "Updated content labels");
        Ok(info)
    }

    async fn reader_at(&self, digest: &Digest) -> Result<Arc<dyn ReaderAt>> {
        match FileReaderAt::open(&self.blob_path(digest)) {
            Ok(reader) => Ok(Arc::new(reader)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ConvertError::NotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(ConvertError::IoError(e).context(format!("open {}", digest))),
        }
    }

    async fn writer(&self, reference: &str) -> Result<Box<dyn ContentWriter>> {
        let prefix: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", prefix))
            .tempfile_in(self.root.join("ingest"))
            .with_context(|| format!("open ingest for {}", reference))?;
        Ok(Box::new(LocalWriter {
            store: self.clone(),
            reference: reference.to_string(),
            file,
            digester: Digester::new(),
        }))
    }
}

/// Staged write into a [`LocalContentStore`].
struct LocalWriter {
    store: LocalContentStore,
    reference: String,
    file: NamedTempFile,
    digester: Digester,
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl ContentWriter for LocalWriter {
    fn digest(&self) -> Digest {
        self.digester.digest()
    }

    fn size(&self) -> u64 {
        self.digester.written()
    }

    fn commit(self: Box<Self>, expected: Option<&Digest>, labels: Labels) -> Result<Digest> {
        let mut this = *self;
        this.file.flush()?;

        let digest = this.digester.digest();
        if let Some(expected) = expected {
            if *expected != digest {
                return Err(ConvertError::ContentError(format!(
                    "commit {}: content digest {} does not match expected {}",
                    this.reference, digest, expected
                )));
            }
        }

        let target = this.store.blob_path(&digest);
        if target.exists() {
            return Err(ConvertError::AlreadyExists {
                digest: digest.to_string(),
            });
        }
        this.file
            .persist(&target)
            .map_err(|e| ConvertError::IoError(e.error).context(format!("commit {}", digest)))?;

        let now = Utc::now();
        save_info(
            &this.store.labels_path(&digest),
            &Info {
                digest: digest.clone(),
                size: this.digester.written(),
                labels,
                created_at: now,
                updated_at: now,
            },
        )?;

        tracing::debug!(
            reference = %this.reference,
            %digest,
            size = this.digester.written(),
            "Committed content"
        );
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{commit, read_blob, read_json, write_json};
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalContentStore) {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_write_commit_read() {
        let (_tmp, store) = store();
        let mut writer = store.writer("test-ref").await.unwrap();
        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.size(), 5);

        let labels = Labels::from([("a".to_string(), "1".to_string())]);
        let digest = writer.commit(None, labels.clone()).unwrap();
        assert_eq!(digest, Digest::from_bytes(b"hello"));

        assert_eq!(read_blob(&store, &digest).await.unwrap(), b"hello");
        let info = store.info(&digest).await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.labels, labels);
    }

    #[tokio::test]
    async fn test_uncommitted_writer_leaves_nothing() {
        let (tmp, store) = store();
        let mut writer = store.writer("convert-nydus-from-x").await.unwrap();
        writer.write_all(b"partial").unwrap();
        let digest = writer.digest();
        drop(writer);

        assert!(store.info(&digest).await.unwrap_err().is_not_found());
        assert_eq!(std::fs::read_dir(tmp.path().join("ingest")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_commit_existing_and_mismatch() {
        let (_tmp, store) = store();
        let mut first = store.writer("a").await.unwrap();
        first.write_all(b"same").unwrap();
        first.commit(None, Labels::new()).unwrap();

        let mut second = store.writer("b").await.unwrap();
        second.write_all(b"same").unwrap();
        assert!(second.commit(None, Labels::new()).unwrap_err().is_already_exists());

        let mut third = store.writer("c").await.unwrap();
        third.write_all(b"other").unwrap();
        let wrong = Digest::from_bytes(b"same");
        assert!(matches!(
            third.commit(Some(&wrong), Labels::new()),
            Err(ConvertError::ContentError(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_helper_tolerates_existing() {
        let (_tmp, store) = store();
        let digest = write_json(&store, "doc", &serde_json::json!({"k": "v"}), Labels::new())
            .await
            .unwrap();

        let mut writer = store.writer("doc-again").await.unwrap();
        writer.write_all(br#"{"k":"v"}"#).unwrap();
        let labels = Labels::from([("x".to_string(), "y".to_string())]);
        assert_eq!(commit(&store, writer, labels).await.unwrap(), digest);

        let (value, labels): (serde_json::Value, _) = read_json(&store, &digest).await.unwrap();
        assert_eq!(value["k"], "v");
        assert_eq!(labels.get("x").map(String::as_str), Some("y"));
    }

    #[tokio::test]
    async fn test_update_labels_merges_and_removes() {
        let (_tmp, store) = store();
        let mut writer = store.writer("w").await.unwrap();
        writer.write_all(b"x").unwrap();
        let digest = writer
            .commit(
                None,
                Labels::from([
                    ("keep".to_string(), "1".to_string()),
                    ("drop".to_string(), "2".to_string()),
                ]),
            )
            .unwrap();

        let info = store
            .update_labels(
                &digest,
                Labels::from([
                    ("drop".to_string(), String::new()),
                    ("new".to_string(), "3".to_string()),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(
            info.labels,
            Labels::from([
                ("keep".to_string(), "1".to_string()),
                ("new".to_string(), "3".to_string()),
            ])
        );
        assert!(info.updated_at >= info.created_at);
    }

    #[tokio::test]
    async fn test_unlabelled_layout_blob() {
        let (tmp, store) = store();
        let digest = Digest::from_bytes(b"external");
        std::fs::write(
            tmp.path().join("blobs/sha256").join(digest.hex()),
            b"external",
        )
        .unwrap();

        let info = store.info(&digest).await.unwrap();
        assert_eq!(info.size, 8);
        assert!(info.labels.is_empty());
        assert_eq!(store.reader_at(&digest).await.unwrap().size(), 8);
    }

    #[test]
    fn test_layout_index() {
        let (tmp, store) = store();
        assert!(tmp.path().join("oci-layout").exists());
        let mut index = store.read_layout_index().unwrap();
        assert!(index.manifests().is_empty());

        index.set_manifests(vec![crate::oci::descriptor(
            crate::oci::MEDIA_TYPE_IMAGE_MANIFEST,
            &Digest::from_bytes(b"m"),
            1,
        )]);
        store.write_layout_index(&index).unwrap();
        assert_eq!(store.read_layout_index().unwrap(), index);
    }

    #[tokio::test]
    async fn test_json_digest_ignores_annotation_order() {
        use crate::oci::{descriptor, DescriptorExt, MEDIA_TYPE_LAYER_GZIP};

        let (_tmp, store) = store();
        let keys: Vec<String> = (0..32).map(|i| format!("key-{}", i)).collect();
        let digest = Digest::from_bytes(b"layer");
        let mut forward = descriptor(MEDIA_TYPE_LAYER_GZIP, &digest, 1);
        for key in &keys {
            forward.set_annotation(key, "v");
        }
        let mut backward = descriptor(MEDIA_TYPE_LAYER_GZIP, &digest, 1);
        for key in keys.iter().rev() {
            backward.set_annotation(key, "v");
        }

        let a = write_json(&store, "a", &forward, Labels::new()).await.unwrap();
        let b = write_json(&store, "b", &backward, Labels::new()).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_missing_content() {
        let (_tmp, store) = store();
        let digest = Digest::from_bytes(b"missing");
        assert!(store.reader_at(&digest).await.err().unwrap().is_not_found());
        assert!(store
            .update_labels(&digest, Labels::new())
            .await
            .unwrap_err()
            .is_not_found());
    }
}
