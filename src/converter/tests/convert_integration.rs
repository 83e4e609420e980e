//! Whole-image conversion over a local content store.
//!
//! Seeds an OCI layout with a two-layer image (the lower layer holds two
//! files, the upper layer whites one of them out and adds three more),
//! converts it to nydus and back with the stand-in builder from `common`,
//! and checks the resulting manifests, configs, index and labels.
//!
//! ## Prerequisites
//!
//! A POSIX shell with `tar`, `sha256sum`, `grep` and `find` on `PATH`.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p nydus-convert --test convert_integration
//! ```

#![cfg(unix)]

mod common;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use common::*;
use nydus_convert::content::{commit, read_blob, read_json, write_json, Labels};
use nydus_convert::oci::*;
use nydus_convert::{
    Backend, ContentStore, ConvertConfig, Digest, ImageConverter, IndexMarker, LocalContentStore,
};

fn config(root: &Path) -> ConvertConfig {
    ConvertConfig {
        builder_path: fake_builder(),
        work_dir: root.join("work"),
        ..Default::default()
    }
}

async fn put_blob(store: &LocalContentStore, data: &[u8], labels: Labels) -> Digest {
    let mut writer = store.writer("seed").await.unwrap();
    writer.write_all(data).unwrap();
    commit(store, writer, labels).await.unwrap()
}

/// Seed a docker-typed manifest with `layers` (uncompressed tars) and return
/// its descriptor.
async fn seed_manifest(store: &LocalContentStore, layers: &[Vec<u8>]) -> Descriptor {
    let mut descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    let mut history = Vec::new();
    for (i, tar) in layers.iter().enumerate() {
        let compressed = gzip(tar);
        let digest = put_blob(store, &compressed, Labels::new()).await;
        descriptors.push(descriptor(
            MEDIA_TYPE_DOCKER_LAYER_GZIP,
            &digest,
            compressed.len() as u64,
        ));
        diff_ids.push(Digest::from_bytes(tar));
        history.push(serde_json::json!({"created_by": format!("COPY layer-{} /", i)}));
        history.push(serde_json::json!({
            "created_by": format!("ENV STEP={}", i),
            "empty_layer": true,
        }));
    }

    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Env": ["PATH=/usr/bin"]},
        "rootfs": {"type": "layers", "diff_ids": diff_ids},
        "history": history,
    });
    let config_data = serde_json::to_vec(&config).unwrap();
    let config_digest = put_blob(store, &config_data, Labels::new()).await;

    let manifest = ImageManifestBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::from(MEDIA_TYPE_DOCKER_MANIFEST))
        .config(descriptor(
            MEDIA_TYPE_DOCKER_CONFIG,
            &config_digest,
            config_data.len() as u64,
        ))
        .layers(descriptors)
        .build()
        .unwrap();
    let mut labels = Labels::new();
    set_manifest_gc_labels(&mut labels, &manifest);
    let manifest_digest = write_json(store, "seed-manifest", &manifest, labels)
        .await
        .unwrap();
    let manifest_size = read_blob(store, &manifest_digest).await.unwrap().len() as u64;
    descriptor(MEDIA_TYPE_DOCKER_MANIFEST, &manifest_digest, manifest_size)
}

/// Seed a docker-typed index with one manifest per platform and return the
/// index descriptor.
async fn seed_index(store: &LocalContentStore, images: &[(Arch, Vec<Vec<u8>>)]) -> Descriptor {
    let mut manifests = Vec::new();
    for (arch, layers) in images {
        let mut entry = seed_manifest(store, layers).await;
        let mut platform = Platform::default();
        platform.set_architecture(arch.clone());
        platform.set_os(Os::Linux);
        entry.set_platform(Some(platform));
        manifests.push(entry);
    }

    let index = ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .media_type(MediaType::from(MEDIA_TYPE_DOCKER_MANIFEST_LIST))
        .manifests(manifests)
        .build()
        .unwrap();
    let mut labels = Labels::new();
    set_index_gc_labels(&mut labels, &index);
    let index_digest = write_json(store, "seed-index", &index, labels).await.unwrap();
    let index_size = read_blob(store, &index_digest).await.unwrap().len() as u64;
    descriptor(MEDIA_TYPE_DOCKER_MANIFEST_LIST, &index_digest, index_size)
}

/// Seed a single-platform image with `layers`.
async fn seed_image(store: &LocalContentStore, layers: &[Vec<u8>]) -> Descriptor {
    seed_index(store, &[(Arch::Amd64, layers.to_vec())]).await
}

fn digest_of(desc: &Descriptor) -> Digest {
    desc.content_digest().unwrap()
}

struct Converted {
    index: ImageIndex,
    manifest: ImageManifest,
    manifest_labels: Labels,
    config: ImageConfig,
}

async fn load(store: &LocalContentStore, root: &Descriptor) -> Converted {
    let (index, _): (ImageIndex, Labels) = read_json(store, &digest_of(root)).await.unwrap();
    assert_eq!(index.manifests().len(), 1);
    let (manifest, manifest_labels): (ImageManifest, Labels) =
        read_json(store, &digest_of(&index.manifests()[0])).await.unwrap();
    let (config, _): (ImageConfig, Labels) =
        read_json(store, &digest_of(manifest.config())).await.unwrap();
    Converted {
        index,
        manifest,
        manifest_labels,
        config,
    }
}

fn blob_ids(bootstrap: &Descriptor) -> Vec<String> {
    serde_json::from_str(bootstrap.annotation(ANNOTATION_NYDUS_BLOB_IDS).unwrap()).unwrap()
}

fn assert_gc_labels(converted: &Converted) {
    let labels = &converted.manifest_labels;
    let layers = converted.manifest.layers();
    assert_eq!(labels[GC_REF_CONFIG], *converted.manifest.config().digest());
    for (i, layer) in layers.iter().enumerate() {
        assert_eq!(labels[&gc_layer_label(i)], *layer.digest());
    }
    assert!(!labels.contains_key(&gc_layer_label(layers.len())));
}

#[tokio::test]
async fn test_convert_image_to_nydus() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());
    let root = seed_image(&store, &[lower_tar(), upper_tar()]).await;

    let converter = ImageConverter::nydus(store.clone(), &config(tmp.path()), None);
    let new_root = converter.convert(&root).await.unwrap();
    assert_ne!(new_root.digest(), root.digest());
    assert_eq!(*new_root.media_type(), MediaType::ImageIndex);

    let converted = load(&store, &new_root).await;
    let entry = &converted.index.manifests()[0];
    assert!(is_nydus_manifest(entry));
    assert_eq!(*entry.media_type(), MediaType::ImageManifest);
    assert_eq!(*entry.platform().as_ref().unwrap().architecture(), Arch::Amd64);

    let manifest = &converted.manifest;
    let layers = manifest.layers();
    assert_eq!(*manifest.media_type(), Some(MediaType::ImageManifest));
    assert_eq!(*manifest.config().media_type(), MediaType::ImageConfig);
    assert_eq!(layers.len(), 3);
    assert!(layers[..2].iter().all(is_nydus_blob));
    let bootstrap = &layers[2];
    assert!(is_nydus_bootstrap(bootstrap));
    assert_eq!(bootstrap.media_type_str(), MEDIA_TYPE_LAYER_GZIP);
    assert_eq!(
        bootstrap.annotation(ANNOTATION_NYDUS_FS_VERSION),
        Some("5")
    );
    assert!(layers
        .iter()
        .all(|l| l.annotation(ANNOTATION_UNCOMPRESSED).is_none()));
    assert_eq!(
        blob_ids(bootstrap),
        vec![
            digest_of(&layers[0]).hex().to_string(),
            digest_of(&layers[1]).hex().to_string(),
        ]
    );

    // DiffIDs: blob digests for nydus blobs, uncompressed digest for the
    // bootstrap layer.
    let diff_ids = converted.config.diff_ids().unwrap();
    assert_eq!(diff_ids.len(), layers.len());
    assert_eq!(diff_ids[0], digest_of(&layers[0]));
    assert_eq!(diff_ids[1], digest_of(&layers[1]));
    let bootstrap_tar = gunzip(&read_blob(store.as_ref(), &digest_of(bootstrap)).await.unwrap());
    assert_eq!(diff_ids[2], Digest::from_bytes(&bootstrap_tar));
    assert!(tar_files(&bootstrap_tar).contains_key("image/image.boot"));

    // Unknown config fields survive the rewrite.
    assert_eq!(converted.config.extra["architecture"], "amd64");
    let history = &converted.config.history;
    assert_eq!(history.len(), 5);
    let last = history.last().unwrap();
    assert_eq!(last.comment().as_deref(), Some(BOOTSTRAP_HISTORY_COMMENT));
    assert_eq!(last.created_by().as_deref(), Some(BOOTSTRAP_HISTORY_CREATED_BY));

    assert_gc_labels(&converted);
    let info = store.info(&digest_of(bootstrap)).await.unwrap();
    assert_eq!(info.labels[ANNOTATION_UNCOMPRESSED], diff_ids[2].to_string());
}

#[tokio::test]
async fn test_convert_manifest_root() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());
    let index_root = seed_image(&store, &[lower_tar()]).await;
    let (index, _): (ImageIndex, Labels) =
        read_json(store.as_ref(), &digest_of(&index_root)).await.unwrap();

    let converter = ImageConverter::nydus(store.clone(), &config(tmp.path()), None);
    let new = converter.convert(&index.manifests()[0]).await.unwrap();
    assert_eq!(*new.media_type(), MediaType::ImageManifest);

    let (manifest, _): (ImageManifest, Labels) =
        read_json(store.as_ref(), &digest_of(&new)).await.unwrap();
    assert_eq!(manifest.layers().len(), 2);
    assert!(is_nydus_blob(&manifest.layers()[0]));
    assert!(is_nydus_bootstrap(&manifest.layers()[1]));
}

#[tokio::test]
async fn test_convert_with_backend_keeps_only_bootstrap() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());
    let root = seed_image(&store, &[lower_tar(), upper_tar()]).await;

    let backend = Arc::new(MemoryBackend::default());
    let converter = ImageConverter::nydus(
        store.clone(),
        &config(tmp.path()),
        Some(backend.clone() as Arc<dyn Backend>),
    );
    let new_root = converter.convert(&root).await.unwrap();

    let converted = load(&store, &new_root).await;
    let layers = converted.manifest.layers();
    assert_eq!(layers.len(), 1);
    assert!(is_nydus_bootstrap(&layers[0]));
    assert_eq!(converted.config.diff_ids().unwrap().len(), 1);

    let ids = blob_ids(&layers[0]);
    assert_eq!(ids.len(), 2);
    assert_eq!(backend.pushes(), 2);
    for id in ids {
        assert!(backend.contains(&Digest::from_hex(&id).unwrap()));
    }

    // Three non-empty history entries no longer describe one layer.
    assert!(converted.config.history.is_empty());
    assert_gc_labels(&converted);
}

#[tokio::test]
async fn test_convert_with_chunk_dict_references_dictionary_blobs() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());

    // The fake builder's bootstrap lists chunk digests; a dictionary holding
    // every chunk of the lower layer makes the lower blob redundant.
    let dict = tmp.path().join("dict.boot");
    std::fs::write(
        &dict,
        format!(
            "{}\n{}\n",
            Digest::from_bytes(b"lower-file-1").hex(),
            Digest::from_bytes(b"lower-file-2").hex()
        ),
    )
    .unwrap();
    let mut config = config(tmp.path());
    config.chunk_dict_path = Some(dict);

    let root = seed_image(&store, &[lower_tar(), upper_tar()]).await;
    let converter = ImageConverter::nydus(store.clone(), &config, None);
    let converted = load(&store, &converter.convert(&root).await.unwrap()).await;

    let layers = converted.manifest.layers();
    assert_eq!(layers.len(), 2);
    assert!(is_nydus_blob(&layers[0]));
    assert!(is_nydus_bootstrap(&layers[1]));
    assert_eq!(
        blob_ids(&layers[1]),
        vec![digest_of(&layers[0]).hex().to_string()]
    );
    assert_eq!(converted.config.diff_ids().unwrap().len(), 2);
    assert!(converted.config.history.is_empty());
}

#[tokio::test]
async fn test_convert_artifact_type_marker() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());
    let root = seed_image(&store, &[lower_tar()]).await;

    let mut config = config(tmp.path());
    config.index_marker = IndexMarker::ArtifactType;
    let converter = ImageConverter::nydus(store.clone(), &config, None);
    let converted = load(&store, &converter.convert(&root).await.unwrap()).await;

    let entry = &converted.index.manifests()[0];
    assert_eq!(
        *entry.artifact_type(),
        Some(MediaType::from(NYDUS_ARTIFACT_TYPE))
    );
    assert!(entry.platform().as_ref().unwrap().os_features().is_none());
}

#[tokio::test]
async fn test_failed_merge_commits_no_documents() {
    let tmp = tempfile::TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    let store = Arc::new(LocalContentStore::open(&layout).unwrap());
    let root = seed_image(&store, &[lower_tar(), upper_tar()]).await;
    let blobs_before = dir_entries(&layout.join("blobs/sha256")).len();

    let mut config = config(tmp.path());
    config.builder_path = write_script(
        "merge-failing-builder",
        &format!(
            "#!/bin/sh\nif [ \"$1\" = merge ]; then cat > /dev/null; exit 5; fi\nexec {} \"$@\"\n",
            fake_builder().display()
        ),
    );
    let converter = ImageConverter::nydus(store.clone(), &config, None);
    let err = converter.convert(&root).await.unwrap_err();
    assert!(
        matches!(err.root(), nydus_convert::ConvertError::BuilderFailed { code: 5, .. }),
        "{}",
        err
    );

    // Only the two unreferenced nydus layer blobs were committed.
    assert_eq!(
        dir_entries(&layout.join("blobs/sha256")).len(),
        blobs_before + 2
    );
    assert!(dir_entries(&layout.join("ingest")).is_empty());
    assert!(dir_entries(&tmp.path().join("work")).is_empty());
}

#[tokio::test]
async fn test_failed_second_manifest_commits_no_documents() {
    let tmp = tempfile::TempDir::new().unwrap();
    let layout = tmp.path().join("layout");
    let store = Arc::new(LocalContentStore::open(&layout).unwrap());
    let root = seed_index(
        &store,
        &[
            (Arch::Amd64, vec![lower_tar(), upper_tar()]),
            (Arch::ARM64, vec![lower_tar()]),
        ],
    )
    .await;
    let blobs_before = dir_entries(&layout.join("blobs/sha256")).len();

    // The first merge succeeds and leaves a marker; the second one fails.
    let marker = tmp.path().join("merged-once");
    let mut config = config(tmp.path());
    config.builder_path = write_script(
        "second-merge-failing-builder",
        &format!(
            "#!/bin/sh\n\
             if [ \"$1\" = merge ]; then\n\
               if [ -e {marker} ]; then cat > /dev/null; exit 7; fi\n\
               touch {marker}\n\
             fi\n\
             exec {builder} \"$@\"\n",
            marker = marker.display(),
            builder = fake_builder().display()
        ),
    );
    let converter = ImageConverter::nydus(store.clone(), &config, None);
    let err = converter.convert(&root).await.unwrap_err();
    assert!(
        matches!(err.root(), nydus_convert::ConvertError::BuilderFailed { code: 7, .. }),
        "{}",
        err
    );
    assert!(marker.exists());

    // Neither the first manifest, its config nor its bootstrap was committed.
    // Only the two shared nydus layer blobs were.
    assert_eq!(
        dir_entries(&layout.join("blobs/sha256")).len(),
        blobs_before + 2
    );
    assert!(dir_entries(&layout.join("ingest")).is_empty());
}

#[tokio::test]
async fn test_reconvert_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let store = Arc::new(LocalContentStore::open(&tmp.path().join("layout")).unwrap());
    let root = seed_image(&store, &[lower_tar(), upper_tar()]).await;
    let config = config(tmp.path());

    let nydus_root = ImageConverter::nydus(store.clone(), &config, None)
        .convert(&root)
        .await
        .unwrap();
    let oci_root = ImageConverter::oci(store.clone(), &config)
        .unwrap()
        .convert(&nydus_root)
        .await
        .unwrap();

    let converted = load(&store, &oci_root).await;
    assert!(!is_nydus_manifest(&converted.index.manifests()[0]));

    let layers = converted.manifest.layers();
    assert_eq!(layers.len(), 2);
    let diff_ids = converted.config.diff_ids().unwrap();
    assert_eq!(diff_ids.len(), 2);

    for ((layer, diff_id), source) in layers
        .iter()
        .zip(&diff_ids)
        .zip([lower_tar(), upper_tar()])
    {
        assert_eq!(*layer.media_type(), MediaType::ImageLayerGzip);
        assert!(!is_nydus_blob(layer));
        let tar = gunzip(&read_blob(store.as_ref(), &digest_of(layer)).await.unwrap());
        assert_eq!(&Digest::from_bytes(&tar), diff_id);
        assert_eq!(tar_files(&tar), tar_files(&source));
    }

    // The bootstrap history entry is gone, the layer entries remain.
    let history = &converted.config.history;
    assert_eq!(history.iter().filter(|h| !is_empty_layer(h)).count(), 2);
    assert!(history
        .iter()
        .all(|h| h.comment().as_deref() != Some(BOOTSTRAP_HISTORY_COMMENT)));
    assert_gc_labels(&converted);
}
