//! Pipelines against a real `nydus-image` builder.
//!
//! ## Prerequisites
//!
//! - `nydus-image` from the nydus project (v2.1 or later)
//! - The path to it in `NYDUS_BUILDER`, unless it is on `PATH`
//!
//! ## Running
//!
//! ```bash
//! NYDUS_BUILDER=/usr/local/bin/nydus-image \
//!     cargo test -p nydus-convert --test nydus_image_integration -- --ignored --nocapture
//! ```

#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use nydus_convert::{
    merge, pack_from, unpack, ConvertConfig, Digest, Layer, MergeOption, PackOption, UnpackOption,
};

fn config(work_dir: &Path) -> ConvertConfig {
    ConvertConfig {
        work_dir: work_dir.to_path_buf(),
        ..Default::default()
    }
    .with_env()
}

async fn pack_layer(tar: &[u8], opt: PackOption) -> Layer {
    let mut src = tar;
    let framed = pack_from(&mut src, Vec::new(), opt).await.unwrap();
    Layer::new(Digest::from_bytes(&framed), Arc::new(framed))
}

#[tokio::test]
#[ignore] // Requires nydus-image
async fn test_real_builder_pack_unpack() {
    let work = tempfile::TempDir::new().unwrap();
    let config = config(work.path());

    let source = upper_tar();
    let layer = pack_layer(&source, PackOption::from_config(&config)).await;

    let mut tar = Vec::new();
    unpack(layer.reader, &mut tar, &UnpackOption::from_config(&config))
        .await
        .unwrap();
    assert_eq!(tar_files(&tar), tar_files(&source));
}

#[tokio::test]
#[ignore] // Requires nydus-image
async fn test_real_builder_chunk_dict_dedup() {
    let work = tempfile::TempDir::new().unwrap();
    let config = config(work.path());

    let dict_tar = oci_tar(&[
        ("dir-1", Entry::Dir),
        ("dir-1/file-1", Entry::File(b"lower-file-1")),
        ("dir-1/file-2", Entry::File(b"lower-file-2")),
        ("dir-1/file-3", Entry::File(b"lower-file-3")),
    ]);
    let dict = pack_layer(&dict_tar, PackOption::from_config(&config)).await;
    let mut dict_bootstrap = Vec::new();
    merge(&[dict], &mut dict_bootstrap, &MergeOption::from_config(&config))
        .await
        .unwrap();
    let dict_path = work.path().join("dict-bootstrap");
    std::fs::write(&dict_path, &dict_bootstrap).unwrap();

    let mut pack_opt = PackOption::from_config(&config);
    pack_opt.chunk_dict_path = Some(dict_path.clone());
    let lower = pack_layer(&lower_tar(), pack_opt.clone()).await;
    let upper = pack_layer(&upper_tar(), pack_opt).await;

    let mut merge_opt = MergeOption::from_config(&config);
    merge_opt.chunk_dict_path = Some(dict_path);
    let blobs = merge(
        &[lower.clone(), upper.clone()],
        &mut Vec::<u8>::new(),
        &merge_opt,
    )
    .await
    .unwrap();

    assert!(blobs.contains(&upper.digest), "{:?}", blobs);
    assert!(!blobs.contains(&lower.digest), "{:?}", blobs);
}
