//! Nydus Convert - OCI ⇄ nydus (RAFS) conversion engine.
//!
//! Layers are packed into framed nydus blobs by driving the external
//! `nydus-image` builder, merged into a single bootstrap, and unpacked back
//! into OCI tar streams. On top of the stream pipelines sit converters that
//! rewrite whole images held in a content store.

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod buffer;
pub mod builder;
pub mod content;
pub mod convert;
pub mod digest;
pub mod fifo;
pub mod framing;
pub mod oci;
pub mod pipeline;
pub mod reader;

// Re-export common types
pub use backend::Backend;
pub use builder::Builder;
pub use content::{ContentStore, ContentWriter, LocalContentStore};
pub use convert::{
    annotate_index, reconvert_manifest, ImageConverter, LayerConvert, LayerConverter,
    LayerReconverter, ManifestDraft, ManifestHook, ManifestRewriter, ReconvertHook, Staged,
};
pub use digest::{chain_id, Digest};
pub use framing::{Segment, BLOB_NAME, BOOTSTRAP_NAME};
pub use pipeline::{merge, pack, pack_from, unpack, Layer, MergeOption, PackOption, UnpackOption};
pub use reader::{FileReaderAt, ReaderAt};

pub use nydus_convert_core::{ConvertConfig, ConvertError, IndexMarker, Result};
