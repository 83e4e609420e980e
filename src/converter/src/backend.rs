//! Remote storage for nydus blobs.
//!
//! With a backend configured, converted blobs live in remote storage and the
//! image carries only the merged bootstrap layer.

use std::sync::Arc;

use async_trait::async_trait;
use nydus_convert_core::error::Result;

use crate::digest::Digest;
use crate::reader::ReaderAt;

/// Remote blob storage.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Upload the blob `digest` read from `reader`.
    async fn push(&self, reader: Arc<dyn ReaderAt>, digest: &Digest) -> Result<()>;

    /// Whether the blob is already present remotely.
    async fn check(&self, digest: &Digest) -> Result<bool>;

    /// Backend kind, for logs.
    fn kind(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    /// Records pushes in memory.
    #[derive(Default)]
    pub struct MemoryBackend {
        pub pushed: Mutex<Vec<(Digest, u64)>>,
        pub present: Mutex<Vec<Digest>>,
    }

    #[async_trait]
    impl Backend for MemoryBackend {
        async fn push(&self, reader: Arc<dyn ReaderAt>, digest: &Digest) -> Result<()> {
            self.pushed.lock().push((digest.clone(), reader.size()));
            self.present.lock().push(digest.clone());
            Ok(())
        }

        async fn check(&self, digest: &Digest) -> Result<bool> {
            Ok(self.present.lock().contains(digest))
        }

        fn kind(&self) -> &str {
            "memory"
        }
    }
}
