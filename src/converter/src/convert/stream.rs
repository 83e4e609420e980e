//! Pipes between blocking content-store I/O and the async pipelines.

use std::io::Write;
use std::sync::Arc;

use nydus_convert_core::error::Result;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;

use crate::buffer::BUFFER_SIZE;
use crate::pipeline::is_broken_pipe;
use crate::reader::{ReaderAt, SectionReader};

/// Stream the whole of `reader` into the returned pipe from a blocking task.
pub(super) fn spawn_source(reader: Arc<dyn ReaderAt>) -> (DuplexStream, JoinHandle<Result<()>>) {
    let (tx, rx) = tokio::io::duplex(BUFFER_SIZE);
    let mut pipe = SyncIoBridge::new(tx);
    let task = tokio::task::spawn_blocking(move || {
        let mut section = SectionReader::new(reader.as_ref(), 0, reader.size());
        std::io::copy(&mut section, &mut pipe)?;
        pipe.flush()?;
        Ok(())
    });
    (rx, task)
}

/// Hand the read end of the returned pipe to `consume` on a blocking task.
///
/// The consumer sees EOF once the pipe is shut down or dropped.
pub(super) fn spawn_sink<T, F>(consume: F) -> (DuplexStream, JoinHandle<Result<T>>)
where
    F: FnOnce(SyncIoBridge<DuplexStream>) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = tokio::io::duplex(BUFFER_SIZE);
    let pipe = SyncIoBridge::new(rx);
    let task = tokio::task::spawn_blocking(move || consume(pipe));
    (tx, task)
}

/// Combine a producer's result with that of the sink it fed.
///
/// A broken pipe on the producer side only says that the sink hung up, so
/// the sink's own error is reported then.
pub(super) fn both<T, U>(producer: Result<T>, sink: Result<U>) -> Result<(T, U)> {
    match (producer, sink) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(p), Err(s)) if is_broken_pipe(&p) => Err(s),
        (Err(p), _) => Err(p),
        (_, Err(s)) => Err(s),
    }
}
