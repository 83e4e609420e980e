//! Shared copy buffers.
//!
//! Pack, Merge and Unpack all stream through fixed 32 KiB buffers. Buffers
//! are recycled through a process-wide pool instead of being allocated per
//! copy.

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use parking_lot::Mutex;

/// Size of every pooled buffer.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on idle buffers kept around.
const MAX_IDLE: usize = 64;

static POOL: OnceLock<BufferPool> = OnceLock::new();

/// Pool of reusable copy buffers.
#[derive(Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide pool.
    pub fn global() -> &'static BufferPool {
        POOL.get_or_init(BufferPool::new)
    }

    /// Take a buffer, allocating a new one if none is idle.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice());
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    /// Drop every idle buffer.
    pub fn reset(&self) {
        self.idle.lock().clear();
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
