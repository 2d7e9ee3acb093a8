use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of the buffers used by the bidirectional copier.
pub const COPY_BUF_SIZE: usize = 32 * 1024;

/// Size of the scratch buffers used while reading request heads.
pub const HEAD_BUF_SIZE: usize = 4 * 1024;

/// A free list of byte buffers recycled across connections.
///
/// Buffers come in two flavours: 32 KiB copy buffers for the tunnel data
/// path and 4 KiB head buffers for request-head reads. A [`PooledBuf`]
/// returns its storage on drop, so a buffer is always either held by
/// exactly one caller or sitting in the pool.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    copy_bufs: Mutex<Vec<Vec<u8>>>,
    head_bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a 32 KiB buffer for `copy_duplex`.
    pub fn get(&self) -> PooledBuf {
        self.take(false)
    }

    /// Returns a 4 KiB scratch buffer for request-head reads.
    pub fn get_head(&self) -> PooledBuf {
        self.take(true)
    }

    fn take(&self, head: bool) -> PooledBuf {
        let (list, size) = if head {
            (&self.inner.head_bufs, HEAD_BUF_SIZE)
        } else {
            (&self.inner.copy_bufs, COPY_BUF_SIZE)
        };
        let buf = list.lock().pop().unwrap_or_else(|| vec![0u8; size]);
        PooledBuf {
            buf,
            pool: Arc::clone(&self.inner),
            head,
        }
    }
}

/// A buffer checked out of a [`BufferPool`]; hands the storage back on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<Shared>,
    head: bool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        let list = if self.head {
            &self.pool.head_bufs
        } else {
            &self.pool.copy_bufs
        };
        list.lock().push(buf);
    }
}
