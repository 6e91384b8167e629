use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

pub const BUFFER_SIZE: usize = 64 * 1024;
pub const POOL_CAPACITY: usize = 128;

/// 固定大小的缓冲区池
///
/// 取出时池空则新分配；归还时池满则直接丢弃。
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            buffer_size,
        })
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    fn put(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            capacity: POOL_CAPACITY,
            buffer_size: BUFFER_SIZE,
        }
    }
}

/// 借出的缓冲区，drop 时归还
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
