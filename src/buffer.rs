//! Pooled receive buffers with single-owner release semantics.
//!
//! Every inbound datagram lands in a [`PooledBuffer`]. The handle owns the
//! storage: dropping it (or calling [`PooledBuffer::release`]) returns the
//! allocation to the pool, and moving a [`ReceivedPacket`] into a session
//! transfers that responsibility wholesale. Double release is therefore
//! unrepresentable.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::BytesMut;

use crate::MAX_RECEIVE_PACKET_SIZE;

/// Upper bound on retained free buffers; beyond this they are simply freed
const MAX_POOLED: usize = 256;

/// Free list of datagram-sized buffers
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// Takes a zeroed buffer of [`MAX_RECEIVE_PACKET_SIZE`] bytes.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut data = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_RECEIVE_PACKET_SIZE));
        data.resize(MAX_RECEIVE_PACKET_SIZE, 0);
        PooledBuffer {
            data,
            pool: self.clone(),
        }
    }

    fn put(&self, mut data: BytesMut) {
        data.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(data);
        }
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// Owning handle to one pooled buffer
pub struct PooledBuffer {
    data: BytesMut,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Returns the storage to the pool. Equivalent to dropping the handle;
    /// provided so transfer-of-ownership sites can be explicit about it.
    pub fn release(self) {}
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.data));
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// One datagram as handed to the admission pipeline or a session
#[derive(Debug)]
pub struct ReceivedPacket {
    pub remote_addr: SocketAddr,
    pub received_at: Instant,
    buffer: PooledBuffer,
}

impl ReceivedPacket {
    pub fn new(remote_addr: SocketAddr, buffer: PooledBuffer) -> Self {
        Self {
            remote_addr,
            received_at: Instant::now(),
            buffer,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Surrenders the underlying buffer, e.g. for zero-copy handoff into a
    /// session's reassembly path.
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }
}
