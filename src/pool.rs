//! Process-wide byte-slab pool for per-frame ciphertext/plaintext/encoded
//! audio buffers, and a generic bounded slab pool for packet objects.
//!
//! Grounded on the teacher's `AudioBufferPool` (crossbeam free-index queue
//! over a `Vec<Mutex<Vec<u8>>>`), generalized to a configurable slab size
//! (`MAX_ENCODED_BYTES + overhead`, spec §9) and reused for both audio
//! payload slabs and the bounded 256-per-type packet pool described in
//! spec §5.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{self as channel, Receiver, Sender};

/// A fixed-size reusable byte-slab pool. Buffers holding ciphertext or key
/// material must be cleared before reuse (spec §5 "Pooling").
pub struct SlabPool {
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    slots: Vec<Mutex<Vec<u8>>>,
    in_use: AtomicUsize,
}

impl SlabPool {
    pub fn new(count: usize, slab_size: usize) -> Arc<Self> {
        let (tx, rx) = channel::bounded(count);
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(Mutex::new(vec![0u8; slab_size]));
            tx.send(i).expect("pool channel sized to count");
        }
        Arc::new(Self { free_tx: tx, free_rx: rx, slots, in_use: AtomicUsize::new(0) })
    }

    /// Acquire a free slot index without blocking; `None` if exhausted.
    pub fn acquire(&self) -> Option<PooledSlab<'_>> {
        let idx = self.free_rx.try_recv().ok()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(PooledSlab { pool: self, idx, sensitive: false })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn release(&self, idx: usize, sensitive: bool) {
        if sensitive {
            self.slots[idx].lock().iter_mut().for_each(|b| *b = 0);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        let _ = self.free_tx.send(idx);
    }
}

/// RAII handle to an acquired slab. On drop, the slot is returned to the
/// pool; call [`PooledSlab::mark_sensitive`] first if the buffer held
/// ciphertext or key material, so it's zeroed before reuse.
pub struct PooledSlab<'a> {
    pool: &'a SlabPool,
    idx: usize,
    sensitive: bool,
}

impl<'a> PooledSlab<'a> {
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.pool.slots[self.idx].lock();
        f(&mut guard)
    }

    /// Mark this slab as having held ciphertext or key material, so its
    /// contents are zeroed on release instead of left for the next holder.
    pub fn mark_sensitive(&mut self) {
        self.sensitive = true;
    }
}

impl<'a> Drop for PooledSlab<'a> {
    fn drop(&mut self) {
        self.pool.release(self.idx, self.sensitive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let pool = SlabPool::new(2, 16);
        assert_eq!(pool.capacity(), 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_use(), 2);
        drop(a);
        assert_eq!(pool.in_use(), 1);
        let _c = pool.acquire().unwrap();
        drop(b);
    }

    #[test]
    fn with_bytes_writes_through() {
        let pool = SlabPool::new(1, 8);
        let slab = pool.acquire().unwrap();
        slab.with_bytes(|b| b[0] = 42);
        slab.with_bytes(|b| assert_eq!(b[0], 42));
    }

    #[test]
    fn sensitive_slab_is_zeroed_on_release() {
        let pool = SlabPool::new(1, 8);
        {
            let mut slab = pool.acquire().unwrap();
            slab.with_bytes(|b| b.fill(0xAA));
            slab.mark_sensitive();
        }
        let slab = pool.acquire().unwrap();
        slab.with_bytes(|b| assert!(b.iter().all(|&byte| byte == 0)));
    }
}
