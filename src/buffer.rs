//! Pooled byte buffers for the chunking phase.

use std::sync::{Mutex, PoisonError};

/// Shared pool of reusable byte buffers.
///
/// Every buffer has exactly one owner at a time: a range worker rents
/// it, ownership moves through the write queue, and the writer returns
/// it. Returned allocations are kept on a free list so steady-state
/// sorting stops allocating after the first few chunks.
///
/// The pool caps the number of buffers outstanding; together with the
/// chunk size that cap is the memory ceiling of the chunking phase.
pub struct BufferPool {
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    limit: usize,
}

impl BufferPool {
    /// Creates a pool allowing at most `limit` buffers out at once.
    pub fn new(limit: usize) -> BufferPool {
        BufferPool {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                outstanding: 0,
                limit,
            }),
        }
    }

    /// Rents a buffer of exactly `len` bytes, reusing a returned
    /// allocation when one is available. Returns `None` when the
    /// outstanding cap is reached.
    pub fn rent(&self, len: usize) -> Option<Vec<u8>> {
        let mut buf = {
            let mut state = self.lock();
            if state.outstanding >= state.limit {
                return None;
            }
            state.outstanding += 1;
            state.free.pop().unwrap_or_default()
        };
        buf.clear();
        buf.resize(len, 0);
        Some(buf)
    }

    /// Returns a buffer to the free list.
    pub fn give_back(&self, buf: Vec<u8>) {
        let mut state = self.lock();
        state.outstanding -= 1;
        state.free.push(buf);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::BufferPool;

    #[test]
    fn test_rent_sizes_buffer() {
        let pool = BufferPool::new(2);
        let buf = pool.rent(128).unwrap();
        assert_eq!(buf.len(), 128);
    }

    #[test]
    fn test_cap_is_enforced() {
        let pool = BufferPool::new(2);
        let a = pool.rent(8).unwrap();
        let _b = pool.rent(8).unwrap();
        assert!(pool.rent(8).is_none());

        pool.give_back(a);
        assert!(pool.rent(8).is_some());
    }

    #[test]
    fn test_allocation_is_reused() {
        let pool = BufferPool::new(1);
        let mut buf = pool.rent(64).unwrap();
        buf.reserve(1024);
        let capacity = buf.capacity();
        pool.give_back(buf);

        let buf = pool.rent(32).unwrap();
        assert_eq!(buf.len(), 32);
        assert_eq!(buf.capacity(), capacity);
    }
}
