//! Size-classed buffer pool backing the parser and frame engines.
//!
//! Buffers are plain `Vec<u8>` whose backing allocation is recycled through
//! per-class free lists. `malloc` hands out a buffer of the requested length
//! with power-of-two capacity, `realloc` grows or shrinks while preserving
//! the prefix, and `free` returns the allocation for reuse. Ownership rules
//! make use-after-free impossible; callers that hand a pooled buffer across
//! an API boundary pass ownership along with it.

use std::sync::{Mutex, OnceLock};

const MIN_CLASS: usize = 64;
const MAX_CLASS: usize = 64 * 1024;
const CLASS_COUNT: usize = 11; // 64 .. 65536, powers of two
const PER_CLASS_CAP: usize = 256;

pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    fn class_index(capacity: usize) -> Option<usize> {
        if capacity < MIN_CLASS || capacity > MAX_CLASS || !capacity.is_power_of_two() {
            return None;
        }
        Some(capacity.trailing_zeros() as usize - MIN_CLASS.trailing_zeros() as usize)
    }

    fn class_size(n: usize) -> usize {
        n.max(MIN_CLASS).next_power_of_two()
    }

    /// Returns a buffer with length exactly `n` and capacity >= `n`.
    pub fn malloc(&self, n: usize) -> Vec<u8> {
        let size = Self::class_size(n);
        if size > MAX_CLASS {
            return vec![0; n];
        }
        let idx = Self::class_index(size).unwrap_or(0);
        let mut list = self.classes[idx].lock().unwrap_or_else(|e| e.into_inner());
        match list.pop() {
            Some(mut b) => {
                b.clear();
                b.resize(n, 0);
                b
            }
            None => {
                let mut b = Vec::with_capacity(size);
                b.resize(n, 0);
                b
            }
        }
    }

    /// Resizes `b` to length `n`, preserving the first `min(b.len(), n)`
    /// bytes. Reuses the backing memory when capacity suffices.
    pub fn realloc(&self, mut b: Vec<u8>, n: usize) -> Vec<u8> {
        if b.capacity() >= n {
            b.resize(n, 0);
            return b;
        }
        let mut grown = self.malloc(n);
        grown[..b.len()].copy_from_slice(&b);
        self.free(b);
        grown
    }

    /// Returns the buffer's backing memory to its size class.
    pub fn free(&self, b: Vec<u8>) {
        if let Some(idx) = Self::class_index(b.capacity()) {
            let mut list = self.classes[idx].lock().unwrap_or_else(|e| e.into_inner());
            if list.len() < PER_CLASS_CAP {
                list.push(b);
            }
        }
        // Off-class capacities just drop.
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT_POOL: OnceLock<BufferPool> = OnceLock::new();

fn default_pool() -> &'static BufferPool {
    DEFAULT_POOL.get_or_init(BufferPool::new)
}

/// Allocates from the process-wide pool.
pub fn malloc(n: usize) -> Vec<u8> {
    default_pool().malloc(n)
}

/// Reallocates through the process-wide pool.
pub fn realloc(b: Vec<u8>, n: usize) -> Vec<u8> {
    default_pool().realloc(b, n)
}

/// Frees into the process-wide pool.
pub fn free(b: Vec<u8>) {
    default_pool().free(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_len_and_class() {
        let pool = BufferPool::new();
        let b = pool.malloc(100);
        assert_eq!(b.len(), 100);
        assert_eq!(b.capacity(), 128);

        let b = pool.malloc(1);
        assert_eq!(b.len(), 1);
        assert_eq!(b.capacity(), 64);
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        let pool = BufferPool::new();
        let mut b = pool.malloc(4);
        b.copy_from_slice(b"abcd");

        let b = pool.realloc(b, 2036);
        assert_eq!(&b[..4], b"abcd");
        assert_eq!(b.len(), 2036);

        let b = pool.realloc(b, 2);
        assert_eq!(&b[..], b"ab");
    }

    #[test]
    fn test_free_recycles() {
        let pool = BufferPool::new();
        let mut b = pool.malloc(64);
        b[0] = 0xFF;
        let ptr = b.as_ptr();
        pool.free(b);

        let b = pool.malloc(64);
        assert_eq!(b.as_ptr(), ptr);
        // Recycled buffers come back zeroed.
        assert_eq!(b[0], 0);
    }

    #[test]
    fn test_oversized_bypasses_classes() {
        let pool = BufferPool::new();
        let b = pool.malloc(MAX_CLASS + 1);
        assert_eq!(b.len(), MAX_CLASS + 1);
        pool.free(b); // drops without panicking
    }
}
