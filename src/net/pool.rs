use std::collections::HashMap;

use parking_lot::Mutex;

/// Pooled buffer allocator with power-of-two slab sizing: a request for `n`
/// bytes is served from the smallest slab of `2^k >= n`, each slab class
/// keeping its own free list. Returned buffers are reused as-is, without
/// zeroing.
#[derive(Default)]
pub struct BytesPool {
    slabs: Mutex<HashMap<u64, Vec<Vec<u8>>>>,
}

impl BytesPool {
    pub fn get(&self, size: u64) -> Vec<u8> {
        let capacity = slab_size(size);
        let mut slabs = self.slabs.lock();
        if let Some(free) = slabs.get_mut(&capacity) {
            if let Some(buf) = free.pop() {
                return buf;
            }
        }
        vec![0u8; capacity as usize]
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        let capacity = slab_size(buf.capacity() as u64);
        if capacity as usize != buf.capacity() {
            // Odd-sized buffer from elsewhere; let it drop.
            return;
        }
        buf.resize(capacity as usize, 0);
        self.slabs.lock().entry(capacity).or_default().push(buf);
    }
}

fn slab_size(size: u64) -> u64 {
    size.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_rounds_up_to_power_of_two() {
        let pool = BytesPool::default();
        let buf = pool.get(12_832_256);
        assert_eq!(buf.len(), 16_777_216);
    }

    #[test]
    fn put_then_get_reuses_buffer_without_zeroing() {
        let pool = BytesPool::default();
        let mut buf = pool.get(12_832_256);
        buf[..5].copy_from_slice(b"AAAAA");
        pool.put(buf);

        let reused = pool.get(12_832_256);
        assert_eq!(reused.len(), 16_777_216);
        assert_eq!(&reused[..5], b"AAAAA");
    }

    #[test]
    fn slab_classes_are_separate() {
        let pool = BytesPool::default();
        let small = pool.get(10);
        assert_eq!(small.len(), 16);
        pool.put(small);
        let large = pool.get(100);
        assert_eq!(large.len(), 128);
    }
}
