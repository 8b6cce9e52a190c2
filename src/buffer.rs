//! Chunk sizing for the transfer hub (minimal, used APIs only)

use parking_lot::Mutex;

/// Floor for every transfer chunk.
pub const MIN_CHUNK_SIZE: usize = 64 * 1024;

pub struct BufferSizer {
    max_chunk_size: usize,
    cached_available_memory: Mutex<Option<u64>>,
}

impl BufferSizer {
    pub fn new() -> Self {
        BufferSizer {
            max_chunk_size: 16 * 1024 * 1024, // 16MB max
            cached_available_memory: Mutex::new(None),
        }
    }

    /// Get available memory using sysinfo
    fn get_available_memory() -> u64 {
        use sysinfo::System;
        let mut sys = System::new_all();
        sys.refresh_memory();
        sys.available_memory().max(512 * 1024 * 1024)
    }

    /// Chunk size for a transfer of `total_size` bytes. Network sinks
    /// get bigger chunks; everything is capped to 10% of available
    /// memory and floored at [`MIN_CHUNK_SIZE`].
    pub fn chunk_size(&self, total_size: u64, is_network: bool) -> usize {
        let available_memory = {
            let mut cached = self.cached_available_memory.lock();
            if let Some(mem) = *cached {
                mem
            } else {
                let mem = Self::get_available_memory();
                *cached = Some(mem);
                mem
            }
        };

        let base_size = if is_network {
            8 * 1024 * 1024
        } else {
            4 * 1024 * 1024
        };

        let optimal = if total_size < 10 * 1024 * 1024 {
            MIN_CHUNK_SIZE
        } else if total_size <= 100 * 1024 * 1024 {
            base_size
        } else {
            base_size.max(self.max_chunk_size)
        };

        let memory_limit = (available_memory / 10) as usize;
        optimal.min(memory_limit).max(MIN_CHUNK_SIZE)
    }
}

impl Default for BufferSizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_floor_and_cap() {
        let sizer = BufferSizer::new();
        let small = sizer.chunk_size(1024, false);
        assert_eq!(small, MIN_CHUNK_SIZE);

        let big = sizer.chunk_size(1024 * 1024 * 1024, true);
        assert!(big >= MIN_CHUNK_SIZE);
        assert!(big <= 16 * 1024 * 1024);
    }

    #[test]
    fn network_transfers_never_get_smaller_chunks() {
        let sizer = BufferSizer::new();
        for size in [0u64, 1 << 20, 50 << 20, 1 << 30] {
            assert!(sizer.chunk_size(size, true) >= sizer.chunk_size(size, false));
        }
    }
}
