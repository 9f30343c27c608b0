use std::sync::{Mutex, MutexGuard};

/// Size of the staging buffer used for unaligned cipher ranges.
pub const CRYPTO_SCRATCH_SIZE: usize = 0x800000;

/// Mutex-guarded staging buffer shared by every cipher entry point.
///
/// The buffer is allocated on first use and can be dropped again with
/// [`CryptoArena::release`]. Holding the guard for the whole duration of a
/// section read or patch generation also serializes archive processing.
pub struct CryptoArena {
    scratch: Mutex<Vec<u8>>,
    capacity: usize,
}

impl std::fmt::Debug for CryptoArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoArena")
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CryptoArena {
    pub fn new() -> Self {
        Self {
            scratch: Mutex::new(Vec::new()),
            capacity: CRYPTO_SCRATCH_SIZE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity % crate::crypto::XTS_SECTOR_SIZE == 0);
        Self {
            scratch: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Lock the arena, allocating the scratch buffer if this is the first use.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        let mut guard = self.scratch.lock().unwrap();
        if guard.len() != self.capacity {
            guard.resize(self.capacity, 0);
        }
        guard
    }

    /// Free the scratch allocation. The next cipher call re-allocates it.
    pub fn release(&self) {
        let mut guard = self.scratch.lock().unwrap();
        *guard = Vec::new();
    }
}

impl Default for CryptoArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_allocation_and_release() {
        let arena = CryptoArena::with_capacity(0x400);
        assert_eq!(arena.lock().len(), 0x400);
        arena.release();
        assert_eq!(arena.scratch.lock().unwrap().capacity(), 0);
        assert_eq!(arena.lock().len(), 0x400);
    }
}
