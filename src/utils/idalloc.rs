use bitvec::vec::BitVec;

/// Allocator of indices in `0..capacity`.
#[derive(Debug)]
pub struct IdAlloc {
    bits: BitVec,
    allocated: u32,
}

impl IdAlloc {
    pub fn new(capacity: u32) -> Self {
        Self {
            bits: BitVec::repeat(false, capacity as usize),
            allocated: 0,
        }
    }
    /// Lowest free index, or `None` when all of them are taken.
    pub fn alloc_one(&mut self) -> Option<u32> {
        let index = self.bits.first_zero()?;
        self.bits.set(index, true);
        self.allocated += 1;
        Some(index as u32)
    }
    pub fn free(&mut self, id: u32) {
        let was_set = self.bits.replace(id as usize, false);
        debug_assert!(was_set, "index {id} freed twice");
        if was_set {
            self.allocated -= 1;
        }
    }
    pub fn allocated(&self) -> u32 {
        self.allocated
    }
    pub fn is_full(&self) -> bool {
        self.allocated as usize == self.bits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_reuses_lowest_free() {
        let mut ids = IdAlloc::new(3);
        assert_eq!(ids.alloc_one(), Some(0));
        assert_eq!(ids.alloc_one(), Some(1));
        assert_eq!(ids.alloc_one(), Some(2));
        assert!(ids.is_full());
        assert_eq!(ids.alloc_one(), None);
        ids.free(1);
        assert_eq!(ids.allocated(), 2);
        assert_eq!(ids.alloc_one(), Some(1));
    }
}
