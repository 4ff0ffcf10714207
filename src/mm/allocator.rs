//! Fixed-capacity allocators for the storage data region and request ids.
//!
//! Neither allocator touches the memory it hands out; they only track
//! ownership of cell and id numbers. Both are sized at construction and
//! never grow.

/// Maximum number of data cells a [`CellAllocator`] can track.
pub const MAX_CELLS: usize = 8192;
/// Maximum number of ids an [`IndexAllocator`] can hand out.
pub const MAX_INDICES: usize = 1024;

const CELL_WORDS: usize = MAX_CELLS / 64;
const INDEX_WORDS: usize = MAX_INDICES / 64;

fn bit_is_set(words: &[u64], bit: usize) -> bool {
    words[bit / 64] & (1 << (bit % 64)) != 0
}

fn set_bit(words: &mut [u64], bit: usize, value: bool) {
    if value {
        words[bit / 64] |= 1 << (bit % 64);
    } else {
        words[bit / 64] &= !(1 << (bit % 64));
    }
}

/// Next-fit allocator of contiguous fixed-size cells.
///
/// A cursor remembers where the last allocation ended. A request for
/// `count` cells is tried at the cursor, or at cell 0 if it would run past
/// the end; if that range is not entirely free the allocator reports
/// itself full for that size. There is deliberately no further search.
pub struct CellAllocator {
    /// One bit per cell, set while allocated
    bitmap: [u64; CELL_WORDS],
    num_cells: usize,
    /// Where the next allocation is attempted
    cursor: usize,
    allocated: usize,
}

impl CellAllocator {
    /// # Panics
    /// Panics if `num_cells > MAX_CELLS`.
    pub fn new(num_cells: usize) -> Self {
        assert!(num_cells <= MAX_CELLS, "num_cells exceeds MAX_CELLS");
        Self {
            bitmap: [0; CELL_WORDS],
            num_cells,
            cursor: 0,
            allocated: 0,
        }
    }

    fn candidate(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.num_cells {
            return None;
        }
        let start = if self.cursor + count > self.num_cells { 0 } else { self.cursor };
        (start..start + count)
            .all(|cell| !bit_is_set(&self.bitmap, cell))
            .then_some(start)
    }

    /// Whether an allocation of `count` cells would currently fail.
    /// A zero-cell request never needs space.
    pub fn is_full(&self, count: usize) -> bool {
        count != 0 && self.candidate(count).is_none()
    }

    /// Allocate `count` contiguous cells, returning the first cell index.
    pub fn alloc(&mut self, count: usize) -> Option<usize> {
        let start = self.candidate(count)?;
        for cell in start..start + count {
            set_bit(&mut self.bitmap, cell, true);
        }
        self.cursor = start + count;
        if self.cursor == self.num_cells {
            self.cursor = 0;
        }
        self.allocated += count;
        Some(start)
    }

    /// Return `count` cells starting at `start`.
    pub fn free(&mut self, start: usize, count: usize) {
        debug_assert!(start + count <= self.num_cells);
        for cell in start..start + count {
            debug_assert!(bit_is_set(&self.bitmap, cell), "freeing unallocated cell {}", cell);
            set_bit(&mut self.bitmap, cell, false);
        }
        self.allocated -= count;
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn remaining(&self) -> usize {
        self.num_cells - self.allocated
    }
}

/// Free-list allocator of small integer ids (backend request ids).
pub struct IndexAllocator {
    /// Stack of free ids; the top is handed out next
    free: [u16; MAX_INDICES],
    top: usize,
    in_use: [u64; INDEX_WORDS],
    capacity: usize,
}

impl IndexAllocator {
    /// # Panics
    /// Panics if `capacity > MAX_INDICES`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= MAX_INDICES, "capacity exceeds MAX_INDICES");
        let mut free = [0u16; MAX_INDICES];
        // Lowest ids on top so allocation order is 0, 1, 2, ...
        for (slot, id) in free.iter_mut().zip((0..capacity).rev()) {
            *slot = id as u16;
        }
        Self {
            free,
            top: capacity,
            in_use: [0; INDEX_WORDS],
            capacity,
        }
    }

    pub fn alloc(&mut self) -> Option<usize> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        let id = self.free[self.top] as usize;
        set_bit(&mut self.in_use, id, true);
        Some(id)
    }

    /// Release `id`. Returns false (and changes nothing) if it was not
    /// allocated.
    pub fn free(&mut self, id: usize) -> bool {
        if id >= self.capacity || !bit_is_set(&self.in_use, id) {
            return false;
        }
        set_bit(&mut self.in_use, id, false);
        self.free[self.top] = id as u16;
        self.top += 1;
        true
    }

    pub fn is_full(&self) -> bool {
        self.top == 0
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        id < self.capacity && bit_is_set(&self.in_use, id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.top
    }
}
