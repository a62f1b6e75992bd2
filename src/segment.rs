use std::collections::HashSet;

use crate::brick_table::BrickTable;
use crate::card_table::CardTable;
use crate::mmap::Mmap;
use crate::object::WORD;
use crate::utils::align_up;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Generation {
    Gen0,
    Gen1,
    Gen2,
    Loh,
    Region,
}

impl Generation {
    /// Subject to minor collection.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Generation::Gen0 | Generation::Gen1)
    }

    /// Carries a remembered set (old->young edges are card-tracked).
    pub fn is_old(self) -> bool {
        matches!(self, Generation::Gen1 | Generation::Gen2 | Generation::Loh)
    }

    pub fn is_managed(self) -> bool {
        self != Generation::Region
    }
}

/// One contiguous unmanaged buffer belonging to a single generation.
/// Objects are bump-allocated back to back in `[0, alloc)`. Every segment
/// carries its card and brick tables; a region segment additionally records
/// the managed addresses stored into it (its external GC roots).
pub struct Segment {
    mmap: Mmap,
    base: usize,
    size: usize,
    alloc: usize,
    generation: Generation,
    pub cards: CardTable,
    pub bricks: BrickTable,
    external_roots: Option<HashSet<usize, ahash::RandomState>>,
}

impl Segment {
    pub fn new(generation: Generation, size: usize, card_size: usize, brick_size: usize) -> Self {
        let mmap = Mmap::new(size);
        let base = mmap.start() as usize;
        let size = mmap.size();
        Self {
            mmap,
            base,
            size,
            alloc: 0,
            generation,
            cards: CardTable::new(size, card_size),
            bricks: BrickTable::new(size, brick_size),
            external_roots: if generation == Generation::Region {
                Some(HashSet::default())
            } else {
                None
            },
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Bytes occupied by objects; also the next free offset.
    pub fn allocated(&self) -> usize {
        self.alloc
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    #[inline]
    pub fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        addr - self.base
    }

    #[inline]
    pub fn abs(&self, offset: usize) -> usize {
        self.base + offset
    }

    /// Bumps the cursor by `bytes` rounded up to the word, returning the
    /// pre-advance offset. A full segment reports failure to the caller.
    pub fn try_allocate(&mut self, bytes: usize) -> Option<usize> {
        let bytes = align_up(bytes, WORD);
        if self.alloc + bytes > self.size {
            return None;
        }
        let offset = self.alloc;
        self.alloc += bytes;
        Some(offset)
    }

    /// Moves the cursor back after compaction. The caller zeroes the tail.
    pub fn set_allocated(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.size);
        self.alloc = bytes;
    }

    /// # Safety
    /// No live object may occupy `[from, alloc)`.
    pub unsafe fn zero_range(&mut self, from: usize, to: usize) {
        debug_assert!(from <= to && to <= self.size);
        std::ptr::write_bytes((self.base + from) as *mut u8, 0, to - from);
    }

    /// Empties the nursery: zeroes occupied bytes, rewinds the cursor and
    /// clears both side tables.
    pub fn reset_nursery_layout(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.base as *mut u8, 0, self.alloc);
        }
        self.alloc = 0;
        self.cards.clear_all();
        self.bricks.clear_all();
    }

    pub fn external_roots(&self) -> Option<&HashSet<usize, ahash::RandomState>> {
        self.external_roots.as_ref()
    }

    pub fn external_roots_mut(&mut self) -> Option<&mut HashSet<usize, ahash::RandomState>> {
        self.external_roots.as_mut()
    }

    pub fn record_external_root(&mut self, addr: usize) {
        if let Some(roots) = self.external_roots.as_mut() {
            roots.insert(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(gen: Generation, size: usize) -> Segment {
        Segment::new(gen, size, 256, 2048)
    }

    #[test]
    fn bump_is_word_aligned_and_monotonic() {
        let mut seg = segment(Generation::Gen1, 4096);
        let a = seg.try_allocate(20).unwrap();
        let b = seg.try_allocate(1).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, align_up(20, WORD));
        assert_eq!(seg.allocated(), b + WORD);
    }

    #[test]
    fn full_segment_signals_failure() {
        let mut seg = segment(Generation::Loh, 128);
        assert!(seg.try_allocate(120).is_some());
        assert!(seg.try_allocate(16).is_none());
        // The cursor is untouched by the failed attempt.
        assert_eq!(seg.allocated(), 120);
    }

    #[test]
    fn nursery_reset_clears_everything() {
        let mut seg = segment(Generation::Gen0, 4096);
        let off = seg.try_allocate(64).unwrap();
        unsafe {
            *(seg.abs(off) as *mut u64) = 0xfeed;
        }
        seg.cards.mark_dirty_by_offset(off);
        seg.bricks.on_allocation(off);
        seg.reset_nursery_layout();
        assert_eq!(seg.allocated(), 0);
        assert_eq!(seg.cards.dirty_count(), 0);
        assert_eq!(seg.bricks.snap_to_object_start(4095), 0);
        assert_eq!(unsafe { *(seg.base() as *const u64) }, 0);
    }

    #[test]
    fn region_segment_keeps_external_roots() {
        let mut seg = segment(Generation::Region, 4096);
        seg.record_external_root(0x1000);
        seg.record_external_root(0x1000);
        assert_eq!(seg.external_roots().unwrap().len(), 1);
        assert!(segment(Generation::Gen2, 4096).external_roots().is_none());
    }
}
