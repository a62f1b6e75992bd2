use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use atomic::Ordering;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::error::{GcError, Result};
use crate::heap::{AddressSet, Heap, NULL};
use crate::segment::Generation;

/// Immutable snapshot of every segment range: `(base, end)` plus the owning
/// heap, the segment's slot in that heap and its generation. One sorted
/// array answers both "is this address ephemeral" and "which heap owns it"
/// by binary search, so marking never consults mutable heap state.
#[derive(Clone, Copy, Debug)]
pub struct SegEntry {
    pub base: usize,
    pub end: usize,
    pub heap: usize,
    pub seg: usize,
    pub generation: Generation,
}

#[derive(Default)]
pub struct SegmentMap {
    entries: Vec<SegEntry>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(heap: &Heap) -> Self {
        let mut map = Self::new();
        map.add_heap(heap);
        map.seal();
        map
    }

    pub fn add_heap(&mut self, heap: &Heap) {
        for (seg_idx, segment) in heap.segments().iter().enumerate() {
            self.entries.push(SegEntry {
                base: segment.base(),
                end: segment.end(),
                heap: heap.index(),
                seg: seg_idx,
                generation: segment.generation(),
            });
        }
    }

    pub fn seal(&mut self) {
        self.entries.sort_by_key(|e| e.base);
    }

    pub fn lookup(&self, addr: usize) -> Option<&SegEntry> {
        let pos = self.entries.partition_point(|e| e.base <= addr);
        if pos == 0 {
            return None;
        }
        let entry = &self.entries[pos - 1];
        (addr < entry.end).then_some(entry)
    }

    #[inline]
    pub fn is_ephemeral(&self, addr: usize) -> bool {
        self.lookup(addr)
            .map(|e| e.generation.is_ephemeral())
            .unwrap_or(false)
    }

    #[inline]
    pub fn is_managed(&self, addr: usize) -> bool {
        self.lookup(addr)
            .map(|e| e.generation.is_managed())
            .unwrap_or(false)
    }
}

/// Global mark set. Sharded so concurrent insert-if-absent scales with the
/// worker count; the shard insert is the linearization point that makes
/// every address enqueue exactly once.
pub struct VisitedSet {
    shards: Vec<Mutex<AddressSet>>,
}

const SHARD_COUNT: usize = 64;

impl VisitedSet {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(AddressSet::default())).collect(),
        }
    }

    #[inline]
    fn shard_of(addr: usize) -> usize {
        // Addresses are word-aligned; mix before taking the low bits.
        ((addr as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 48) as usize % SHARD_COUNT
    }

    /// True exactly once per address.
    pub fn insert_first(&self, addr: usize) -> bool {
        self.shards[Self::shard_of(addr)].lock().insert(addr)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> AddressSet {
        let mut all = AddressSet::default();
        for shard in &self.shards {
            all.extend(shard.lock().iter().copied());
        }
        all
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-collection scratch shared by all workers: the mark set, one worklist
/// per heap, the inflight scan counter and the failure latch.
pub struct MarkScratch {
    pub visited: VisitedSet,
    worklists: Vec<SegQueue<usize>>,
    inflight: AtomicUsize,
    failed: AtomicBool,
    error: Mutex<Option<GcError>>,
}

impl MarkScratch {
    pub fn new(heap_count: usize) -> Self {
        Self {
            visited: VisitedSet::new(),
            worklists: (0..heap_count).map(|_| SegQueue::new()).collect(),
            inflight: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Mark-first discovery: the visited insert decides a single winner,
    /// which routes the address to its owner's worklist. Losers drop it.
    pub fn enqueue_if_first(&self, addr: usize, map: &SegmentMap) -> Result<()> {
        if !self.visited.insert_first(addr) {
            return Ok(());
        }
        let entry = map.lookup(addr).ok_or(GcError::InvalidReference(addr))?;
        self.worklists[entry.heap].push(addr);
        Ok(())
    }

    fn queues_empty(&self) -> bool {
        self.worklists.iter().all(|q| q.is_empty())
    }

    /// Pops the home worklist, then scans the other heaps in index order
    /// for one stolen item. Work-conserving: a non-empty queue anywhere
    /// keeps every worker alive.
    fn pop_or_steal(&self, home: usize) -> Option<usize> {
        if let Some(addr) = self.worklists[home].pop() {
            return Some(addr);
        }
        for (i, queue) in self.worklists.iter().enumerate() {
            if i == home {
                continue;
            }
            if let Some(addr) = queue.pop() {
                return Some(addr);
            }
        }
        None
    }

    pub fn fail(&self, err: GcError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    pub fn take_error(&self) -> Option<GcError> {
        self.error.lock().take()
    }
}

/// One worker per heap. `trace` resolves an object and yields the raw
/// values of its reference slots (nested struct slots included).
///
/// The inflight counter is raised before the pop attempt: a popped but
/// uncounted item would let a peer observe "all queues empty and nothing
/// inflight" and terminate while discoveries are still coming. Termination
/// needs both conditions under acquire ordering.
pub fn run_mark_worker(
    home: usize,
    scratch: &MarkScratch,
    map: &SegmentMap,
    trace: &(dyn Fn(usize, &mut dyn FnMut(usize)) -> Result<()> + Sync),
) {
    loop {
        if scratch.failed.load(Ordering::Acquire) {
            return;
        }
        scratch.inflight.fetch_add(1, Ordering::AcqRel);
        match scratch.pop_or_steal(home) {
            Some(addr) => {
                let mut defect: Option<GcError> = None;
                let traced = trace(addr, &mut |child| {
                    if child != NULL && map.is_ephemeral(child) {
                        if let Err(err) = scratch.enqueue_if_first(child, map) {
                            if defect.is_none() {
                                defect = Some(err);
                            }
                        }
                    }
                });
                scratch.inflight.fetch_sub(1, Ordering::AcqRel);
                if let Err(err) = traced {
                    scratch.fail(err);
                    return;
                }
                if let Some(err) = defect {
                    scratch.fail(err);
                    return;
                }
            }
            None => {
                scratch.inflight.fetch_sub(1, Ordering::AcqRel);
                if scratch.queues_empty() && scratch.inflight.load(Ordering::Acquire) == 0 {
                    return;
                }
                std::hint::spin_loop();
                std::thread::sleep(Duration::from_micros(1));
            }
        }
    }
}

/// Single-threaded traversal used by the diagnostic and full marks and by
/// the per-heap fallback collector's tests. `keep` filters both seeds and
/// discovered children.
pub fn trace_sequential(
    seeds: &[usize],
    keep: &dyn Fn(usize) -> bool,
    trace: &dyn Fn(usize, &mut dyn FnMut(usize)) -> Result<()>,
) -> Result<AddressSet> {
    let mut visited = AddressSet::default();
    let mut stack: Vec<usize> = Vec::new();
    for &seed in seeds {
        if seed != NULL && keep(seed) && visited.insert(seed) {
            stack.push(seed);
        }
    }
    while let Some(addr) = stack.pop() {
        let mut children = Vec::new();
        trace(addr, &mut |child| children.push(child))?;
        for child in children {
            if child != NULL && keep(child) && visited.insert(child) {
                stack.push(child);
            }
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn visited_insert_is_first_only_once() {
        let visited = VisitedSet::new();
        assert!(visited.insert_first(0x4000));
        assert!(!visited.insert_first(0x4000));
        assert_eq!(visited.len(), 1);
        assert!(visited.snapshot().contains(&0x4000));
    }

    #[test]
    fn concurrent_insert_has_single_winner() {
        let visited = VisitedSet::new();
        let wins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for addr in (0x1000..0x2000usize).step_by(8) {
                        if visited.insert_first(addr) {
                            wins.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::Acquire), 0x1000 / 8);
    }

    #[test]
    fn workers_drain_cross_queue_graphs() {
        // Synthetic two-heap graph: addresses on "heap 1" are discovered
        // from "heap 0" items and vice versa; edges come from a table
        // instead of real segments.
        let mut map = SegmentMap::new();
        map.entries.push(SegEntry {
            base: 0x10_000,
            end: 0x20_000,
            heap: 0,
            seg: 0,
            generation: Generation::Gen0,
        });
        map.entries.push(SegEntry {
            base: 0x20_000,
            end: 0x30_000,
            heap: 1,
            seg: 0,
            generation: Generation::Gen0,
        });
        map.seal();

        let scratch = MarkScratch::new(2);
        scratch.enqueue_if_first(0x10_000, &map).unwrap();

        let trace = |addr: usize, visit: &mut dyn FnMut(usize)| -> Result<()> {
            // Chain: each address points at the next word on the other heap
            // until both ranges are spanned.
            let next = if addr < 0x20_000 { addr + 0x10_000 } else { addr - 0x10_000 + 8 };
            if next < 0x30_000 {
                visit(next);
            }
            Ok(())
        };
        std::thread::scope(|scope| {
            for home in 0..2 {
                let scratch = &scratch;
                let map = &map;
                let trace = &trace;
                scope.spawn(move || run_mark_worker(home, scratch, map, trace));
            }
        });
        assert!(scratch.take_error().is_none());
        // Every address of both ranges was reached exactly once.
        assert_eq!(scratch.visited.len(), 2 * 0x10_000 / 8);
    }

    #[test]
    fn segment_map_lookup_hits_and_misses() {
        let mut map = SegmentMap::new();
        map.entries.push(SegEntry {
            base: 0x1000,
            end: 0x2000,
            heap: 3,
            seg: 1,
            generation: Generation::Gen1,
        });
        map.seal();
        assert_eq!(map.lookup(0x1000).unwrap().heap, 3);
        assert_eq!(map.lookup(0x1fff).unwrap().seg, 1);
        assert!(map.lookup(0xfff).is_none());
        assert!(map.lookup(0x2000).is_none());
        assert!(map.is_ephemeral(0x1800));
        assert!(map.is_managed(0x1800));
    }
}
