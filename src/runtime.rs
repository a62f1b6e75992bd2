use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use atomic::Ordering;
use log::debug;
use parking_lot::{Mutex, RwLock};
use scoped_threadpool::Pool;

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::heap::{Heap, GEN1, GEN2, LOH, NULL};
use crate::marking::{run_mark_worker, trace_sequential, MarkScratch, SegmentMap};
use crate::object::{read_ref, read_type_id};
use crate::report::HeapReport;
use crate::segment::Generation;
use crate::tlab::Tlab;
use crate::types::TypeDesc;
use crate::utils::formatted_size;

static RUNTIME_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_HEAP: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
    static TLAB: RefCell<Tlab> = const { RefCell::new(Tlab::unbound()) };
}

/// The multi-heap runtime: one heap per logical CPU, thread-to-heap
/// affinity by `cpu_id % heap_count` cached per thread, a global segment
/// directory for cross-heap address resolution, and the stop-the-world
/// collection drivers.
///
/// Mutation on a given heap is expected to be serialized by the caller;
/// collections additionally require every mutator to be quiesced before
/// entry. Only card-table bytes are written across heaps, and those are
/// atomic.
pub struct Runtime {
    id: u64,
    config: GcConfig,
    heaps: Vec<UnsafeCell<Heap>>,
    directory: RwLock<Arc<SegmentMap>>,
    next_type_id: AtomicU64,
    /// GC worker pool; holding the lock also serializes collections.
    collector: Mutex<Pool>,
}

// Heaps hold raw buffer pointers; the caller-serialization and STW
// contracts above are what make sharing the runtime across threads sound.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

impl Runtime {
    pub fn new(config: GcConfig) -> Self {
        let heap_count = config.resolved_heap_count();
        let heaps: Vec<UnsafeCell<Heap>> = (0..heap_count)
            .map(|i| UnsafeCell::new(Heap::new(i, config)))
            .collect();
        let this = Self {
            id: RUNTIME_IDS.fetch_add(1, Ordering::AcqRel),
            config,
            heaps,
            directory: RwLock::new(Arc::new(SegmentMap::new())),
            next_type_id: AtomicU64::new(1),
            collector: Mutex::new(Pool::new(heap_count as u32)),
        };
        this.rebuild_directory();
        debug!(
            target: "gc",
            "runtime {}: {} heaps, nursery {} each",
            this.id,
            heap_count,
            formatted_size(config.gen0_size),
        );
        this
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    fn heap(&self, idx: usize) -> &Heap {
        unsafe { &*self.heaps[idx].get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn heap_mut(&self, idx: usize) -> &mut Heap {
        unsafe { &mut *self.heaps[idx].get() }
    }

    fn rebuild_directory(&self) {
        let mut map = SegmentMap::new();
        for idx in 0..self.heaps.len() {
            map.add_heap(self.heap(idx));
        }
        map.seal();
        *self.directory.write() = Arc::new(map);
    }

    pub fn directory(&self) -> Arc<SegmentMap> {
        self.directory.read().clone()
    }

    fn owner_of(&self, addr: usize) -> Result<usize> {
        self.directory
            .read()
            .lookup(addr)
            .map(|e| e.heap)
            .ok_or(GcError::InvalidReference(addr))
    }

    // Thread affinity.

    /// The calling thread's home heap, `cpu_id % heap_count` resolved once
    /// and cached.
    pub fn current_heap_index(&self) -> usize {
        CURRENT_HEAP.with(|cache| {
            if let Some((runtime, idx)) = cache.get() {
                if runtime == self.id {
                    return idx;
                }
            }
            let idx = current_cpu_id() % self.heaps.len();
            cache.set(Some((self.id, idx)));
            idx
        })
    }

    pub fn current_heap_name(&self) -> String {
        self.heap(self.current_heap_index()).name().to_string()
    }

    /// Pins the calling thread to one heap, overriding the affine mapping.
    /// Servers use this to keep worker pools on their NUMA-local heap; it
    /// also makes cross-heap tests deterministic.
    pub fn bind_current_thread(&self, idx: usize) {
        assert!(idx < self.heaps.len(), "heap index out of range");
        CURRENT_HEAP.with(|cache| cache.set(Some((self.id, idx))));
    }

    pub fn heap_name(&self, idx: usize) -> String {
        self.heap(idx).name().to_string()
    }

    // Types.

    /// Assigns a process-wide id (when still 0), computes the layout once
    /// and broadcasts the descriptor to every heap's table.
    pub fn register_type(&self, mut desc: TypeDesc) -> Result<Arc<TypeDesc>> {
        if desc.id == 0 {
            desc.id = self.next_type_id.fetch_add(1, Ordering::AcqRel);
        }
        desc.compute_layout()?;
        let desc = Arc::new(desc);
        for idx in 0..self.heaps.len() {
            self.heap_mut(idx).install_type(desc.clone());
        }
        Ok(desc)
    }

    // Allocation and mutation; all routed to the owning heap.

    /// Allocates on the calling thread's home heap via its nursery slab,
    /// or directly in an old generation / the large-object segment.
    pub fn alloc(&self, ty: &Arc<TypeDesc>, forced: Option<Generation>) -> Result<usize> {
        let home = self.current_heap_index();
        TLAB.with(|tlab| {
            let mut tlab = tlab.borrow_mut();
            self.heap_mut(home).alloc(&mut tlab, ty, forced)
        })
    }

    pub fn set_root(&self, name: &str, obj: usize) -> Result<()> {
        if obj == NULL {
            return Err(GcError::bad_argument("null root reference"));
        }
        let owner = self.owner_of(obj)?;
        self.heap_mut(owner).set_root(name, obj)
    }

    pub fn root(&self, heap: usize, name: &str) -> Option<usize> {
        self.heap(heap).root(name)
    }

    pub fn set_ref(&self, obj: usize, field: &str, child: usize) -> Result<()> {
        let map = self.directory();
        let owner = self.owner_of(obj)?;
        self.heap_mut(owner).set_ref(&map, obj, field, child)
    }

    pub fn set_struct_ref(
        &self,
        obj: usize,
        struct_field: &str,
        nested: &str,
        child: usize,
    ) -> Result<()> {
        let map = self.directory();
        let owner = self.owner_of(obj)?;
        self.heap_mut(owner)
            .set_struct_ref(&map, obj, struct_field, nested, child)
    }

    pub fn get_ref(&self, obj: usize, field: &str) -> Result<usize> {
        Ok(self.heap(self.owner_of(obj)?).get_ref(obj, field)?)
    }

    pub fn get_struct_ref(&self, obj: usize, struct_field: &str, nested: &str) -> Result<usize> {
        self.heap(self.owner_of(obj)?)
            .get_struct_ref(obj, struct_field, nested)
    }

    pub fn set_int32(&self, obj: usize, field: &str, value: i32) -> Result<()> {
        self.heap_mut(self.owner_of(obj)?).set_int32(obj, field, value)
    }

    pub fn get_int32(&self, obj: usize, field: &str) -> Result<i32> {
        self.heap(self.owner_of(obj)?).get_int32(obj, field)
    }

    pub fn set_long(&self, obj: usize, field: &str, value: i64) -> Result<()> {
        self.heap_mut(self.owner_of(obj)?).set_long(obj, field, value)
    }

    pub fn get_long(&self, obj: usize, field: &str) -> Result<i64> {
        self.heap(self.owner_of(obj)?).get_long(obj, field)
    }

    pub fn set_decimal(&self, obj: usize, field: &str, value: i128) -> Result<()> {
        self.heap_mut(self.owner_of(obj)?).set_decimal(obj, field, value)
    }

    pub fn get_decimal(&self, obj: usize, field: &str) -> Result<i128> {
        self.heap(self.owner_of(obj)?).get_decimal(obj, field)
    }

    // Regions.

    /// Carves a non-moving arena on the calling thread's home heap and
    /// returns its base address (also its handle).
    pub fn create_region(&self, size: usize) -> usize {
        let home = self.current_heap_index();
        let base = self.heap_mut(home).create_region(size);
        self.rebuild_directory();
        base
    }

    pub fn destroy_region(&self, region_base: usize) -> Result<()> {
        let owner = self.owner_of(region_base)?;
        self.heap_mut(owner).destroy_region(region_base)?;
        self.rebuild_directory();
        Ok(())
    }

    pub fn alloc_in_region(&self, region_base: usize, ty: &Arc<TypeDesc>) -> Result<usize> {
        let owner = self.owner_of(region_base)?;
        self.heap_mut(owner).alloc_in_region(region_base, ty)
    }

    // Reporting.

    pub fn report(&self, heap: usize) -> Result<HeapReport> {
        self.heap(heap).report()
    }

    pub fn reports(&self) -> Result<Vec<HeapReport>> {
        (0..self.heaps.len()).map(|i| self.report(i)).collect()
    }

    // Collection drivers. All require quiesced mutators.

    /// Resolves an object's type through its owning heap's table and yields
    /// the raw values of its reference slots.
    fn trace_object_fields(
        &self,
        addr: usize,
        map: &SegmentMap,
        visit: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let entry = map.lookup(addr).ok_or(GcError::InvalidReference(addr))?;
        let heap = self.heap(entry.heap);
        let type_id = unsafe { read_type_id(addr) };
        let ty = heap
            .type_by_id(type_id)
            .ok_or(GcError::InvalidReference(addr))?;
        for &ref_off in ty.ref_offsets() {
            visit(unsafe { read_ref(addr, ref_off) });
        }
        Ok(())
    }

    /// Root and remembered-set seeds of one heap, filtered by `keep`.
    fn collect_seeds(
        &self,
        idx: usize,
        keep: &dyn Fn(usize) -> bool,
        include_cards: bool,
    ) -> Result<Vec<usize>> {
        let heap = self.heap(idx);
        let mut seeds = Vec::new();
        for (_, root) in heap.roots() {
            if keep(root) {
                seeds.push(root);
            }
        }
        for region in heap.region_indices() {
            if let Some(ext) = heap.segment(region).external_roots() {
                seeds.extend(ext.iter().copied().filter(|&a| keep(a)));
            }
        }
        if include_cards {
            for seg_idx in [GEN1, GEN2, LOH] {
                heap.scan_dirty_cards(seg_idx, &mut |child| {
                    if keep(child) {
                        seeds.push(child);
                    }
                })?;
            }
        }
        Ok(seeds)
    }

    /// Diagnostic mark over the ephemeral generations of every heap: seeds
    /// and traverses, moves nothing, clears nothing. Returns the mark
    /// count. `mark_all_old_cards` dirties every old card first, forcing a
    /// full old-generation scan.
    pub fn mark_ephemeral_all(&self, mark_all_old_cards: bool) -> Result<usize> {
        let _collector = self.collector.lock();
        let map = self.directory();
        if mark_all_old_cards {
            for idx in 0..self.heaps.len() {
                for seg_idx in [GEN1, GEN2, LOH] {
                    self.heap(idx).segment(seg_idx).cards.mark_all_dirty();
                }
            }
        }
        let keep = |addr: usize| map.is_ephemeral(addr);
        let mut seeds = Vec::new();
        for idx in 0..self.heaps.len() {
            seeds.extend(self.collect_seeds(idx, &keep, true)?);
        }
        let visited = trace_sequential(&seeds, &keep, &|addr, visit| {
            self.trace_object_fields(addr, &map, visit)
        })?;
        debug!(target: "gc", "diagnostic mark: {} ephemeral objects", visited.len());
        Ok(visited.len())
    }

    /// Mark-only collection across every managed generation of every heap
    /// (the tenured and large-object sweeps are external collaborators).
    pub fn collect_full_all(&self) -> Result<usize> {
        let _collector = self.collector.lock();
        let map = self.directory();
        let keep = |addr: usize| map.is_managed(addr);
        let mut seeds = Vec::new();
        for idx in 0..self.heaps.len() {
            // Full marks trace into the old generations directly, so the
            // remembered set adds nothing.
            seeds.extend(self.collect_seeds(idx, &keep, false)?);
        }
        let visited = trace_sequential(&seeds, &keep, &|addr, visit| {
            self.trace_object_fields(addr, &map, visit)
        })?;
        debug!(target: "gc", "full mark: {} objects", visited.len());
        Ok(visited.len())
    }

    /// Sequential fallback: each heap runs its own local minor collection
    /// in index order.
    pub fn collect_ephemeral_all(&self) -> Result<()> {
        let _collector = self.collector.lock();
        for idx in 0..self.heaps.len() {
            self.heap_mut(idx).collect_ephemeral()?;
        }
        Ok(())
    }

    /// The parallel stop-the-world minor collection: one worker per heap,
    /// global mark-first discovery with work stealing, then per-heap
    /// nursery compaction and promotion with every relocation map broadcast
    /// to every heap.
    pub fn collect_ephemeral_all_parallel(&self) -> Result<()> {
        let mut collector = self.collector.lock();
        let heap_count = self.heaps.len();
        let map = self.directory();
        let scratch = MarkScratch::new(heap_count);

        // Single-threaded seeding: heap roots, region external roots and
        // the old->young edges recorded by dirty cards.
        for idx in 0..heap_count {
            let mut defect: Option<GcError> = None;
            for seed in self.collect_seeds(idx, &|addr| map.is_ephemeral(addr), true)? {
                if let Err(err) = scratch.enqueue_if_first(seed, &map) {
                    defect.get_or_insert(err);
                }
            }
            if let Some(err) = defect {
                return Err(err);
            }
        }

        let trace = |addr: usize, visit: &mut dyn FnMut(usize)| -> Result<()> {
            self.trace_object_fields(addr, &map, visit)
        };
        collector.scoped(|scope| {
            for home in 0..heap_count {
                let scratch = &scratch;
                let map: &SegmentMap = &map;
                let trace = &trace;
                scope.execute(move || run_mark_worker(home, scratch, map, trace));
            }
        });
        if let Some(err) = scratch.take_error() {
            return Err(err);
        }

        let live = scratch.visited.snapshot();
        debug!(target: "gc", "parallel minor: {} live ephemeral objects", live.len());

        // Compact every nursery in place, broadcasting each heap's map to
        // all heaps so cross-heap references are rewritten.
        for idx in 0..heap_count {
            let compaction = self.heap_mut(idx).compact_gen0(&live)?;
            for target in 0..heap_count {
                self.heap_mut(target).apply_relocations(&compaction)?;
            }
        }

        // Promote the survivors to Gen1, reset each nursery and broadcast
        // the promotion map.
        for idx in 0..heap_count {
            let promotion = self.heap_mut(idx).promote_gen0()?;
            self.heap_mut(idx).reset_nursery();
            for target in 0..heap_count {
                self.heap_mut(target).apply_relocations(&promotion)?;
            }
        }

        // The remembered set is rebuilt by future write barriers.
        for idx in 0..heap_count {
            self.heap_mut(idx).clear_old_cards();
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn current_cpu_id() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        cpu as usize
    } else {
        fallback_cpu_id()
    }
}

#[cfg(windows)]
fn current_cpu_id() -> usize {
    unsafe { winapi::um::processthreadsapi::GetCurrentProcessorNumber() as usize }
}

#[cfg(not(any(target_os = "linux", windows)))]
fn current_cpu_id() -> usize {
    fallback_cpu_id()
}

/// Stable per-thread stand-in where the OS exposes no cpu id.
#[cfg(not(windows))]
fn fallback_cpu_id() -> usize {
    use std::sync::atomic::AtomicUsize;

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static ASSIGNED: Cell<Option<usize>> = const { Cell::new(None) };
    }
    ASSIGNED.with(|cell| match cell.get() {
        Some(id) => id,
        None => {
            let id = NEXT.fetch_add(1, Ordering::AcqRel);
            cell.set(Some(id));
            id
        }
    })
}
