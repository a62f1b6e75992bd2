use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::marking::SegmentMap;
use crate::object::{read_ref, read_type_id, write_header, write_ref, HEADER_SIZE, WORD};
use crate::object::{read_decimal, read_i32, read_i64, write_decimal, write_i32, write_i64};
use crate::report::{
    FieldReport, FieldValue, HeapReport, ObjectReport, RootReport, SegmentReport,
};
use crate::segment::{Generation, Segment};
use crate::tlab::Tlab;
use crate::types::{FieldKind, TypeDesc, TypeTable};
use crate::utils::{align_up, formatted_size};

pub const NULL: usize = 0;

pub type RelocationMap = HashMap<usize, usize, ahash::RandomState>;
pub type AddressSet = HashSet<usize, ahash::RandomState>;

pub(crate) const GEN0: usize = 0;
pub(crate) const GEN1: usize = 1;
pub(crate) const GEN2: usize = 2;
pub(crate) const LOH: usize = 3;
const FIXED_SEGMENTS: usize = 4;

/// One per-core heap: the four generation segments plus any attached
/// regions, kept in a base-sorted index for address resolution, the named
/// root map and the broadcast type table. Mutation is serialized by the
/// caller; only card bytes may be touched from other threads.
pub struct Heap {
    name: String,
    index: usize,
    config: GcConfig,
    segments: Vec<Segment>,
    by_base: Vec<usize>,
    roots: HashMap<String, usize, ahash::RandomState>,
    types: TypeTable,
    nursery_epoch: u64,
}

impl Heap {
    pub fn new(index: usize, config: GcConfig) -> Self {
        let segments = vec![
            Segment::new(Generation::Gen0, config.gen0_size, config.card_size, config.brick_size),
            Segment::new(Generation::Gen1, config.gen1_size, config.card_size, config.brick_size),
            Segment::new(Generation::Gen2, config.gen2_size, config.card_size, config.brick_size),
            Segment::new(Generation::Loh, config.loh_size, config.card_size, config.brick_size),
        ];
        let mut this = Self {
            name: format!("heap-{}", index),
            index,
            config,
            segments,
            by_base: Vec::new(),
            roots: HashMap::default(),
            types: TypeTable::default(),
            nursery_epoch: 1,
        };
        this.rebuild_base_index();
        this
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn nursery_epoch(&self) -> u64 {
        self.nursery_epoch
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, idx: usize) -> &Segment {
        &self.segments[idx]
    }

    pub fn segment_mut(&mut self, idx: usize) -> &mut Segment {
        &mut self.segments[idx]
    }

    pub fn gen0(&self) -> &Segment {
        &self.segments[GEN0]
    }

    // Type table: descriptors arrive via runtime broadcast.

    pub fn install_type(&mut self, desc: Arc<TypeDesc>) {
        self.types.insert(desc.id, desc);
    }

    pub fn type_by_id(&self, id: u64) -> Option<&Arc<TypeDesc>> {
        self.types.get(&id)
    }

    fn rebuild_base_index(&mut self) {
        let mut order: Vec<usize> = (0..self.segments.len()).collect();
        order.sort_by_key(|&i| self.segments[i].base());
        self.by_base = order;
    }

    /// O(log n) address-to-segment resolution over the sorted list.
    pub fn find_segment(&self, addr: usize) -> Option<usize> {
        let pos = self
            .by_base
            .partition_point(|&i| self.segments[i].base() <= addr);
        if pos == 0 {
            return None;
        }
        let idx = self.by_base[pos - 1];
        self.segments[idx].contains(addr).then_some(idx)
    }

    fn resolve_object(&self, obj: usize) -> Result<(usize, Arc<TypeDesc>)> {
        let seg = self
            .find_segment(obj)
            .ok_or(GcError::InvalidReference(obj))?;
        let type_id = unsafe { read_type_id(obj) };
        let ty = self
            .types
            .get(&type_id)
            .cloned()
            .ok_or(GcError::InvalidReference(obj))?;
        Ok((seg, ty))
    }

    // Roots.

    pub fn set_root(&mut self, name: &str, obj: usize) -> Result<()> {
        if name.is_empty() {
            return Err(GcError::bad_argument("empty root name"));
        }
        if obj == NULL || self.find_segment(obj).is_none() {
            return Err(GcError::InvalidReference(obj));
        }
        self.roots.insert(name.to_string(), obj);
        Ok(())
    }

    pub fn root(&self, name: &str) -> Option<usize> {
        self.roots.get(name).copied()
    }

    pub fn roots(&self) -> impl Iterator<Item = (&str, usize)> {
        self.roots.iter().map(|(k, &v)| (k.as_str(), v))
    }

    // Regions.

    pub fn create_region(&mut self, size: usize) -> usize {
        let seg = Segment::new(
            Generation::Region,
            size,
            self.config.card_size,
            self.config.brick_size,
        );
        let base = seg.base();
        self.segments.push(seg);
        self.rebuild_base_index();
        base
    }

    /// Drops the region's buffer and removes it from the sorted list. Any
    /// root entries naming its objects become invalid, which is the
    /// documented hazard of destroying a region.
    pub fn destroy_region(&mut self, base: usize) -> Result<()> {
        let idx = self
            .segments
            .iter()
            .position(|s| s.generation() == Generation::Region && s.base() == base)
            .ok_or(GcError::InvalidReference(base))?;
        self.segments.remove(idx);
        self.rebuild_base_index();
        Ok(())
    }

    pub fn region_indices(&self) -> Vec<usize> {
        (FIXED_SEGMENTS..self.segments.len())
            .filter(|&i| self.segments[i].generation() == Generation::Region)
            .collect()
    }

    // Allocation.

    /// Revalidates the thread's nursery slab and carves a new one when the
    /// slab is stale, foreign, or too small. A full nursery triggers
    /// `on_out_of_space` (typically a minor collection) and retries exactly
    /// once.
    pub fn ensure_tlab(
        &mut self,
        tlab: &mut Tlab,
        needed: usize,
        on_out_of_space: impl FnOnce(&mut Heap) -> Result<()>,
    ) -> Result<()> {
        let gen0_base = self.segments[GEN0].base();
        if tlab.is_bound_to(gen0_base, self.nursery_epoch) && tlab.fits(needed) {
            return Ok(());
        }
        let slab = self.config.tlab_size.max(align_up(needed, WORD));
        if let Some(off) = self.segments[GEN0].try_allocate(slab) {
            tlab.bind(gen0_base, self.nursery_epoch, off, off + slab);
            return Ok(());
        }
        on_out_of_space(self)?;
        if let Some(off) = self.segments[GEN0].try_allocate(slab) {
            tlab.bind(self.segments[GEN0].base(), self.nursery_epoch, off, off + slab);
            return Ok(());
        }
        Err(GcError::OutOfMemory {
            generation: Generation::Gen0,
            requested: needed,
        })
    }

    fn alloc_gen0(&mut self, tlab: &mut Tlab, ty: &Arc<TypeDesc>) -> Result<usize> {
        let bytes = ty.allocation_size();
        self.ensure_tlab(tlab, bytes, |heap| heap.collect_ephemeral().map(|_| ()))?;
        tlab.allocate(bytes, ty.id).ok_or(GcError::OutOfMemory {
            generation: Generation::Gen0,
            requested: bytes,
        })
    }

    /// Allocates one instance of a class type. Large instances and
    /// `forced = Loh` land in the large-object segment; `forced` Gen1/Gen2
    /// bump directly into the old generations; everything else goes through
    /// the thread's nursery slab.
    pub fn alloc(
        &mut self,
        tlab: &mut Tlab,
        ty: &Arc<TypeDesc>,
        forced: Option<Generation>,
    ) -> Result<usize> {
        if !ty.is_class() {
            return Err(GcError::bad_argument(format!(
                "cannot heap-allocate non-class type `{}`",
                ty.name
            )));
        }
        if ty.id == 0 || !self.types.contains_key(&ty.id) {
            return Err(GcError::bad_argument(format!(
                "type `{}` is not registered",
                ty.name
            )));
        }
        let bytes = ty.allocation_size();
        let target = if bytes >= self.config.large_object_threshold
            || forced == Some(Generation::Loh)
        {
            LOH
        } else {
            match forced {
                None | Some(Generation::Gen0) => return self.alloc_gen0(tlab, ty),
                Some(Generation::Gen1) => GEN1,
                Some(Generation::Gen2) => GEN2,
                Some(Generation::Region) => {
                    return Err(GcError::bad_argument(
                        "regions are not a forced allocation target",
                    ))
                }
                Some(Generation::Loh) => unreachable!(),
            }
        };
        self.alloc_in_segment(target, ty)
    }

    fn alloc_in_segment(&mut self, seg_idx: usize, ty: &Arc<TypeDesc>) -> Result<usize> {
        let bytes = ty.allocation_size();
        let segment = &mut self.segments[seg_idx];
        let off = segment.try_allocate(bytes).ok_or(GcError::OutOfMemory {
            generation: segment.generation(),
            requested: bytes,
        })?;
        let addr = segment.abs(off);
        unsafe {
            write_header(addr, ty.id);
        }
        segment.bricks.on_allocation(off);
        Ok(addr)
    }

    pub fn alloc_in_region(&mut self, region_base: usize, ty: &Arc<TypeDesc>) -> Result<usize> {
        if !ty.is_class() {
            return Err(GcError::bad_argument(format!(
                "cannot allocate non-class type `{}` in a region",
                ty.name
            )));
        }
        let idx = self
            .segments
            .iter()
            .position(|s| s.generation() == Generation::Region && s.base() == region_base)
            .ok_or(GcError::InvalidReference(region_base))?;
        self.alloc_in_segment(idx, ty)
    }

    // Field access.

    fn ref_slot_offset(ty: &TypeDesc, field: &str) -> Result<usize> {
        let fd = ty
            .field(field)
            .ok_or_else(|| GcError::bad_argument(format!("no field `{}` on `{}`", field, ty.name)))?;
        match fd.kind {
            FieldKind::Ref => Ok(fd.offset),
            _ => Err(GcError::bad_argument(format!(
                "field `{}` of `{}` is not a reference",
                field, ty.name
            ))),
        }
    }

    fn struct_ref_slot_offset(ty: &TypeDesc, struct_field: &str, nested: &str) -> Result<usize> {
        let fd = ty.field(struct_field).ok_or_else(|| {
            GcError::bad_argument(format!("no field `{}` on `{}`", struct_field, ty.name))
        })?;
        let inner = match &fd.kind {
            FieldKind::Struct(inner) => inner,
            _ => {
                return Err(GcError::bad_argument(format!(
                    "field `{}` of `{}` is not a struct",
                    struct_field, ty.name
                )))
            }
        };
        Ok(fd.offset + Self::ref_slot_offset(inner, nested)?)
    }

    /// The write barrier. Stores `child` into the reference slot at
    /// `slot_offset` (payload-relative) of `obj`, enforcing the edge rules:
    /// managed->region stores are rejected before writing; old->maybe-young
    /// stores dirty the covering card; region->managed stores are recorded
    /// as external GC roots.
    fn barriered_ref_store(
        &mut self,
        map: &SegmentMap,
        obj: usize,
        slot_offset: usize,
        child: usize,
    ) -> Result<()> {
        let (seg_idx, _) = self.resolve_object(obj)?;
        let parent_gen = self.segments[seg_idx].generation();
        let child_entry = if child == NULL { None } else { map.lookup(child) };
        if child != NULL {
            if let Some(entry) = child_entry {
                if parent_gen.is_managed() && entry.generation == Generation::Region {
                    return Err(GcError::BadReferenceEdge { parent: obj, child });
                }
            }
        }
        unsafe {
            write_ref(obj, slot_offset, child);
        }
        if child == NULL {
            return Ok(());
        }
        if parent_gen.is_old() {
            // Unresolvable children are conservatively treated as ephemeral:
            // another heap may own them and this heap cannot prove age.
            let maybe_young = match child_entry {
                Some(entry) => entry.generation.is_ephemeral(),
                None => true,
            };
            if maybe_young {
                let segment = &self.segments[seg_idx];
                let write_off = segment.offset_of(obj) + HEADER_SIZE + slot_offset;
                segment.cards.mark_dirty_by_offset(write_off);
            }
        }
        if parent_gen == Generation::Region {
            let managed = child_entry
                .map(|e| e.generation.is_managed())
                .unwrap_or(false);
            if managed {
                self.segments[seg_idx].record_external_root(child);
            }
        }
        Ok(())
    }

    pub fn set_ref(&mut self, map: &SegmentMap, obj: usize, field: &str, child: usize) -> Result<()> {
        let (_, ty) = self.resolve_object(obj)?;
        let slot = Self::ref_slot_offset(&ty, field)?;
        self.barriered_ref_store(map, obj, slot, child)
    }

    pub fn set_struct_ref(
        &mut self,
        map: &SegmentMap,
        obj: usize,
        struct_field: &str,
        nested: &str,
        child: usize,
    ) -> Result<()> {
        let (_, ty) = self.resolve_object(obj)?;
        let slot = Self::struct_ref_slot_offset(&ty, struct_field, nested)?;
        self.barriered_ref_store(map, obj, slot, child)
    }

    pub fn get_ref(&self, obj: usize, field: &str) -> Result<usize> {
        let (_, ty) = self.resolve_object(obj)?;
        let slot = Self::ref_slot_offset(&ty, field)?;
        Ok(unsafe { read_ref(obj, slot) })
    }

    pub fn get_struct_ref(&self, obj: usize, struct_field: &str, nested: &str) -> Result<usize> {
        let (_, ty) = self.resolve_object(obj)?;
        let slot = Self::struct_ref_slot_offset(&ty, struct_field, nested)?;
        Ok(unsafe { read_ref(obj, slot) })
    }

    fn scalar_field_offset(ty: &TypeDesc, field: &str, want: &FieldKind) -> Result<usize> {
        let fd = ty
            .field(field)
            .ok_or_else(|| GcError::bad_argument(format!("no field `{}` on `{}`", field, ty.name)))?;
        if std::mem::discriminant(&fd.kind) != std::mem::discriminant(want) {
            return Err(GcError::bad_argument(format!(
                "field `{}` of `{}` has the wrong kind",
                field, ty.name
            )));
        }
        Ok(fd.offset)
    }

    pub fn set_int32(&mut self, obj: usize, field: &str, value: i32) -> Result<()> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Int32)?;
        unsafe { write_i32(obj, off, value) };
        Ok(())
    }

    pub fn get_int32(&self, obj: usize, field: &str) -> Result<i32> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Int32)?;
        Ok(unsafe { read_i32(obj, off) })
    }

    pub fn set_long(&mut self, obj: usize, field: &str, value: i64) -> Result<()> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Long)?;
        unsafe { write_i64(obj, off, value) };
        Ok(())
    }

    pub fn get_long(&self, obj: usize, field: &str) -> Result<i64> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Long)?;
        Ok(unsafe { read_i64(obj, off) })
    }

    pub fn set_decimal(&mut self, obj: usize, field: &str, value: i128) -> Result<()> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Decimal)?;
        unsafe { write_decimal(obj, off, value) };
        Ok(())
    }

    pub fn get_decimal(&self, obj: usize, field: &str) -> Result<i128> {
        let (_, ty) = self.resolve_object(obj)?;
        let off = Self::scalar_field_offset(&ty, field, &FieldKind::Decimal)?;
        Ok(unsafe { read_decimal(obj, off) })
    }

    // Object iteration.

    /// Walks the back-to-back objects of one segment in address order.
    pub fn walk_segment(
        &self,
        seg_idx: usize,
        f: &mut dyn FnMut(usize, &Arc<TypeDesc>),
    ) -> Result<()> {
        let segment = &self.segments[seg_idx];
        let mut off = 0;
        while off < segment.allocated() {
            let addr = segment.abs(off);
            let type_id = unsafe { read_type_id(addr) };
            if type_id == 0 {
                // Unused tail of a nursery slab: zeroes until the next
                // object header.
                off += WORD;
                continue;
            }
            let ty = self
                .types
                .get(&type_id)
                .ok_or(GcError::InvalidReference(addr))?;
            f(addr, ty);
            off += ty.allocation_size();
        }
        Ok(())
    }

    /// Visits every non-null reference held by objects intersecting the
    /// segment's dirty card ranges. The range start is snapped to an object
    /// start through the brick table, then objects are walked contiguously
    /// until the range is passed.
    pub fn scan_dirty_cards(
        &self,
        seg_idx: usize,
        visit_child: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let segment = &self.segments[seg_idx];
        for (start, end) in segment.cards.dirty_ranges() {
            let mut off = segment.bricks.snap_to_object_start(start);
            while off < segment.allocated() && off < end {
                let addr = segment.abs(off);
                let type_id = unsafe { read_type_id(addr) };
                if type_id == 0 {
                    off += WORD;
                    continue;
                }
                let ty = self
                    .types
                    .get(&type_id)
                    .ok_or(GcError::InvalidReference(addr))?;
                for &ref_off in ty.ref_offsets() {
                    let child = unsafe { read_ref(addr, ref_off) };
                    if child != NULL {
                        visit_child(child);
                    }
                }
                off += ty.allocation_size();
            }
        }
        Ok(())
    }

    // Local sequential minor collection (fallback path; cross-heap graphs
    // are the parallel driver's job).

    /// Seeds ephemeral addresses from local roots, region external roots
    /// and old-generation dirty cards, then traces to closure. Returns the
    /// visited set.
    fn trace_local_ephemeral(&self, map: &SegmentMap) -> Result<AddressSet> {
        let mut visited = AddressSet::default();
        let mut stack: Vec<usize> = Vec::new();

        let seed = |addr: usize, visited: &mut AddressSet, stack: &mut Vec<usize>| {
            if addr != NULL && map.is_ephemeral(addr) && visited.insert(addr) {
                stack.push(addr);
            }
        };

        for &root in self.roots.values() {
            seed(root, &mut visited, &mut stack);
        }
        for region in self.region_indices() {
            if let Some(ext) = self.segments[region].external_roots() {
                for &addr in ext {
                    seed(addr, &mut visited, &mut stack);
                }
            }
        }
        for seg_idx in [GEN1, GEN2, LOH] {
            let mut children = Vec::new();
            self.scan_dirty_cards(seg_idx, &mut |child| children.push(child))?;
            for child in children {
                seed(child, &mut visited, &mut stack);
            }
        }

        while let Some(addr) = stack.pop() {
            let (_, ty) = self.resolve_object(addr)?;
            for &ref_off in ty.ref_offsets() {
                let child = unsafe { read_ref(addr, ref_off) };
                if child != NULL && map.is_ephemeral(child) && visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        Ok(visited)
    }

    /// Diagnostic mark: seeding plus traversal, no moves, no card clears.
    /// With `mark_all_old_cards` every old card is dirtied first so the
    /// old-generation scan covers everything. Returns the mark count.
    pub fn mark_ephemeral(&mut self, mark_all_old_cards: bool) -> Result<usize> {
        if mark_all_old_cards {
            for seg_idx in [GEN1, GEN2, LOH] {
                self.segments[seg_idx].cards.mark_all_dirty();
            }
        }
        let map = SegmentMap::local(self);
        let visited = self.trace_local_ephemeral(&map)?;
        debug!(target: "gc", "{}: diagnostic mark, {} ephemeral objects", self.name, visited.len());
        Ok(visited.len())
    }

    /// Sequential minor collection over this heap alone: mark, compact the
    /// nursery, promote survivors to Gen1, rewrite local references, reset
    /// the nursery and drop the remembered set. Returns the survivor count.
    pub fn collect_ephemeral(&mut self) -> Result<usize> {
        let map = SegmentMap::local(self);
        let visited = self.trace_local_ephemeral(&map)?;
        let survivors = visited
            .iter()
            .filter(|&&a| self.segments[GEN0].contains(a))
            .count();
        debug!(
            target: "gc",
            "{}: minor gc, {} live ({} nursery survivors), nursery {} used",
            self.name,
            visited.len(),
            survivors,
            formatted_size(self.segments[GEN0].allocated()),
        );

        let compaction = self.compact_gen0(&visited)?;
        self.apply_relocations(&compaction)?;

        let promotion = self.promote_gen0()?;
        self.apply_relocations(&promotion)?;

        self.reset_nursery();
        self.clear_old_cards();
        Ok(survivors)
    }

    /// Slides live nursery objects to the low end of the buffer through a
    /// scratch copy, zeroes the freed tail and returns old->new addresses
    /// (identity entries included).
    pub fn compact_gen0(&mut self, live: &AddressSet) -> Result<RelocationMap> {
        let mut objects: Vec<(usize, usize)> = Vec::new();
        self.walk_segment(GEN0, &mut |addr, ty| {
            objects.push((addr, ty.allocation_size()));
        })?;

        let segment = &mut self.segments[GEN0];
        let old_alloc = segment.allocated();
        let mut scratch = vec![0u8; old_alloc];
        let mut reloc = RelocationMap::default();
        let mut cursor = 0usize;
        for (addr, size) in objects {
            if !live.contains(&addr) {
                continue;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    addr as *const u8,
                    scratch.as_mut_ptr().add(cursor),
                    size,
                );
            }
            reloc.insert(addr, segment.abs(cursor));
            cursor += size;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), segment.base() as *mut u8, cursor);
            segment.zero_range(cursor, old_alloc);
        }
        segment.set_allocated(cursor);
        Ok(reloc)
    }

    /// Copies every (post-compaction) nursery object into Gen1, recording
    /// old->new addresses and feeding Gen1's brick table. The nursery is
    /// left as-is; the caller resets it after rewriting references.
    pub fn promote_gen0(&mut self) -> Result<RelocationMap> {
        let mut objects: Vec<(usize, usize)> = Vec::new();
        self.walk_segment(GEN0, &mut |addr, ty| {
            objects.push((addr, ty.allocation_size()));
        })?;

        let mut reloc = RelocationMap::default();
        for (addr, size) in objects {
            let gen1 = &mut self.segments[GEN1];
            let off = gen1.try_allocate(size).ok_or(GcError::OutOfMemory {
                generation: Generation::Gen1,
                requested: size,
            })?;
            let new_addr = gen1.abs(off);
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, size);
            }
            gen1.bricks.on_allocation(off);
            reloc.insert(addr, new_addr);
        }
        Ok(reloc)
    }

    /// Rewrites every reference this heap holds (named roots, region
    /// external roots, and the reference slots of every object in every
    /// segment) through the relocation map.
    pub fn apply_relocations(&mut self, reloc: &RelocationMap) -> Result<()> {
        if reloc.is_empty() {
            return Ok(());
        }
        for root in self.roots.values_mut() {
            if let Some(&new_addr) = reloc.get(root) {
                *root = new_addr;
            }
        }
        for region in self.region_indices() {
            if let Some(ext) = self.segments[region].external_roots_mut() {
                let remapped: AddressSet = ext
                    .iter()
                    .map(|a| reloc.get(a).copied().unwrap_or(*a))
                    .collect();
                *ext = remapped;
            }
        }
        for seg_idx in 0..self.segments.len() {
            self.walk_segment(seg_idx, &mut |addr, ty| {
                for &ref_off in ty.ref_offsets() {
                    let child = unsafe { read_ref(addr, ref_off) };
                    if let Some(&new_addr) = reloc.get(&child) {
                        unsafe { write_ref(addr, ref_off, new_addr) };
                    }
                }
            })?;
        }
        Ok(())
    }

    /// Empties the nursery and invalidates every outstanding TLH.
    pub fn reset_nursery(&mut self) {
        self.segments[GEN0].reset_nursery_layout();
        self.nursery_epoch += 1;
    }

    /// Drops the remembered set; future write barriers rebuild it.
    pub fn clear_old_cards(&mut self) {
        for seg_idx in [GEN1, GEN2, LOH] {
            self.segments[seg_idx].cards.clear_all();
        }
    }

    // Reporting.

    pub fn report(&self) -> Result<HeapReport> {
        let mut segments = Vec::with_capacity(self.segments.len());
        for seg_idx in 0..self.segments.len() {
            let segment = &self.segments[seg_idx];
            let mut objects = Vec::new();
            let mut index = 0usize;
            self.walk_segment(seg_idx, &mut |addr, ty| {
                objects.push(Self::report_object(index, addr, ty));
                index += 1;
            })?;
            segments.push(SegmentReport {
                generation: segment.generation(),
                base: segment.base(),
                size: segment.size(),
                allocated_bytes: segment.allocated(),
                dirty_card_count: segment.cards.dirty_count(),
                objects,
            });
        }
        let mut roots: Vec<RootReport> = self
            .roots
            .iter()
            .map(|(name, &address)| RootReport {
                name: name.clone(),
                address,
            })
            .collect();
        roots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(HeapReport {
            heap: self.name.clone(),
            segments,
            roots,
        })
    }

    fn report_object(index: usize, addr: usize, ty: &Arc<TypeDesc>) -> ObjectReport {
        let mut fields = Vec::new();
        let mut struct_summaries = Vec::new();
        for fd in &ty.fields {
            match &fd.kind {
                FieldKind::Int32 => fields.push(FieldReport {
                    name: fd.name.clone(),
                    value: FieldValue::Int32(unsafe { read_i32(addr, fd.offset) }),
                }),
                FieldKind::Long => fields.push(FieldReport {
                    name: fd.name.clone(),
                    value: FieldValue::Long(unsafe { read_i64(addr, fd.offset) }),
                }),
                FieldKind::Decimal => fields.push(FieldReport {
                    name: fd.name.clone(),
                    value: FieldValue::Decimal(unsafe { read_decimal(addr, fd.offset) }),
                }),
                FieldKind::Ref => fields.push(FieldReport {
                    name: fd.name.clone(),
                    value: FieldValue::Ref(unsafe { read_ref(addr, fd.offset) }),
                }),
                FieldKind::Struct(inner) => {
                    struct_summaries.push(format!(
                        "{}: {}",
                        fd.name,
                        summarize_struct(addr, fd.offset, inner)
                    ));
                }
            }
        }
        ObjectReport {
            index,
            type_name: ty.name.clone(),
            address: addr,
            size: ty.allocation_size(),
            fields,
            struct_summaries,
        }
    }
}

fn summarize_struct(obj: usize, base: usize, ty: &TypeDesc) -> String {
    let mut parts = Vec::new();
    for fd in &ty.fields {
        let off = base + fd.offset;
        let rendered = match &fd.kind {
            FieldKind::Int32 => format!("{}: {}", fd.name, unsafe { read_i32(obj, off) }),
            FieldKind::Long => format!("{}: {}", fd.name, unsafe { read_i64(obj, off) }),
            FieldKind::Decimal => format!("{}: {}", fd.name, unsafe { read_decimal(obj, off) }),
            FieldKind::Ref => format!("{}: {:#x}", fd.name, unsafe { read_ref(obj, off) }),
            FieldKind::Struct(inner) => {
                format!("{}: {}", fd.name, summarize_struct(obj, off, inner))
            }
        };
        parts.push(rendered);
    }
    format!("{} {{ {} }}", ty.name, parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldDesc;

    fn test_heap() -> (Heap, Arc<TypeDesc>) {
        let config = GcConfig {
            gen0_size: 32 * 1024,
            gen1_size: 32 * 1024,
            gen2_size: 64 * 1024,
            loh_size: 64 * 1024,
            tlab_size: 4 * 1024,
            ..GcConfig::default()
        };
        let mut heap = Heap::new(0, config);
        let mut node = TypeDesc::class(
            "Node",
            vec![
                FieldDesc::new("Id", FieldKind::Int32),
                FieldDesc::new("Next", FieldKind::Ref),
            ],
        );
        node.id = 1;
        node.compute_layout().unwrap();
        let node = Arc::new(node);
        heap.install_type(node.clone());
        (heap, node)
    }

    #[test]
    fn diagnostic_mark_moves_nothing_and_keeps_cards() {
        let (mut heap, node) = test_heap();
        let mut tlab = Tlab::unbound();
        let old = heap.alloc(&mut tlab, &node, Some(Generation::Gen1)).unwrap();
        let young = heap.alloc(&mut tlab, &node, None).unwrap();
        let map = SegmentMap::local(&heap);
        heap.set_ref(&map, old, "Next", young).unwrap();
        heap.set_root("old", old).unwrap();

        let pre_alloc = heap.gen0().allocated();
        let pre_cards = heap.segment(GEN1).cards.dirty_count();
        assert!(pre_cards >= 1);

        // Both ephemeral objects are found; nothing moves, no card drops.
        assert_eq!(heap.mark_ephemeral(false).unwrap(), 2);
        assert_eq!(heap.gen0().allocated(), pre_alloc);
        assert_eq!(heap.segment(GEN1).cards.dirty_count(), pre_cards);

        // Forcing every old card dirty only widens the scan.
        assert_eq!(heap.mark_ephemeral(true).unwrap(), 2);
        assert!(heap.segment(GEN1).cards.dirty_count() >= pre_cards);

        heap.collect_ephemeral().unwrap();
        assert_eq!(heap.gen0().allocated(), 0);
        assert_eq!(heap.segment(GEN1).cards.dirty_count(), 0);
        let promoted = heap.get_ref(old, "Next").unwrap();
        assert!(heap.segment(GEN1).contains(promoted));
    }
}
