//! Trace regions: object-list allocation with tri-colour mark-sweep.
//!
//! Interior objects live on an intrusive doubly-linked list (the entry point
//! stays off the list). Collection marks from the entry point and the
//! remembered set via descriptor `trace` callbacks, then sweeps the list in
//! order: unmarked objects are unlinked, finalized and freed. Finalizers may
//! push owned sub-region entry points onto the sweep's worklist; the API
//! layer releases those afterwards.
use crate::object::{self, Descriptor, ObjectPtr, ObjectStack};
use crate::region::{Region, RegionKind, RegionPtr, SubRegionWorklist};
use std::ptr;

pub struct TraceRegion {
    /// Head of the interior object list; the entry point is not linked here.
    head: *mut object::Object,
    /// Object count, entry point included.
    object_count: usize,
    /// Bytes of object storage, entry point included.
    bytes_used: usize,
    /// Set by freeze: the region is immortal, allocation and GC are over.
    frozen: bool,
}

impl TraceRegion {
    fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            object_count: 0,
            bytes_used: 0,
            frozen: false,
        }
    }

    /// Create a fresh trace region; returns its entry point.
    pub(crate) fn create(descriptor: &'static Descriptor) -> ObjectPtr {
        let region = Region::create(RegionKind::Trace(TraceRegion::new()));
        let entry = object::alloc_object(descriptor);
        entry.set_region(region);
        match &mut *region.kind().borrow_mut() {
            RegionKind::Trace(trace) => {
                trace.object_count = 1;
                trace.bytes_used = entry.alloc_size();
            }
            _ => unreachable!(),
        }
        entry
    }

    /// Allocate a zeroed object and prepend it to the object list.
    pub(crate) fn alloc(&mut self, descriptor: &'static Descriptor) -> ObjectPtr {
        assert!(!self.frozen, "cannot allocate into a frozen region");
        let o = object::alloc_object(descriptor);
        self.link_front(o);
        self.object_count += 1;
        self.bytes_used += o.alloc_size();
        o
    }

    fn link_front(&mut self, o: ObjectPtr) {
        o.set_next(self.head);
        o.set_prev(ptr::null_mut());
        if !self.head.is_null() {
            unsafe { ObjectPtr::from_raw(self.head) }.set_prev(o.as_raw());
        }
        self.head = o.as_raw();
    }

    fn unlink(&mut self, o: ObjectPtr) {
        let prev = o.prev();
        let next = o.next();
        if prev.is_null() {
            self.head = next;
        } else {
            unsafe { ObjectPtr::from_raw(prev) }.set_next(next);
        }
        if !next.is_null() {
            unsafe { ObjectPtr::from_raw(next) }.set_prev(prev);
        }
    }

    fn mark(&self, entry: ObjectPtr, region: RegionPtr) {
        let mut stack = ObjectStack::new();
        stack.push(entry);
        region.base().remembered.borrow().root_into(&mut stack);
        while let Some(o) = stack.pop() {
            // entry points of other regions and frozen objects are
            // boundaries: neither marked nor traversed
            if o != entry && (o.is_iso() || o.immutable()) {
                continue;
            }
            if o.marked() {
                continue;
            }
            o.set_marked(true);
            (o.descriptor().trace)(o, &mut stack);
        }
    }

    fn sweep(&mut self, entry: ObjectPtr, region: RegionPtr, sub_regions: &mut SubRegionWorklist) {
        let mut external_refs = region.base().external_refs.borrow_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let o = unsafe { ObjectPtr::from_raw(cur) };
            let next = o.next();
            if o.marked() {
                o.set_marked(false);
            } else {
                self.unlink(o);
                if let Some(finalize) = o.descriptor().finalizer {
                    finalize(o, sub_regions);
                }
                external_refs.invalidate_target(o);
                self.object_count -= 1;
                self.bytes_used -= o.alloc_size();
                unsafe { object::free_object(o) };
            }
            cur = next;
        }
        entry.set_marked(false);
    }

    /// Finalize and free every object, the entry point last. Sub-region entry
    /// points collected by finalizers land on `sub_regions`.
    pub(crate) fn release(&mut self, entry: ObjectPtr, sub_regions: &mut SubRegionWorklist) {
        let mut cur = self.head;
        while !cur.is_null() {
            let o = unsafe { ObjectPtr::from_raw(cur) };
            let next = o.next();
            if let Some(finalize) = o.descriptor().finalizer {
                finalize(o, sub_regions);
            }
            unsafe { object::free_object(o) };
            cur = next;
        }
        self.head = ptr::null_mut();
        if let Some(finalize) = entry.descriptor().finalizer {
            finalize(entry, sub_regions);
        }
        unsafe { object::free_object(entry) };
        self.object_count = 0;
        self.bytes_used = 0;
    }

    /// Splice the object list of `src` onto this region. `src_entry` becomes
    /// an ordinary interior object.
    fn merge_lists(&mut self, src: &mut TraceRegion, src_entry: ObjectPtr) {
        assert!(
            !self.frozen && !src.frozen,
            "cannot merge frozen regions"
        );
        src_entry.clear_iso(src.head);
        src_entry.set_prev(ptr::null_mut());
        if !src.head.is_null() {
            unsafe { ObjectPtr::from_raw(src.head) }.set_prev(src_entry.as_raw());
        }
        src.head = src_entry.as_raw();

        let mut tail = src.head;
        while !unsafe { ObjectPtr::from_raw(tail) }.next().is_null() {
            tail = unsafe { ObjectPtr::from_raw(tail) }.next();
        }
        unsafe { ObjectPtr::from_raw(tail) }.set_next(self.head);
        if !self.head.is_null() {
            unsafe { ObjectPtr::from_raw(self.head) }.set_prev(tail);
        }
        self.head = src.head;

        self.object_count += src.object_count;
        self.bytes_used += src.bytes_used;
        src.head = ptr::null_mut();
        src.object_count = 0;
        src.bytes_used = 0;
    }

    pub(crate) fn set_frozen(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn memory_used(&self) -> usize {
        self.bytes_used
    }
}

/// Mark-sweep collection of the region owned by `entry`. Returns the entry
/// points of sub-regions whose owners died; the caller releases them.
pub(crate) fn gc(entry: ObjectPtr) -> SubRegionWorklist {
    let region = entry.region();
    let mut sub_regions = SubRegionWorklist::default();
    let mut kind = region.kind().borrow_mut();
    let RegionKind::Trace(state) = &mut *kind else {
        panic!("trace collection on a non-trace region");
    };
    if state.frozen {
        return sub_regions;
    }
    state.mark(entry, region);
    state.sweep(entry, region, &mut sub_regions);
    sub_regions
}

/// Splice the region owned by `src_entry` into `dst` and retire its
/// metadata. Both regions must be trace regions.
pub(crate) fn merge_regions(dst: RegionPtr, src_entry: ObjectPtr) {
    let src_region = src_entry.region();
    {
        let mut dst_kind = dst.kind().borrow_mut();
        let mut src_kind = src_region.kind().borrow_mut();
        match (&mut *dst_kind, &mut *src_kind) {
            (RegionKind::Trace(d), RegionKind::Trace(s)) => d.merge_lists(s, src_entry),
            _ => unreachable!("merge_regions called with non-trace regions"),
        }
    }
    let dst_base = dst.base();
    let src_base = src_region.base();
    src_base.external_refs.borrow_mut().rehome(dst);
    dst_base
        .external_refs
        .borrow_mut()
        .absorb(&mut src_base.external_refs.borrow_mut());
    dst_base
        .remembered
        .borrow_mut()
        .absorb(&mut src_base.remembered.borrow_mut());
    crate::region::retire_merged_region(src_region);
}
