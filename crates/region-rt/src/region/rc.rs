//! Reference-counted regions with deferred cycle collection.
//!
//! Every object carries a plain (non-atomic) count; the single-accessor
//! guarantee of the region state machine makes that sound. A decref that
//! reaches zero destroys the object and cascades through its out-edges with
//! an explicit worklist. A decref that leaves a positive count marks the
//! object *suspicious*: it may be the root of an unreachable cycle, and is
//! pushed for the deferred collector.
//!
//! Cycle collection is Lins-style trial deletion over the suspicious roots:
//!
//! 1. **mark-red** colours the root's subgraph red, trial-decrementing every
//!    traversed edge. Targets whose count stays positive after a decrement
//!    go onto the *jump stack*: they may be externally referenced, and the
//!    scan must not miss them just because some internal edge later drives
//!    their count to zero.
//! 2. **scan** restores (re-greens and re-increments out-edges of) the
//!    subgraph reachable from any anchor that kept a positive count: the
//!    root itself, or a jump-stack entry that is still red and positive.
//! 3. **collect** frees everything still red. The trial decrements of the
//!    freed objects' out-edges stand as the permanent release of those
//!    references.
//!
//! All three passes use explicit worklists so that million-object cycles
//! cannot overflow the call stack.
use crate::object::{self, Color, Descriptor, ObjectPtr, ObjectStack};
use crate::region::{interior_edge, ExternalRefTable, Region, RegionKind, SubRegionWorklist};
use std::cell::RefMut;
use std::ptr;

pub struct RcRegion {
    /// Head of the interior object list; the entry point is not linked here.
    head: *mut object::Object,
    /// Object count, entry point included.
    object_count: usize,
    bytes_used: usize,
    /// Lins roots: suspicious objects awaiting deferred cycle collection.
    lins_stack: Vec<ObjectPtr>,
}

impl RcRegion {
    fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            object_count: 0,
            bytes_used: 0,
            lins_stack: Vec::new(),
        }
    }

    /// Create a fresh Rc region; returns its entry point.
    ///
    /// The entry point's count starts at 1 (its external owner), which is
    /// why cycle collection can never free it.
    pub(crate) fn create(descriptor: &'static Descriptor) -> ObjectPtr {
        let region = Region::create(RegionKind::Rc(RcRegion::new()));
        let entry = object::alloc_object(descriptor);
        entry.set_region(region);
        match &mut *region.kind().borrow_mut() {
            RegionKind::Rc(rc) => {
                rc.object_count = 1;
                rc.bytes_used = entry.alloc_size();
            }
            _ => unreachable!(),
        }
        entry
    }

    /// Allocate a zeroed object with a count of 1 (the reference the caller
    /// is about to store).
    pub(crate) fn alloc(&mut self, descriptor: &'static Descriptor) -> ObjectPtr {
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

    fn mark_suspicious(&mut self, o: ObjectPtr) {
        if !o.suspicious() {
            o.set_suspicious(true);
            self.lins_stack.push(o);
        }
    }

    /// Drop `o` from the suspicious set. Must happen before an object's
    /// memory is reused: a stale root would make the collector walk freed
    /// memory.
    fn remove_from_lins(&mut self, o: ObjectPtr) {
        if let Some(pos) = self.lins_stack.iter().position(|&p| p == o) {
            self.lins_stack.swap_remove(pos);
        }
        o.set_suspicious(false);
    }

    /// Destroy `start` (whose count has reached zero) and cascade through
    /// its out-edges iteratively.
    fn dealloc_cascade(
        &mut self,
        start: ObjectPtr,
        external_refs: &mut RefMut<'_, ExternalRefTable>,
        sub_regions: &mut SubRegionWorklist,
    ) {
        let mut pending = ObjectStack::new();
        let mut scratch = ObjectStack::new();
        start.set_rc(0);
        pending.push(start);
        while let Some(o) = pending.pop() {
            if o.suspicious() {
                self.remove_from_lins(o);
            }
            self.unlink(o);
            if let Some(finalize) = o.descriptor().finalizer {
                finalize(o, sub_regions);
            }
            scratch.clear();
            (o.descriptor().trace)(o, &mut scratch);
            while let Some(c) = scratch.pop() {
                if !interior_edge(c) {
                    continue;
                }
                if c.rc() == 0 {
                    // already queued for destruction
                    continue;
                }
                if c.rc() == 1 {
                    c.set_rc(0);
                    pending.push(c);
                } else {
                    c.dec_rc();
                    self.mark_suspicious(c);
                }
            }
            external_refs.invalidate_target(o);
            self.object_count -= 1;
            self.bytes_used -= o.alloc_size();
            unsafe { object::free_object(o) };
        }
    }

    fn mark_red(root: ObjectPtr, jump: &mut ObjectStack, scratch: &mut ObjectStack) {
        root.set_color(Color::Red);
        let mut visit = ObjectStack::new();
        visit.push(root);
        while let Some(o) = visit.pop() {
            scratch.clear();
            (o.descriptor().trace)(o, scratch);
            while let Some(c) = scratch.pop() {
                if !interior_edge(c) {
                    continue;
                }
                c.dec_rc();
                if c.color() != Color::Red {
                    c.set_color(Color::Red);
                    visit.push(c);
                }
                if c.rc() > 0 {
                    jump.push(c);
                }
            }
        }
    }

    fn scan(root: ObjectPtr, jump: &mut ObjectStack, scratch: &mut ObjectStack) {
        if root.color() == Color::Red && root.rc() > 0 {
            Self::scan_green(root, scratch);
        }
        while let Some(o) = jump.pop() {
            if o.color() == Color::Red && o.rc() > 0 {
                Self::scan_green(o, scratch);
            }
        }
    }

    /// Restore the subgraph reachable from the live anchor `o`: re-green
    /// every red object and undo the trial decrements of their in-edges.
    fn scan_green(o: ObjectPtr, scratch: &mut ObjectStack) {
        o.set_color(Color::Green);
        let mut visit = ObjectStack::new();
        visit.push(o);
        while let Some(v) = visit.pop() {
            scratch.clear();
            (v.descriptor().trace)(v, scratch);
            while let Some(c) = scratch.pop() {
                if !interior_edge(c) {
                    continue;
                }
                c.inc_rc();
                if c.color() == Color::Red {
                    c.set_color(Color::Green);
                    visit.push(c);
                }
            }
        }
    }

    /// Free everything still red after scan. Reachable-from-root through red
    /// objects only, by construction: a red object reachable through a green
    /// one would have been re-greened by scan.
    fn collect(
        &mut self,
        root: ObjectPtr,
        external_refs: &mut RefMut<'_, ExternalRefTable>,
        sub_regions: &mut SubRegionWorklist,
        scratch: &mut ObjectStack,
    ) {
        if root.color() != Color::Red {
            return;
        }
        let mut dead = Vec::new();
        let mut visit = ObjectStack::new();
        root.set_color(Color::Clear);
        visit.push(root);
        while let Some(o) = visit.pop() {
            dead.push(o);
            scratch.clear();
            (o.descriptor().trace)(o, scratch);
            while let Some(c) = scratch.pop() {
                if !interior_edge(c) {
                    continue;
                }
                if c.color() == Color::Red {
                    c.set_color(Color::Clear);
                    visit.push(c);
                }
            }
        }
        for o in dead {
            if o.suspicious() {
                self.remove_from_lins(o);
            }
            self.unlink(o);
            if let Some(finalize) = o.descriptor().finalizer {
                finalize(o, sub_regions);
            }
            external_refs.invalidate_target(o);
            self.object_count -= 1;
            self.bytes_used -= o.alloc_size();
            unsafe { object::free_object(o) };
        }
    }

    /// Finalize and free every object, the entry point last.
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
        self.lins_stack.clear();
        if let Some(finalize) = entry.descriptor().finalizer {
            finalize(entry, sub_regions);
        }
        unsafe { object::free_object(entry) };
        self.object_count = 0;
        self.bytes_used = 0;
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn memory_used(&self) -> usize {
        self.bytes_used
    }

    /// Number of suspicious roots awaiting deferred cycle collection.
    pub fn suspicious_count(&self) -> usize {
        self.lins_stack.len()
    }
}

/// Decrement `o`'s count in the region owned by `entry`. Frees `o` and
/// cascades when the count reaches zero; otherwise marks it suspicious.
/// Returns the entry points of sub-regions collected by finalizers.
pub(crate) fn decref(entry: ObjectPtr, o: ObjectPtr) -> SubRegionWorklist {
    let region = entry.region();
    let mut sub_regions = SubRegionWorklist::default();
    let mut kind = region.kind().borrow_mut();
    let RegionKind::Rc(state) = &mut *kind else {
        panic!("decref on a non-Rc region");
    };
    let mut external_refs = region.base().external_refs.borrow_mut();
    if o.rc() == 1 {
        state.dealloc_cascade(o, &mut external_refs, &mut sub_regions);
    } else {
        o.dec_rc();
        state.mark_suspicious(o);
    }
    sub_regions
}

/// Run the deferred cycle collector over the suspicious roots of the region
/// owned by `entry`, to fixpoint.
pub(crate) fn gc_cycles(entry: ObjectPtr) -> SubRegionWorklist {
    let region = entry.region();
    let mut sub_regions = SubRegionWorklist::default();
    let mut kind = region.kind().borrow_mut();
    let RegionKind::Rc(state) = &mut *kind else {
        panic!("cycle collection on a non-Rc region");
    };
    let mut external_refs = region.base().external_refs.borrow_mut();
    let mut jump = ObjectStack::new();
    let mut scratch = ObjectStack::new();
    while let Some(root) = state.lins_stack.pop() {
        root.set_suspicious(false);
        RcRegion::mark_red(root, &mut jump, &mut scratch);
        RcRegion::scan(root, &mut jump, &mut scratch);
        state.collect(root, &mut external_refs, &mut sub_regions, &mut scratch);
    }
    sub_regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Pair {
        left: *mut object::Object,
        right: *mut object::Object,
    }

    static PAIR: Descriptor = Descriptor {
        size: std::mem::size_of::<Pair>(),
        trace: |o, st| {
            let p = o.payload::<Pair>();
            unsafe {
                st.push_raw((*p).left);
                st.push_raw((*p).right);
            }
        },
        finalizer: None,
    };

    fn destroy(entry: ObjectPtr) {
        let region = entry.region();
        let mut sub_regions = SubRegionWorklist::default();
        match &mut *region.kind().borrow_mut() {
            RegionKind::Rc(rc) => rc.release(entry, &mut sub_regions),
            _ => unreachable!(),
        }
        region.base().external_refs.borrow_mut().dealloc();
        assert!(sub_regions.is_empty());
        unsafe { Region::destroy(region) };
    }

    fn alloc_in(entry: ObjectPtr) -> ObjectPtr {
        match &mut *entry.region().kind().borrow_mut() {
            RegionKind::Rc(rc) => rc.alloc(&PAIR),
            _ => unreachable!(),
        }
    }

    fn set_left(o: ObjectPtr, target: *mut object::Object) {
        unsafe { (*o.payload::<Pair>()).left = target };
    }

    #[test]
    fn test_decref_to_zero_cascades_down_a_chain() {
        let entry = RcRegion::create(&PAIR);
        let a = alloc_in(entry);
        let b = alloc_in(entry);
        let c = alloc_in(entry);
        set_left(a, b.as_raw());
        set_left(b, c.as_raw());
        assert_eq!(entry.region().object_count(), 4);
        decref(entry, a);
        assert_eq!(entry.region().object_count(), 1);
        destroy(entry);
    }

    #[test]
    fn test_decref_leaving_count_marks_suspicious_once() {
        let entry = RcRegion::create(&PAIR);
        let a = alloc_in(entry);
        a.inc_rc();
        a.inc_rc();
        decref(entry, a);
        decref(entry, a);
        let region = entry.region();
        match &*region.kind().borrow() {
            RegionKind::Rc(rc) => assert_eq!(rc.suspicious_count(), 1),
            _ => unreachable!(),
        }
        assert!(a.suspicious());
        destroy(entry);
    }

    #[test]
    fn test_cascade_removes_victims_from_lins_stack() {
        let entry = RcRegion::create(&PAIR);
        let a = alloc_in(entry);
        a.inc_rc();
        decref(entry, a); // a now suspicious with count 1
        assert!(a.suspicious());
        decref(entry, a); // destroys a; the stale root must go too
        match &*entry.region().kind().borrow() {
            RegionKind::Rc(rc) => assert_eq!(rc.suspicious_count(), 0),
            _ => unreachable!(),
        }
        assert_eq!(entry.region().object_count(), 1);
        // the collector has nothing left to do
        gc_cycles(entry);
        assert_eq!(entry.region().object_count(), 1);
        destroy(entry);
    }

    #[test]
    fn test_incref_decref_is_identity() {
        let entry = RcRegion::create(&PAIR);
        let a = alloc_in(entry);
        let before = a.rc();
        a.inc_rc();
        decref(entry, a);
        assert_eq!(a.rc(), before);
        destroy(entry);
    }
}
