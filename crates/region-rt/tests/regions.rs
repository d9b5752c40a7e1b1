//! Region lifecycle coverage across the three disciplines: arena bulk
//! release, merging, freezing, external references, remembered sets, and
//! sub-region release through finalizers.
mod common;

use common::{drain_gc, f1, heap_lock, set_f1, set_f2, NODE};
use region_rt::api::{
    allocate, create_external_reference, create_fresh_region, debug_memory_used, debug_size,
    forget_region, freeze, is_external_reference_valid, is_region_ref, merge, region_collect,
    region_release, remember_region, use_external_reference,
};
use region_rt::object::Object;
use region_rt::{Descriptor, ObjectPtr, ObjectStack, RegionType, UsingRegion};
use region_utils::heap;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

#[test]
fn test_arena_bulk_release() {
    let _lock = heap_lock();
    let entry = create_fresh_region(RegionType::Arena, &NODE);
    {
        let _rr = UsingRegion::new(entry);
        for _ in 0..10_000 {
            allocate(&NODE);
        }
        assert_eq!(debug_size(), 10_001);
        let bytes = debug_memory_used();

        // arena collection is a no-op: nothing is ever unreachable enough
        region_collect();
        assert_eq!(debug_size(), 10_001);
        assert_eq!(debug_memory_used(), bytes);
    }
    region_release(entry);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_arena_merge() {
    let _lock = heap_lock();
    let dst = create_fresh_region(RegionType::Arena, &NODE);
    let src = create_fresh_region(RegionType::Arena, &NODE);
    {
        let _rr = UsingRegion::new(src);
        for _ in 0..5 {
            allocate(&NODE);
        }
    }
    drain_gc();
    {
        let _rr = UsingRegion::new(dst);
        for _ in 0..3 {
            allocate(&NODE);
        }
        merge(src);
        assert!(!src.is_iso());
        // dst entry + 3, src entry + 5
        assert_eq!(debug_size(), 10);
        allocate(&NODE);
        assert_eq!(debug_size(), 11);
    }
    region_release(dst);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_trace_merge_keeps_objects_collectable() {
    let _lock = heap_lock();
    let dst = create_fresh_region(RegionType::Trace, &NODE);
    let src = create_fresh_region(RegionType::Trace, &NODE);
    let keep;
    {
        let _rr = UsingRegion::new(src);
        // both interior objects hang off the src entry so the background
        // collection scheduled on close has nothing to sweep
        let a = allocate(&NODE);
        let b = allocate(&NODE);
        set_f1(src, a.as_raw());
        set_f2(src, b.as_raw());
        keep = a.as_raw();
    }
    drain_gc();
    {
        let _rr = UsingRegion::new(dst);
        merge(src);
        // dst entry + src entry + 2 interior objects
        assert_eq!(debug_size(), 4);

        // keep the old src entry alive from the new region root; dropping
        // one of its edges makes that object collectable
        set_f1(dst, src.as_raw());
        set_f2(src, ptr::null_mut());
        region_collect();
        assert_eq!(debug_size(), 3);
        assert_eq!(f1(src), keep);
    }
    region_release(dst);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_merge_type_mismatch_panics() {
    let _lock = heap_lock();
    let dst = create_fresh_region(RegionType::Trace, &NODE);
    let src = create_fresh_region(RegionType::Arena, &NODE);
    {
        let _rr = UsingRegion::new(dst);
        let result = panic::catch_unwind(AssertUnwindSafe(|| merge(src)));
        assert!(result.is_err());
    }
    region_release(dst);
    region_release(src);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_freeze_stops_collection_and_allocation() {
    let _lock = heap_lock();
    let entry = create_fresh_region(RegionType::Trace, &NODE);
    {
        let _rr = UsingRegion::new(entry);
        let a = allocate(&NODE);
        set_f1(entry, a.as_raw());
        allocate(&NODE); // would be garbage in a live region
        assert_eq!(debug_size(), 3);
        freeze(entry);
        assert!(entry.immutable());
        assert!(a.immutable());
    }
    drain_gc(); // the scheduled collection finds an immortal region
    {
        let _rr = UsingRegion::new(entry);
        // the stray object survives every collection attempt
        region_collect();
        assert_eq!(debug_size(), 3);
        let result = panic::catch_unwind(AssertUnwindSafe(|| allocate(&NODE)));
        assert!(result.is_err());
    }
    region_release(entry);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_external_references_track_their_target() {
    let _lock = heap_lock();
    let entry = create_fresh_region(RegionType::Trace, &NODE);
    {
        let _rr = UsingRegion::new(entry);
        let a = allocate(&NODE);
        set_f1(entry, a.as_raw());
        let handle = create_external_reference(a);
        assert!(is_external_reference_valid(handle));
        assert_eq!(use_external_reference(handle), a);

        // drop the only edge to the target; collection invalidates the handle
        set_f1(entry, ptr::null_mut());
        region_collect();
        assert!(!is_external_reference_valid(handle));
    }
    region_release(entry);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_external_references_move_with_merge() {
    let _lock = heap_lock();
    let dst = create_fresh_region(RegionType::Trace, &NODE);
    let src = create_fresh_region(RegionType::Trace, &NODE);
    let handle;
    {
        let _rr = UsingRegion::new(src);
        let a = allocate(&NODE);
        set_f1(src, a.as_raw());
        handle = create_external_reference(a);
    }
    drain_gc();
    {
        let _rr = UsingRegion::new(dst);
        merge(src);
        set_f1(dst, src.as_raw());
        // the handle now belongs to the merged region
        assert!(is_external_reference_valid(handle));
        assert_eq!(use_external_reference(handle).as_raw(), f1(src));
    }
    region_release(dst);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_is_region_ref_spots_foreign_entry_points() {
    let _lock = heap_lock();
    let entry = create_fresh_region(RegionType::Trace, &NODE);
    let other = create_fresh_region(RegionType::Trace, &NODE);
    {
        let _rr = UsingRegion::new(entry);
        let interior = allocate(&NODE);
        assert!(!is_region_ref(entry));
        assert!(!is_region_ref(interior));
        assert!(is_region_ref(other));
    }
    region_release(entry);
    region_release(other);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_remembered_set_roots_survive_collection() {
    let _lock = heap_lock();
    let parent = create_fresh_region(RegionType::Trace, &NODE);
    let child = create_fresh_region(RegionType::Trace, &NODE);
    {
        let _rr = UsingRegion::new(parent);
        remember_region(child);
        allocate(&NODE); // garbage
        region_collect();
        assert_eq!(debug_size(), 1);
        assert!(forget_region(child));
        assert!(!forget_region(child));
    }
    region_release(parent);
    region_release(child);
    drain_gc();
    heap::debug_check_empty();
}

/// An object owning a sub-region hands it to the release worklist from its
/// finalizer; collecting or releasing the parent releases the child too.
#[repr(C)]
struct Owner {
    child: *mut Object,
}

fn trace_owner(o: ObjectPtr, st: &mut ObjectStack) {
    let p = o.payload::<Owner>();
    unsafe { st.push_raw((*p).child) };
}

fn finalize_owner(o: ObjectPtr, sub_regions: &mut ObjectStack) {
    let p = o.payload::<Owner>();
    unsafe { sub_regions.push_raw((*p).child) };
}

static OWNER: Descriptor = Descriptor {
    size: mem::size_of::<Owner>(),
    trace: trace_owner,
    finalizer: Some(finalize_owner),
};

#[test]
fn test_finalizer_releases_sub_region_on_sweep() {
    let _lock = heap_lock();
    let parent = create_fresh_region(RegionType::Trace, &NODE);
    let child = create_fresh_region(RegionType::Rc, &NODE);
    {
        let _rr = UsingRegion::new(child);
        let a = allocate(&NODE);
        set_f1(child, a.as_raw());
    }
    drain_gc();
    {
        let _rr = UsingRegion::new(parent);
        let owner = allocate(&OWNER);
        unsafe { (*owner.payload::<Owner>()).child = child.as_raw() };
        // owner is unreachable from the entry: the sweep finalizes it and
        // the child region goes with it
        region_collect();
        assert_eq!(debug_size(), 1);
    }
    region_release(parent);
    drain_gc();
    heap::debug_check_empty();
}

#[test]
fn test_finalizer_releases_sub_region_on_release() {
    let _lock = heap_lock();
    let parent = create_fresh_region(RegionType::Trace, &NODE);
    let child = create_fresh_region(RegionType::Arena, &NODE);
    {
        let _rr = UsingRegion::new(child);
        for _ in 0..100 {
            allocate(&NODE);
        }
    }
    drain_gc();
    {
        let _rr = UsingRegion::new(parent);
        let owner = allocate(&OWNER);
        unsafe { (*owner.payload::<Owner>()).child = child.as_raw() };
        set_f1(parent, owner.as_raw());
    }
    region_release(parent);
    drain_gc();
    heap::debug_check_empty();
}
