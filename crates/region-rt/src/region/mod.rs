//! Region metadata and the three collector disciplines.
//!
//! A [`Region`] is the per-region metadata block reached through the entry
//! point's back-pointer: the shared [`RegionBase`] (concurrent state machine,
//! task refcount, external reference table, remembered set) plus the
//! discipline-specific [`RegionKind`]. Dispatch over the discipline is by
//! tag, from the API layer; no virtual dispatch is involved.
use crate::object::ObjectPtr;
use region_utils::heap;
use region_utils::sync::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use serde::Serialize;
use std::alloc::Layout;
use std::cell::RefCell;
use std::fmt;
use std::ptr::{self, NonNull};

pub mod arena;
pub mod external;
pub mod freeze;
pub mod rc;
pub mod remembered;
pub mod trace;

pub use arena::ArenaRegion;
pub use external::{ExternalRef, ExternalRefTable};
pub use rc::RcRegion;
pub use remembered::RememberedSet;
pub use trace::TraceRegion;

/// The allocation/collection discipline of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegionType {
    Trace,
    Arena,
    Rc,
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RegionType::Trace => "Trace",
            RegionType::Arena => "Arena",
            RegionType::Rc => "Rc",
        })
    }
}

/// Concurrent state of a region. At any instant a region has at most one
/// active accessor: a mutator that opened it, or a GC task collecting it.
pub(crate) mod state {
    pub const CLOSED: u8 = 0;
    pub const OPEN: u8 = 1;
    pub const COLLECTING: u8 = 2;
}

/// State shared by all region disciplines.
///
/// The three atomics are the only cross-thread mutable state in the engine;
/// everything else in the region is touched only by whichever thread
/// currently holds the region open.
pub struct RegionBase {
    /// One of [`state::CLOSED`], [`state::OPEN`], [`state::COLLECTING`].
    pub(crate) state: AtomicU8,
    /// Task refcount. Initialised to 1 for the logical owner; each scheduled
    /// GC task holds one more. Physical release happens exactly once, when
    /// this falls to zero after the region died.
    pub(crate) owners: AtomicUsize,
    /// Cleared by `region_release`; a GC task observing `false` aborts.
    pub(crate) is_alive: AtomicBool,
    /// At most one in-flight GC task per region.
    pub(crate) gc_pending: AtomicBool,
    pub(crate) external_refs: RefCell<ExternalRefTable>,
    pub(crate) remembered: RefCell<RememberedSet>,
}

impl RegionBase {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(state::CLOSED),
            owners: AtomicUsize::new(1),
            is_alive: AtomicBool::new(true),
            gc_pending: AtomicBool::new(false),
            external_refs: RefCell::new(ExternalRefTable::default()),
            remembered: RefCell::new(RememberedSet::default()),
        }
    }

    pub(crate) fn task_inc(&self) {
        self.owners.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one task reference; true if this was the last one and the caller
    /// must physically release the region.
    pub(crate) fn task_dec(&self) -> bool {
        self.owners.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Discipline-specific region state.
pub enum RegionKind {
    Arena(ArenaRegion),
    Trace(TraceRegion),
    Rc(RcRegion),
}

/// Per-region metadata block.
pub struct Region {
    pub(crate) base: RegionBase,
    pub(crate) kind: RefCell<RegionKind>,
}

impl Region {
    /// Allocate a fresh region metadata block on the underlying heap.
    pub(crate) fn create(kind: RegionKind) -> RegionPtr {
        let raw = heap::alloc(Layout::new::<Region>()).cast::<Region>();
        unsafe {
            ptr::write(
                raw.as_ptr(),
                Region {
                    base: RegionBase::new(),
                    kind: RefCell::new(kind),
                },
            );
            RegionPtr(raw)
        }
    }

    /// Free the metadata block. The region's objects must already be gone.
    ///
    /// # Safety
    ///
    /// `r` must not be used afterwards, by this thread or any other.
    pub(crate) unsafe fn destroy(r: RegionPtr) {
        unsafe {
            ptr::drop_in_place(r.0.as_ptr());
            heap::free(r.0.cast::<u8>(), Layout::new::<Region>());
        }
    }
}

/// Non-null pointer to live region metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPtr(NonNull<Region>);

impl RegionPtr {
    /// # Safety
    ///
    /// `raw` must point to a live region created by [`Region::create`].
    pub(crate) unsafe fn from_raw(raw: *mut Region) -> Self {
        debug_assert!(!raw.is_null());
        Self(unsafe { NonNull::new_unchecked(raw) })
    }

    pub fn as_raw(self) -> *mut Region {
        self.0.as_ptr()
    }

    pub(crate) fn base<'a>(self) -> &'a RegionBase {
        unsafe { &(*self.0.as_ptr()).base }
    }

    pub(crate) fn kind<'a>(self) -> &'a RefCell<RegionKind> {
        unsafe { &(*self.0.as_ptr()).kind }
    }

    pub fn region_type(self) -> RegionType {
        match &*self.kind().borrow() {
            RegionKind::Arena(_) => RegionType::Arena,
            RegionKind::Trace(_) => RegionType::Trace,
            RegionKind::Rc(_) => RegionType::Rc,
        }
    }

    /// Number of objects in the region, entry point included.
    pub(crate) fn object_count(self) -> usize {
        match &*self.kind().borrow() {
            RegionKind::Arena(a) => a.object_count(),
            RegionKind::Trace(t) => t.object_count(),
            RegionKind::Rc(r) => r.object_count(),
        }
    }

    /// Bytes of object storage the region currently holds.
    pub(crate) fn memory_used(self) -> usize {
        match &*self.kind().borrow() {
            RegionKind::Arena(a) => a.memory_used(),
            RegionKind::Trace(t) => t.memory_used(),
            RegionKind::Rc(r) => r.memory_used(),
        }
    }
}

/// Retire the metadata block of a merged-away region.
///
/// Used by the merge paths once every object has been rehomed. The source
/// region must be closed, have no scheduled GC tasks, and still be alive.
pub(crate) fn retire_merged_region(src: RegionPtr) {
    let base = src.base();
    assert_eq!(
        base.state.load(Ordering::Acquire),
        state::CLOSED,
        "cannot merge a region that is open or collecting"
    );
    assert_eq!(
        base.owners.load(Ordering::Acquire),
        1,
        "cannot merge a region with scheduled GC tasks"
    );
    unsafe { Region::destroy(src) };
}

/// Entry points of sub-regions collected during a sweep or release, waiting
/// to be released themselves.
pub(crate) type SubRegionWorklist = crate::object::ObjectStack;

/// Shorthand used by the collectors: does this edge target stay inside the
/// current region's object graph? Entry points of other regions and frozen
/// (immutable) objects are boundaries the collectors never cross.
pub(crate) fn interior_edge(o: ObjectPtr) -> bool {
    !o.is_iso() && !o.immutable()
}
