//! External references: stable, validated handles to interior objects,
//! usable from outside the owning region.
//!
//! Handle storage is owned by the per-region table and lives until the
//! region is physically released; collectors flip the validity bit when they
//! free a handle's target, so a stale handle answers `is_in` with `false`
//! instead of dangling.
use crate::object::ObjectPtr;
use crate::region::RegionPtr;
use region_utils::heap;
use std::alloc::Layout;
use std::ptr::NonNull;

/// A stable handle to an object inside a region.
pub struct ExternalRef {
    region: *mut crate::region::Region,
    target: ObjectPtr,
    valid: bool,
}

impl ExternalRef {
    /// True when `region` is the region this handle was created in (or merged
    /// into) and the target has not been freed.
    pub fn is_in(&self, region: RegionPtr) -> bool {
        self.valid && self.region == region.as_raw()
    }

    /// The referenced object. Calling this on an invalid handle is undefined.
    pub fn get(&self) -> ObjectPtr {
        debug_assert!(self.valid, "used a stale external reference");
        self.target
    }
}

/// Copyable, erased handle returned to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRefHandle(NonNull<ExternalRef>);

impl ExternalRefHandle {
    /// # Safety
    ///
    /// The handle's region must not have been physically released: the
    /// storage behind a handle is freed together with its region.
    pub unsafe fn get(self) -> &'static ExternalRef {
        unsafe { &*self.0.as_ptr() }
    }
}

/// Per-region table of handles. Owns the handle storage.
#[derive(Default)]
pub struct ExternalRefTable {
    handles: Vec<NonNull<ExternalRef>>,
}

impl ExternalRefTable {
    /// Create a handle for `target` inside `region`.
    pub(crate) fn create(&mut self, region: RegionPtr, target: ObjectPtr) -> ExternalRefHandle {
        let raw = heap::alloc(Layout::new::<ExternalRef>()).cast::<ExternalRef>();
        unsafe {
            raw.as_ptr().write(ExternalRef {
                region: region.as_raw(),
                target,
                valid: true,
            });
        }
        self.handles.push(raw);
        ExternalRefHandle(raw)
    }

    /// Invalidate every handle whose target is `o`. Called by the collectors
    /// just before `o` is freed.
    pub(crate) fn invalidate_target(&mut self, o: ObjectPtr) {
        for h in &self.handles {
            let r = unsafe { &mut *h.as_ptr() };
            if r.target == o {
                r.valid = false;
            }
        }
    }

    /// Point every handle at `region`; used when this table's region is
    /// merged into another.
    pub(crate) fn rehome(&mut self, region: RegionPtr) {
        for h in &self.handles {
            unsafe { (*h.as_ptr()).region = region.as_raw() };
        }
    }

    /// Move all handles out of `other` into this table.
    pub(crate) fn absorb(&mut self, other: &mut ExternalRefTable) {
        self.handles.append(&mut other.handles);
    }

    /// Invalidate everything and free the handle storage. Called during
    /// physical release of the region.
    pub(crate) fn dealloc(&mut self) {
        for h in self.handles.drain(..) {
            unsafe { heap::free(h.cast::<u8>(), Layout::new::<ExternalRef>()) };
        }
    }
}
