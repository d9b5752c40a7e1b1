//! Arena regions: bump-pointer slab allocation, trivial collection.
//!
//! Objects are bumped into fixed-size slabs kept on an intrusive list; an
//! object larger than a slab gets a dedicated slab of its own. Collection is
//! a no-op and release returns every slab to the underlying allocator in a
//! single pass. Arenas never run finalizers.
use crate::object::{self, Descriptor, Object, ObjectPtr};
use crate::region::{Region, RegionKind, RegionPtr};
use region_utils::{align_up, heap};
use std::alloc::Layout;
use std::mem;
use std::ptr;

/// Total allocation size of a standard slab, header included.
const SLAB_BYTES: usize = 64 * 1024;

#[repr(C)]
struct Slab {
    next: *mut Slab,
    /// Bytes of object storage this slab holds.
    capacity: usize,
    /// Bump offset into the storage area.
    top: usize,
}

impl Slab {
    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(
            mem::size_of::<Slab>() + capacity,
            mem::align_of::<Object>(),
        )
        .expect("slab layout overflow")
    }

    fn data(slab: *mut Slab) -> *mut u8 {
        unsafe { (slab as *mut u8).add(mem::size_of::<Slab>()) }
    }
}

pub struct ArenaRegion {
    /// Head of the slab list; also the slab currently being bumped.
    slabs: *mut Slab,
    object_count: usize,
    bytes_used: usize,
    high_water: usize,
}

impl ArenaRegion {
    fn new() -> Self {
        Self {
            slabs: ptr::null_mut(),
            object_count: 0,
            bytes_used: 0,
            high_water: 0,
        }
    }

    /// Create a fresh arena region; returns its entry point.
    pub(crate) fn create(descriptor: &'static Descriptor) -> ObjectPtr {
        let region = Region::create(RegionKind::Arena(ArenaRegion::new()));
        let entry = match &mut *region.kind().borrow_mut() {
            RegionKind::Arena(arena) => arena.alloc(descriptor),
            _ => unreachable!(),
        };
        entry.set_region(region);
        entry
    }

    /// Bump-allocate a zeroed object. Never invalidates prior pointers.
    pub(crate) fn alloc(&mut self, descriptor: &'static Descriptor) -> ObjectPtr {
        let need = align_up(
            Object::layout_for(descriptor).size(),
            mem::align_of::<Object>(),
        );
        if self.slabs.is_null() || unsafe { (*self.slabs).top + need > (*self.slabs).capacity } {
            self.push_slab(need);
        }
        let slab = self.slabs;
        let raw = unsafe {
            let raw = Slab::data(slab).add((*slab).top) as *mut Object;
            (*slab).top += need;
            raw
        };
        self.object_count += 1;
        self.bytes_used += need;
        if self.bytes_used > self.high_water {
            self.high_water = self.bytes_used;
        }
        unsafe { object::init_object(raw, descriptor) }
    }

    fn push_slab(&mut self, min_capacity: usize) {
        let capacity = min_capacity.max(SLAB_BYTES - mem::size_of::<Slab>());
        let slab = heap::alloc(Slab::layout(capacity)).cast::<Slab>().as_ptr();
        unsafe {
            ptr::write(
                slab,
                Slab {
                    next: self.slabs,
                    capacity,
                    top: 0,
                },
            );
        }
        self.slabs = slab;
    }

    /// Visit every object in the region, the entry point included.
    pub fn for_each(&self, mut f: impl FnMut(ObjectPtr)) {
        let mut slab = self.slabs;
        while !slab.is_null() {
            let mut offset = 0;
            while offset < unsafe { (*slab).top } {
                let raw = unsafe { Slab::data(slab).add(offset) as *mut Object };
                let o = unsafe { ObjectPtr::from_raw(raw) };
                f(o);
                offset += align_up(o.alloc_size(), mem::align_of::<Object>());
            }
            slab = unsafe { (*slab).next };
        }
    }

    /// Return every slab to the underlying allocator. Destructive: all
    /// pointers into the region become invalid.
    pub(crate) fn release(&mut self) {
        let mut slab = self.slabs;
        while !slab.is_null() {
            let next = unsafe { (*slab).next };
            let capacity = unsafe { (*slab).capacity };
            unsafe {
                heap::free(
                    ptr::NonNull::new_unchecked(slab as *mut u8),
                    Slab::layout(capacity),
                )
            };
            slab = next;
        }
        self.slabs = ptr::null_mut();
        self.object_count = 0;
        self.bytes_used = 0;
    }

    /// Splice the slabs of `src` into this arena; `src` is left empty.
    ///
    /// The current bump slab stays in place so allocation continues to fill
    /// it; the spliced slabs are linked in behind it.
    pub(crate) fn merge(&mut self, src: &mut ArenaRegion) {
        if self.slabs.is_null() {
            self.slabs = src.slabs;
        } else if !src.slabs.is_null() {
            unsafe {
                let mut tail = src.slabs;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = (*self.slabs).next;
                (*self.slabs).next = src.slabs;
            }
        }
        src.slabs = ptr::null_mut();
        self.object_count += src.object_count;
        self.bytes_used += src.bytes_used;
        src.object_count = 0;
        src.bytes_used = 0;
        if self.bytes_used > self.high_water {
            self.high_water = self.bytes_used;
        }
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    pub fn memory_used(&self) -> usize {
        self.bytes_used
    }

    /// Peak bytes of object storage this arena has held.
    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

/// Demote the entry point of `src_region` to an ordinary arena object and
/// splice the whole region into `dst`.
pub(crate) fn merge_regions(dst: RegionPtr, src_entry: ObjectPtr) {
    let src_region = src_entry.region();
    src_entry.clear_iso(ptr::null_mut());
    {
        let mut dst_kind = dst.kind().borrow_mut();
        let mut src_kind = src_region.kind().borrow_mut();
        match (&mut *dst_kind, &mut *src_kind) {
            (RegionKind::Arena(d), RegionKind::Arena(s)) => d.merge(s),
            _ => unreachable!("merge_regions called with non-arena regions"),
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

#[cfg(test)]
mod tests {
    use super::*;

    static SMALL: Descriptor = Descriptor {
        size: 24,
        trace: |_, _| {},
        finalizer: None,
    };

    static HUGE: Descriptor = Descriptor {
        size: 2 * SLAB_BYTES,
        trace: |_, _| {},
        finalizer: None,
    };

    fn with_arena(f: impl FnOnce(&mut ArenaRegion)) {
        let mut arena = ArenaRegion::new();
        f(&mut arena);
        arena.release();
    }

    #[test]
    fn test_bump_allocation_is_contiguous() {
        with_arena(|arena| {
            let a = arena.alloc(&SMALL);
            let b = arena.alloc(&SMALL);
            let stride = align_up(a.alloc_size(), mem::align_of::<Object>());
            assert_eq!(b.as_raw() as usize, a.as_raw() as usize + stride);
        });
    }

    #[test]
    fn test_slab_overflow_appends_slab() {
        with_arena(|arena| {
            let per_slab = (SLAB_BYTES - mem::size_of::<Slab>())
                / align_up(Object::layout_for(&SMALL).size(), mem::align_of::<Object>());
            for _ in 0..per_slab + 3 {
                arena.alloc(&SMALL);
            }
            let mut seen = 0;
            arena.for_each(|_| seen += 1);
            assert_eq!(seen, per_slab + 3);
            assert_eq!(arena.object_count(), per_slab + 3);
        });
    }

    #[test]
    fn test_oversized_object_gets_own_slab() {
        with_arena(|arena| {
            arena.alloc(&SMALL);
            let big = arena.alloc(&HUGE);
            let payload = big.payload::<u8>();
            assert_eq!(unsafe { *payload }, 0);
            let mut seen = 0;
            arena.for_each(|_| seen += 1);
            assert_eq!(seen, 2);
        });
    }

    #[test]
    fn test_release_empties_the_arena() {
        let mut arena = ArenaRegion::new();
        for _ in 0..100 {
            arena.alloc(&SMALL);
        }
        arena.release();
        assert_eq!(arena.object_count(), 0);
        assert_eq!(arena.memory_used(), 0);
        let mut seen = 0;
        arena.for_each(|_| seen += 1);
        assert_eq!(seen, 0);
        // the arena is reusable after release
        arena.alloc(&SMALL);
        assert_eq!(arena.object_count(), 1);
        arena.release();
    }

    #[test]
    fn test_merge_keeps_all_objects() {
        with_arena(|dst| {
            let mut src = ArenaRegion::new();
            for _ in 0..10 {
                dst.alloc(&SMALL);
            }
            for _ in 0..7 {
                src.alloc(&SMALL);
            }
            dst.merge(&mut src);
            assert_eq!(dst.object_count(), 17);
            let mut seen = 0;
            dst.for_each(|_| seen += 1);
            assert_eq!(seen, 17);
            // dst continues to bump into its current slab
            dst.alloc(&SMALL);
            assert_eq!(dst.object_count(), 18);
        });
    }
}
