//! The public region API and the concurrency controller.
//!
//! All operations act on the region at the top of the calling thread's
//! region stack: [`open_region`] pushes a frame, [`close_region`] pops it,
//! and everything in between ([`allocate`], [`incref`]/[`decref`],
//! [`region_collect`], ...) addresses the top frame.
//!
//! ## The region state machine
//!
//! Each region's `state` atomic moves between `Closed`, `Open` and
//! `Collecting` using only these compare-and-swap transitions:
//!
//! | From       | To         | Who                    |
//! |------------|------------|------------------------|
//! | Closed     | Open       | mutator (spins while busy) |
//! | Open       | Closed     | mutator (must succeed) |
//! | Closed     | Collecting | GC task (aborts on failure, no re-queue) |
//! | Collecting | Closed     | GC task (must succeed) |
//!
//! Closing a region after work schedules a background GC task, at most one
//! in flight per region. A task that finds the region busy or dead aborts;
//! the next close schedules a fresh one. `region_release` and the GC tasks
//! share the `owners` refcount so that whichever of them drops the last
//! reference physically frees the region, exactly once.
use crate::object::{Descriptor, ObjectPtr, ObjectStack};
use crate::region::state::{CLOSED, COLLECTING, OPEN};
use crate::region::{
    arena::ArenaRegion, external::ExternalRefHandle, freeze as freeze_impl, rc, trace,
    RegionKind, RegionPtr, RegionType, SubRegionWorklist,
};
use region_utils::sync::Ordering;
use std::cell::RefCell;
use std::mem;
use std::time::Instant;
use tracing::debug;

/// GC measurement callback: `(duration_ns, region_type, bytes_before,
/// objects_before)`.
pub type GcCallback = Box<dyn FnMut(u64, RegionType, usize, usize)>;

struct RegionFrame {
    entry: ObjectPtr,
    region: RegionPtr,
}

#[derive(Default)]
struct RegionContext {
    frames: Vec<RegionFrame>,
    gc_callback: Option<GcCallback>,
}

thread_local! {
    static CONTEXT: RefCell<RegionContext> = RefCell::new(RegionContext::default());
}

fn current_frame() -> (ObjectPtr, RegionPtr) {
    CONTEXT.with(|c| {
        let ctx = c.borrow();
        let frame = ctx
            .frames
            .last()
            .expect("no region is open on this thread");
        (frame.entry, frame.region)
    })
}

/// Install a GC measurement callback for this thread, returning the previous
/// one. `None` restores the default `tracing` logging.
pub fn set_gc_callback(callback: Option<GcCallback>) -> Option<GcCallback> {
    CONTEXT.with(|c| mem::replace(&mut c.borrow_mut().gc_callback, callback))
}

fn report_gc(duration_ns: u64, region_type: RegionType, bytes_before: usize, objects_before: usize) {
    // take the callback out so it may itself call back into the API
    let callback = CONTEXT.with(|c| c.borrow_mut().gc_callback.take());
    match callback {
        Some(mut callback) => {
            callback(duration_ns, region_type, bytes_before, objects_before);
            CONTEXT.with(|c| {
                let mut ctx = c.borrow_mut();
                if ctx.gc_callback.is_none() {
                    ctx.gc_callback = Some(callback);
                }
            });
        }
        None => debug!(
            duration_ns,
            %region_type,
            bytes_before,
            objects_before,
            "gc event"
        ),
    }
}

/// Create a fresh region of the given type; returns its entry point (iso).
pub fn create_fresh_region(region_type: RegionType, descriptor: &'static Descriptor) -> ObjectPtr {
    match region_type {
        RegionType::Trace => trace::TraceRegion::create(descriptor),
        RegionType::Arena => ArenaRegion::create(descriptor),
        RegionType::Rc => rc::RcRegion::create(descriptor),
    }
}

/// Open the region owned by `entry` and push it onto this thread's region
/// stack.
///
/// Opening for work spins until the region is closed, then claims it.
/// Opening for GC is one-shot: if the region is not closed, the call fails
/// and returns `false`.
pub fn open_region(entry: ObjectPtr, for_work: bool) -> bool {
    assert!(entry.is_iso(), "open_region requires a region entry point");
    let region = entry.region();
    let base = region.base();
    if for_work {
        // Closed -> Open; Open and Collecting are two distinct wait states
        // and both simply retry until the region closes.
        while base
            .state
            .compare_exchange_weak(CLOSED, OPEN, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    } else {
        // Closed -> Collecting, one shot
        if base
            .state
            .compare_exchange(CLOSED, COLLECTING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
    }
    CONTEXT.with(|c| c.borrow_mut().frames.push(RegionFrame { entry, region }));
    true
}

/// Close the region on top of this thread's region stack.
///
/// Closing after work schedules a background collection of the region.
pub fn close_region(for_work: bool) {
    let (entry, region) = current_frame();
    let base = region.base();
    if for_work {
        // Open -> Closed
        let closed = base
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::Release, Ordering::Relaxed)
            .is_ok();
        assert!(closed, "close_region: region was not open for work");
        #[cfg(feature = "concurrent-gc")]
        schedule_gc(entry);
        #[cfg(not(feature = "concurrent-gc"))]
        let _ = entry;
    } else {
        // Collecting -> Closed
        let closed = base
            .state
            .compare_exchange(COLLECTING, CLOSED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        assert!(closed, "close_region: region was not collecting");
    }
    CONTEXT.with(|c| {
        c.borrow_mut().frames.pop();
    });
}

/// RAII guard around [`open_region`]/[`close_region`].
pub struct UsingRegion {
    for_work: bool,
    is_open: bool,
}

impl UsingRegion {
    /// Open `entry` for mutator work, spinning until the region is free.
    pub fn new(entry: ObjectPtr) -> Self {
        Self::open(entry, true)
    }

    pub fn open(entry: ObjectPtr, for_work: bool) -> Self {
        Self {
            for_work,
            is_open: open_region(entry, for_work),
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }
}

impl Drop for UsingRegion {
    fn drop(&mut self) {
        if self.is_open {
            close_region(self.for_work);
        }
    }
}

/// Check whether `o` is the entry point of some region other than the one
/// currently open.
pub fn is_region_ref(o: ObjectPtr) -> bool {
    if !o.is_iso() {
        return false;
    }
    let (entry, _) = current_frame();
    entry != o
}

/// Allocate an object in the currently open region.
pub fn allocate(descriptor: &'static Descriptor) -> ObjectPtr {
    let (_, region) = current_frame();
    match &mut *region.kind().borrow_mut() {
        RegionKind::Arena(arena) => arena.alloc(descriptor),
        RegionKind::Trace(trace) => trace.alloc(descriptor),
        RegionKind::Rc(rc) => rc.alloc(descriptor),
    }
}

/// Increment the reference count of `o`. The current region must be Rc.
pub fn incref(o: ObjectPtr) {
    let (_, region) = current_frame();
    assert_eq!(
        region.region_type(),
        RegionType::Rc,
        "incref on a non-Rc region"
    );
    assert!(!o.is_iso(), "refcount operations on a region entry point");
    o.inc_rc();
}

/// Decrement the reference count of `o`, freeing it (and cascading) when the
/// count reaches zero. The current region must be Rc.
pub fn decref(o: ObjectPtr) {
    let (entry, region) = current_frame();
    assert_eq!(
        region.region_type(),
        RegionType::Rc,
        "decref on a non-Rc region"
    );
    assert!(!o.is_iso(), "refcount operations on a region entry point");

    let bytes_before = region.memory_used();
    let objects_before = region.object_count();
    let started = Instant::now();
    let sub_regions = rc::decref(entry, o);
    report_gc(
        started.elapsed().as_nanos() as u64,
        RegionType::Rc,
        bytes_before,
        objects_before,
    );
    release_worklist(sub_regions);
}

/// Run the collector of the currently open region.
pub fn region_collect() {
    let (entry, region) = current_frame();
    let region_type = region.region_type();
    let bytes_before = region.memory_used();
    let objects_before = region.object_count();
    let started = Instant::now();
    let sub_regions = match region_type {
        RegionType::Trace => trace::gc(entry),
        RegionType::Rc => rc::gc_cycles(entry),
        // nothing to collect here
        RegionType::Arena => SubRegionWorklist::default(),
    };
    report_gc(
        started.elapsed().as_nanos() as u64,
        region_type,
        bytes_before,
        objects_before,
    );
    release_worklist(sub_regions);
}

/// End the logical life of the region owned by `entry`. The region is
/// physically freed once the last task reference (this one, or an in-flight
/// GC task) is dropped.
pub fn region_release(entry: ObjectPtr) {
    assert!(entry.is_iso(), "region_release requires a region entry point");
    let mut worklist = ObjectStack::new();
    worklist.push(entry);
    release_worklist(worklist);
}

/// Release every region whose entry point is on the worklist; physical
/// releases may push further sub-regions onto it.
fn release_worklist(mut worklist: SubRegionWorklist) {
    while let Some(iso) = worklist.pop() {
        let region = iso.region();
        let base = region.base();
        debug!(region = ?region.as_raw(), "releasing region");
        base.is_alive.store(false, Ordering::Release);
        if base.task_dec() {
            physical_release(iso, &mut worklist);
        }
    }
}

/// Physically free the region owned by `entry`: all object storage, the
/// external reference handles, the remembered set, and the metadata block.
/// Sub-regions collected by finalizers are pushed onto `worklist`.
fn physical_release(entry: ObjectPtr, worklist: &mut SubRegionWorklist) {
    let region = entry.region();
    let region_type = region.region_type();
    let bytes_before = region.memory_used();
    let objects_before = region.object_count();
    let started = Instant::now();
    {
        match &mut *region.kind().borrow_mut() {
            RegionKind::Arena(arena) => arena.release(),
            RegionKind::Trace(trace) => trace.release(entry, worklist),
            RegionKind::Rc(rc) => rc.release(entry, worklist),
        }
        let base = region.base();
        base.external_refs.borrow_mut().dealloc();
        base.remembered.borrow_mut().sweep();
    }
    unsafe { crate::region::Region::destroy(region) };
    report_gc(
        started.elapsed().as_nanos() as u64,
        region_type,
        bytes_before,
        objects_before,
    );
}

/// Called by a GC worker (or directly from [`region_release`]) when the last
/// task reference of an already-dead region is dropped.
#[cfg(feature = "concurrent-gc")]
fn physical_release_chain(entry: ObjectPtr) {
    let mut worklist = ObjectStack::new();
    physical_release(entry, &mut worklist);
    release_worklist(worklist);
}

/// Splice the region owned by `other_entry` into the currently open region.
/// Both regions must have the same type; Rc regions do not support merging.
pub fn merge(other_entry: ObjectPtr) {
    let (entry, region) = current_frame();
    assert!(other_entry.is_iso(), "merge requires a region entry point");
    assert!(other_entry != entry, "cannot merge a region into itself");
    let src_region = other_entry.region();
    let region_type = region.region_type();
    assert_eq!(
        region_type,
        src_region.region_type(),
        "cannot merge regions of different types"
    );
    match region_type {
        RegionType::Trace => trace::merge_regions(region, other_entry),
        RegionType::Arena => crate::region::arena::merge_regions(region, other_entry),
        RegionType::Rc => panic!("merge is not supported for Rc regions"),
    }
}

/// Freeze the trace region owned by `entry`: mark it immutable and immortal.
pub fn freeze(entry: ObjectPtr) {
    assert!(entry.is_iso(), "freeze requires a region entry point");
    freeze_impl::apply(entry);
}

/// Create a stable handle to `o` in the currently open region.
pub fn create_external_reference(o: ObjectPtr) -> ExternalRefHandle {
    let (_, region) = current_frame();
    region.base().external_refs.borrow_mut().create(region, o)
}

/// Check that `handle` belongs to the currently open region and its target
/// is still allocated.
pub fn is_external_reference_valid(handle: ExternalRefHandle) -> bool {
    let (_, region) = current_frame();
    unsafe { handle.get() }.is_in(region)
}

/// Resolve `handle` to its target. The handle must be valid.
pub fn use_external_reference(handle: ExternalRefHandle) -> ObjectPtr {
    debug_assert!(is_external_reference_valid(handle));
    unsafe { handle.get() }.get()
}

/// Record in the currently open region that it references the child region
/// owned by `child_entry`. The child becomes a GC root of this region until
/// forgotten or the region is released.
pub fn remember_region(child_entry: ObjectPtr) {
    let (_, region) = current_frame();
    assert!(child_entry.is_iso(), "remember_region requires an entry point");
    region.base().remembered.borrow_mut().insert(child_entry);
}

/// Drop a reference recorded with [`remember_region`].
pub fn forget_region(child_entry: ObjectPtr) -> bool {
    let (_, region) = current_frame();
    region.base().remembered.borrow_mut().remove(child_entry)
}

/// Number of objects in the current region, entry point included.
///
/// For testing and debugging purposes only.
pub fn debug_size() -> usize {
    let (_, region) = current_frame();
    region.object_count()
}

/// Bytes of object storage held by the current region.
///
/// For testing and debugging purposes only.
pub fn debug_memory_used() -> usize {
    let (_, region) = current_frame();
    region.memory_used()
}

#[cfg(feature = "concurrent-gc")]
fn schedule_gc(entry: ObjectPtr) {
    let region = entry.region();
    let base = region.base();
    if !base.is_alive.load(Ordering::Acquire) {
        return;
    }
    // at most one in-flight GC task per region
    if base.gc_pending.swap(true, Ordering::AcqRel) {
        return;
    }
    base.task_inc();
    debug!(region = ?region.as_raw(), "scheduling gc task");
    let task = GcTask {
        entry: entry.as_raw(),
    };
    crate::sched::schedule(move || task.run());
}

#[cfg(feature = "concurrent-gc")]
struct GcTask {
    entry: *mut crate::object::Object,
}

// SAFETY: the task only touches the region through the state machine, which
// guarantees exclusive access, and the task's owner reference keeps the
// entry and region alive until it runs.
#[cfg(feature = "concurrent-gc")]
unsafe impl Send for GcTask {}

#[cfg(feature = "concurrent-gc")]
impl GcTask {
    fn run(self) {
        let entry = unsafe { ObjectPtr::from_raw(self.entry) };
        let region = entry.region();
        let base = region.base();
        if base.is_alive.load(Ordering::Acquire) {
            if open_region(entry, false) {
                region_collect();
                close_region(false);
                debug!(region = ?region.as_raw(), "gc task finished");
            } else {
                debug!(region = ?region.as_raw(), "gc task aborted: region busy");
            }
        } else {
            debug!(region = ?region.as_raw(), "gc task aborted: region released");
        }
        base.gc_pending.store(false, Ordering::Release);
        // if the region was released while we ran, the last task out frees it
        if base.task_dec() {
            physical_release_chain(entry);
        }
    }
}
