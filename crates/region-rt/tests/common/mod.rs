//! Shared fixtures for the region runtime integration tests.
#![allow(dead_code)]
use region_rt::object::Object;
use region_rt::{Descriptor, ObjectPtr, ObjectStack};
use std::mem;
use std::sync::{Mutex, MutexGuard};

/// The allocation ledger is process-global, so tests that assert
/// `heap::debug_check_empty()` serialize on this lock.
static HEAP_LOCK: Mutex<()> = Mutex::new(());

pub fn heap_lock() -> MutexGuard<'static, ()> {
    HEAP_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wait for background GC tasks to finish.
pub fn drain_gc() {
    #[cfg(feature = "concurrent-gc")]
    region_rt::sched::wait_idle();
}

/// A test object with two traced pointer fields.
#[repr(C)]
pub struct Node {
    pub f1: *mut Object,
    pub f2: *mut Object,
}

fn trace_node(o: ObjectPtr, st: &mut ObjectStack) {
    let n = o.payload::<Node>();
    unsafe {
        st.push_raw((*n).f1);
        st.push_raw((*n).f2);
    }
}

pub static NODE: Descriptor = Descriptor {
    size: mem::size_of::<Node>(),
    trace: trace_node,
    finalizer: None,
};

pub fn set_f1(o: ObjectPtr, target: *mut Object) {
    unsafe { (*o.payload::<Node>()).f1 = target };
}

pub fn set_f2(o: ObjectPtr, target: *mut Object) {
    unsafe { (*o.payload::<Node>()).f2 = target };
}

pub fn f1(o: ObjectPtr) -> *mut Object {
    unsafe { (*o.payload::<Node>()).f1 }
}

pub fn f2(o: ObjectPtr) -> *mut Object {
    unsafe { (*o.payload::<Node>()).f2 }
}
