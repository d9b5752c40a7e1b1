//! The underlying allocator for the region engine.
//!
//! All memory that makes up regions (object storage, arena slabs, region
//! metadata, external reference handles) is obtained here rather than from
//! `Box`/`Vec` so that an outstanding-allocation ledger can account for every
//! byte the engine holds. [`debug_check_empty`] asserts the ledger is empty
//! and is the backbone of the leak checks in the integration tests.
//!
//! The ledger is process-global: tests asserting emptiness must serialize
//! against other heap-touching tests in the same process.
use crate::sync::{AtomicUsize, Ordering};
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use thiserror::Error;

static OUTSTANDING_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static OUTSTANDING_BYTES: AtomicUsize = AtomicUsize::new(0);

/// The allocator ran out of memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("heap allocation of {size} bytes failed")]
pub struct AllocError {
    pub size: usize,
}

/// Fallible allocation. The returned memory is uninitialized.
pub fn try_alloc(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(layout.size() > 0);
    // SAFETY: layout has non-zero size.
    let raw = unsafe { alloc::alloc(layout) };
    match NonNull::new(raw) {
        Some(p) => {
            OUTSTANDING_ALLOCS.fetch_add(1, Ordering::Relaxed);
            OUTSTANDING_BYTES.fetch_add(layout.size(), Ordering::Relaxed);
            Ok(p)
        }
        None => Err(AllocError {
            size: layout.size(),
        }),
    }
}

/// Infallible allocation; treats out-of-memory as fatal.
pub fn alloc(layout: Layout) -> NonNull<u8> {
    match try_alloc(layout) {
        Ok(p) => p,
        Err(_) => alloc::handle_alloc_error(layout),
    }
}

/// Return memory obtained from [`alloc`]/[`try_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by this module with the same `layout`, and
/// must not be used afterwards.
pub unsafe fn free(ptr: NonNull<u8>, layout: Layout) {
    OUTSTANDING_ALLOCS.fetch_sub(1, Ordering::Relaxed);
    OUTSTANDING_BYTES.fetch_sub(layout.size(), Ordering::Relaxed);
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
}

/// Number of live allocations made through this module.
pub fn outstanding_allocations() -> usize {
    OUTSTANDING_ALLOCS.load(Ordering::Relaxed)
}

/// Number of live bytes held through this module.
pub fn outstanding_bytes() -> usize {
    OUTSTANDING_BYTES.load(Ordering::Relaxed)
}

/// Assert that every allocation has been returned.
///
/// For testing and debugging purposes only.
pub fn debug_check_empty() {
    let allocs = OUTSTANDING_ALLOCS.load(Ordering::Relaxed);
    let bytes = OUTSTANDING_BYTES.load(Ordering::Relaxed);
    assert!(
        allocs == 0 && bytes == 0,
        "heap is not empty: {} allocations ({} bytes) outstanding",
        allocs,
        bytes
    );
}
