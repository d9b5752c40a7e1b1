//! Freezing: switch a trace region to the immortal discipline.
//!
//! Every object reachable from the entry point is marked immutable and the
//! region stops allocating and collecting. A frozen region is read-only and
//! shareable; collectors of other regions treat its objects as boundaries.
//! Release still frees the memory.
use crate::object::{ObjectPtr, ObjectStack};
use crate::region::RegionKind;

pub(crate) fn apply(entry: ObjectPtr) {
    let region = entry.region();
    let mut kind = region.kind().borrow_mut();
    let RegionKind::Trace(state) = &mut *kind else {
        panic!("freeze requires a trace region");
    };
    if state.is_frozen() {
        return;
    }
    let mut stack = ObjectStack::new();
    stack.push(entry);
    while let Some(o) = stack.pop() {
        // sub-region entry points stay mutable; freezing does not cross
        // region boundaries
        if o != entry && o.is_iso() {
            continue;
        }
        if o.immutable() {
            continue;
        }
        o.set_immutable();
        (o.descriptor().trace)(o, &mut stack);
    }
    state.set_frozen();
}
