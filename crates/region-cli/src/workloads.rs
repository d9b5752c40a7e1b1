//! The benchmark workloads: each one builds, churns and releases regions,
//! producing GC events for the measurement harness to collect.
use crate::error::WorkloadError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use region_rt::api::{
    allocate, create_fresh_region, debug_size, decref, incref, region_collect, region_release,
};
use region_rt::object::Object;
use region_rt::{Descriptor, ObjectPtr, ObjectStack, RegionType, UsingRegion};
use std::collections::HashSet;
use std::mem;
use std::ptr;

/// Grid node linked in four directions.
#[repr(C)]
struct GridNode {
    down: *mut Object,
    right: *mut Object,
    up: *mut Object,
    left: *mut Object,
}

fn trace_grid_node(o: ObjectPtr, st: &mut ObjectStack) {
    let n = o.payload::<GridNode>();
    unsafe {
        st.push_raw((*n).down);
        st.push_raw((*n).right);
        st.push_raw((*n).up);
        st.push_raw((*n).left);
    }
}

static GRID_NODE: Descriptor = Descriptor {
    size: mem::size_of::<GridNode>(),
    trace: trace_grid_node,
    finalizer: None,
};

fn grid(o: ObjectPtr) -> &'static mut GridNode {
    unsafe { &mut *o.payload::<GridNode>() }
}

/// Walkers roam a fully-linked grid and destroy the edges they cross; the
/// collector reclaims whatever falls off the root's component.
pub fn grid_walkers(
    grid_size: usize,
    steps: usize,
    walkers: usize,
    seed: u64,
) -> Result<(), WorkloadError> {
    if grid_size < 2 {
        return Err(WorkloadError::InvalidParameter(format!(
            "grid size must be at least 2, got {grid_size}"
        )));
    }
    let root = create_fresh_region(RegionType::Trace, &GRID_NODE);
    {
        let _rr = UsingRegion::new(root);
        let mut cells = vec![root; grid_size * grid_size];
        for (i, cell) in cells.iter_mut().enumerate() {
            if i > 0 {
                *cell = allocate(&GRID_NODE);
            }
        }
        for i in 0..grid_size {
            for j in 0..grid_size - 1 {
                grid(cells[i * grid_size + j]).right = cells[i * grid_size + j + 1].as_raw();
                grid(cells[i * grid_size + j + 1]).left = cells[i * grid_size + j].as_raw();
            }
        }
        for j in 0..grid_size {
            for i in 0..grid_size - 1 {
                grid(cells[i * grid_size + j]).down = cells[(i + 1) * grid_size + j].as_raw();
                grid(cells[(i + 1) * grid_size + j]).up = cells[i * grid_size + j].as_raw();
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut positions: Vec<ObjectPtr> = (0..walkers)
            .map(|_| cells[rng.gen_range(0..cells.len())])
            .collect();

        for _ in 0..steps {
            for walker in positions.iter_mut() {
                let n = grid(*walker);
                let options: Vec<*mut Object> = [n.down, n.right, n.up, n.left]
                    .into_iter()
                    .filter(|p| !p.is_null())
                    .collect();
                if options.is_empty() {
                    *walker = root;
                    continue;
                }
                let choice = options[rng.gen_range(0..options.len())];
                let next = unsafe { ObjectPtr::from_raw(choice) };
                // destroy the edge behind the walker
                kill_links_between(*walker, next);
                *walker = next;
            }

            let reachable = reachable_set(root);
            for walker in positions.iter_mut() {
                if !reachable.contains(walker) {
                    *walker = root;
                }
            }
            region_collect();
            assert_eq!(debug_size(), reachable.len());
        }
    }
    region_release(root);
    Ok(())
}

/// Remove every direct link between two neighbouring grid nodes.
fn kill_links_between(a: ObjectPtr, b: ObjectPtr) {
    let ga = grid(a);
    for slot in [&mut ga.down, &mut ga.right, &mut ga.up, &mut ga.left] {
        if *slot == b.as_raw() {
            *slot = ptr::null_mut();
        }
    }
    let gb = grid(b);
    for slot in [&mut gb.down, &mut gb.right, &mut gb.up, &mut gb.left] {
        if *slot == a.as_raw() {
            *slot = ptr::null_mut();
        }
    }
}

fn reachable_set(root: ObjectPtr) -> HashSet<ObjectPtr> {
    let mut seen = HashSet::new();
    let mut next = vec![root];
    while let Some(cur) = next.pop() {
        if !seen.insert(cur) {
            continue;
        }
        let n = grid(cur);
        for edge in [n.down, n.right, n.up, n.left] {
            if !edge.is_null() {
                let target = unsafe { ObjectPtr::from_raw(edge) };
                if !seen.contains(&target) {
                    next.push(target);
                }
            }
        }
    }
    seen
}

const MAX_BOARD: usize = 32;

/// Simulation root: one traced slot per board position.
#[repr(C)]
struct Board {
    cells: [*mut Object; MAX_BOARD * MAX_BOARD],
}

fn trace_board(o: ObjectPtr, st: &mut ObjectStack) {
    let b = o.payload::<Board>();
    for i in 0..MAX_BOARD * MAX_BOARD {
        unsafe { st.push_raw((*b).cells[i]) };
    }
}

static BOARD: Descriptor = Descriptor {
    size: mem::size_of::<Board>(),
    trace: trace_board,
    finalizer: None,
};

static CELL: Descriptor = Descriptor {
    size: 2 * mem::size_of::<usize>(),
    trace: |_, _| {},
    finalizer: None,
};

/// Game of Life: every generation allocates fresh cells and strands the old
/// ones for the collector.
pub fn game_of_life(size: usize, generations: usize) -> Result<(), WorkloadError> {
    if size < 3 || size > MAX_BOARD {
        return Err(WorkloadError::InvalidParameter(format!(
            "board size must be between 3 and {MAX_BOARD}, got {size}"
        )));
    }
    let board = create_fresh_region(RegionType::Trace, &BOARD);
    {
        let _rr = UsingRegion::new(board);
        let slot = |x: usize, y: usize| y * MAX_BOARD + x;
        let cells = |o: ObjectPtr| unsafe { &mut (*o.payload::<Board>()).cells };

        // R-pentomino seed at the centre
        let cx = size / 2;
        let cy = size / 2;
        for (x, y) in [(cx + 1, cy), (cx + 2, cy), (cx, cy + 1), (cx + 1, cy + 1), (cx + 1, cy + 2)]
        {
            cells(board)[slot(x % size, y % size)] = allocate(&CELL).as_raw();
        }

        for _ in 0..generations {
            let mut next = vec![false; size * size];
            let mut live = 0;
            for y in 0..size {
                for x in 0..size {
                    let mut neighbors = 0;
                    for dy in [size - 1, 0, 1] {
                        for dx in [size - 1, 0, 1] {
                            if dx == 0 && dy == 0 {
                                continue;
                            }
                            if !cells(board)[slot((x + dx) % size, (y + dy) % size)].is_null() {
                                neighbors += 1;
                            }
                        }
                    }
                    let alive = !cells(board)[slot(x, y)].is_null();
                    let lives = if alive {
                        neighbors == 2 || neighbors == 3
                    } else {
                        neighbors == 3
                    };
                    next[y * size + x] = lives;
                    if lives {
                        live += 1;
                    }
                }
            }
            for y in 0..size {
                for x in 0..size {
                    cells(board)[slot(x, y)] = ptr::null_mut();
                }
            }
            for y in 0..size {
                for x in 0..size {
                    if next[y * size + x] {
                        cells(board)[slot(x, y)] = allocate(&CELL).as_raw();
                    }
                }
            }
            region_collect();
            assert_eq!(debug_size(), live + 1);
        }
    }
    region_release(board);
    Ok(())
}

#[repr(C)]
struct RcNode {
    next: *mut Object,
}

static RC_NODE: Descriptor = Descriptor {
    size: mem::size_of::<RcNode>(),
    trace: |o, st| {
        let n = o.payload::<RcNode>();
        unsafe { st.push_raw((*n).next) };
    },
    finalizer: None,
};

/// Build and collect reference-counted cycles over and over.
pub fn cycle_churn(cycle_len: usize, iterations: usize) -> Result<(), WorkloadError> {
    if cycle_len == 0 {
        return Err(WorkloadError::InvalidParameter(
            "cycle length must be positive".into(),
        ));
    }
    let entry = create_fresh_region(RegionType::Rc, &RC_NODE);
    {
        let _rr = UsingRegion::new(entry);
        for _ in 0..iterations {
            let head = allocate(&RC_NODE);
            let mut curr = head;
            for _ in 1..cycle_len {
                let next = allocate(&RC_NODE);
                unsafe { (*curr.payload::<RcNode>()).next = next.as_raw() };
                curr = next;
            }
            unsafe { (*curr.payload::<RcNode>()).next = head.as_raw() };

            incref(head);
            decref(head);
            region_collect();
            assert_eq!(debug_size(), 1);
        }
    }
    region_release(entry);
    Ok(())
}
