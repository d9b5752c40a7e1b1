//! Property-based tests for the reference-counted collector.
//!
//! Random object graphs are built inside an Rc region with counts matching
//! the stored references, every harness reference is then dropped, and the
//! collector runs. Whatever the shape of the graph, objects reachable from
//! the entry point must survive and everything else must be gone.
mod common;

use common::{drain_gc, heap_lock, set_f1, set_f2, NODE};
use proptest::prelude::*;
use region_rt::api::{
    allocate, create_fresh_region, debug_size, decref, incref, region_collect, region_release,
};
use region_rt::{RegionType, UsingRegion};
use region_utils::heap;
use std::collections::HashSet;

/// Edge list: (from-node, to-node, which field). Indices are taken modulo
/// the node count; only the first edge per (node, field) slot sticks.
fn graph_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize, bool)>, Vec<usize>)> {
    (2usize..10).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec((0..n, 0..n, any::<bool>()), 0..24),
            prop::collection::vec(0..n, 0..3),
        )
    })
}

fn reachable(n: usize, adj: &[[Option<usize>; 2]], entry_adj: &[Option<usize>; 2]) -> usize {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = entry_adj.iter().flatten().copied().collect();
    while let Some(i) = stack.pop() {
        if !seen.insert(i) {
            continue;
        }
        for target in adj[i].iter().flatten() {
            if !seen.contains(target) {
                stack.push(*target);
            }
        }
    }
    debug_assert!(seen.len() <= n);
    seen.len()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reachable_objects_survive_collection((n, edges, entry_edges) in graph_strategy()) {
        let _lock = heap_lock();
        let entry = create_fresh_region(RegionType::Rc, &NODE);
        {
            let _rr = UsingRegion::new(entry);
            let nodes: Vec<_> = (0..n).map(|_| allocate(&NODE)).collect();

            // mirror of the stored edges, one slot per field
            let mut adj = vec![[None::<usize>; 2]; n];
            let mut entry_adj = [None::<usize>; 2];

            for (from, to, second_field) in edges {
                let slot = usize::from(second_field);
                if adj[from][slot].is_some() {
                    continue;
                }
                adj[from][slot] = Some(to);
                incref(nodes[to]);
                if slot == 0 {
                    set_f1(nodes[from], nodes[to].as_raw());
                } else {
                    set_f2(nodes[from], nodes[to].as_raw());
                }
            }
            for (slot, &to) in entry_edges.iter().take(2).enumerate() {
                entry_adj[slot] = Some(to);
                incref(nodes[to]);
                if slot == 0 {
                    set_f1(entry, nodes[to].as_raw());
                } else {
                    set_f2(entry, nodes[to].as_raw());
                }
            }

            // drop every harness reference; anything that survives now does
            // so on stored references alone
            for &node in &nodes {
                decref(node);
            }

            region_collect();
            let live = reachable(n, &adj, &entry_adj);
            prop_assert_eq!(debug_size(), live + 1);

            // collection is idempotent on the live set
            region_collect();
            prop_assert_eq!(debug_size(), live + 1);
        }
        region_release(entry);
        drain_gc();
        heap::debug_check_empty();
    }
}
