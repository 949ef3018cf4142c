mod util;
use util::*;

use amgdd_compgrid::comp_grid::{CompGrid, IncomingNode, MatrixRow, NodeHandle};
use amgdd_compgrid::debug_invariants::DebugInvariants;
use amgdd_compgrid::hierarchy::RowPartition;
use amgdd_compgrid::setup::RequestList;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

const OWNED: i64 = 10;

fn owned_grid() -> CompGrid {
    let part = RowPartition::from_starts(vec![0, 20, 30], 60).unwrap();
    CompGrid::from_level(0, &chain_level(&part, 1)).unwrap()
}

fn incoming(globals: &BTreeSet<i64>) -> Vec<IncomingNode> {
    globals
        .iter()
        .map(|&g| IncomingNode {
            global: g,
            residual: residual_of(g),
            ghost: false,
            coarse_global: -1,
            a_row: MatrixRow::new(vec![2.0], vec![g]),
            p_row: None,
        })
        .collect()
}

proptest! {
    #[test]
    fn merged_batches_keep_a_sorted_suffix_and_stable_handles(
        batches in prop::collection::vec(prop::collection::btree_set(0i64..60, 0..12), 1..6)
    ) {
        let mut grid = owned_grid();
        prop_assert_eq!(grid.num_owned_nodes() as i64, OWNED);
        let mut seen: HashMap<i64, NodeHandle> = HashMap::new();
        for batch in &batches {
            let out = grid.merge_incoming(incoming(batch)).unwrap();
            prop_assert_eq!(out.dest.len(), batch.len());
            for (&g, dest) in batch.iter().zip(&out.dest) {
                if let Some(h) = dest {
                    prop_assert!(!grid.is_owned_global(g));
                    prop_assert!(seen.insert(g, *h).is_none());
                }
            }
            grid.validate_invariants().unwrap();
            for (&g, &h) in &seen {
                prop_assert_eq!(grid.find_global(g), Some(h));
                prop_assert_eq!(grid.global_of(h), g);
            }
        }
        let suffix: Vec<i64> = grid.non_owned().iter().map(|&h| grid.global_of(h)).collect();
        prop_assert!(suffix.windows(2).all(|w| w[0] < w[1]));
        let expected: BTreeSet<i64> = batches
            .iter()
            .flatten()
            .copied()
            .filter(|g| !grid.is_owned_global(*g))
            .collect();
        prop_assert_eq!(suffix, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn ghost_markers_are_never_downgraded(
        batches in prop::collection::vec(prop::collection::btree_map(30i64..60, any::<bool>(), 0..10), 1..6)
    ) {
        let hier = two_level_chain(&RowPartition::from_starts(vec![0, 20, 30], 60).unwrap(), 1);
        let mut grid = CompGrid::from_level(0, &hier.levels[0]).unwrap();
        let mut real: HashMap<i64, bool> = HashMap::new();
        for batch in &batches {
            let nodes = batch
                .iter()
                .map(|(&g, &ghost)| IncomingNode {
                    global: g,
                    residual: residual_of(g),
                    ghost,
                    coarse_global: -1,
                    a_row: MatrixRow::new(vec![2.0], vec![g]),
                    p_row: Some(MatrixRow::new(Vec::new(), Vec::new())),
                })
                .collect();
            grid.merge_incoming(nodes).unwrap();
            for (&g, &ghost) in batch {
                *real.entry(g).or_insert(false) |= !ghost;
            }
            for (&g, &is_real) in &real {
                let h = grid.find_global(g).unwrap();
                prop_assert_eq!(grid.is_ghost(h), !is_real);
            }
        }
    }

    #[test]
    fn request_list_keeps_the_largest_distance(
        inserts in prop::collection::vec((0i64..20, 0usize..5), 0..40)
    ) {
        let mut req = RequestList::new();
        let mut best: HashMap<i64, usize> = HashMap::new();
        for &(g, d) in &inserts {
            req.insert(g, d);
            let e = best.entry(g).or_insert(d);
            *e = (*e).max(d);
        }
        prop_assert_eq!(req.len(), best.len());
        for (&g, &d) in &best {
            prop_assert_eq!(req.get(g), Some(d));
        }
    }
}

#[test]
fn out_of_order_batch_leaves_the_grid_untouched() {
    let mut grid = owned_grid();
    let mut nodes = incoming(&BTreeSet::from([30, 31]));
    nodes.swap(0, 1);
    assert!(grid.merge_incoming(nodes).is_err());
    assert_eq!(grid.num_nodes(), grid.num_owned_nodes());
}
