mod util;
use util::*;

use mesh_forest::prelude::*;

/// Refine every element of tree 0 once; tree 0 lives on the first ranks.
fn refine_tree_zero() -> AdaptFn {
    adapt_fn(|_, tree, _, els| {
        if tree == TreeId::new(0) && els.len() == 1 {
            AdaptDecision::Refine
        } else {
            AdaptDecision::Keep
        }
    })
}

#[test]
fn two_quads_over_four_ranks_split_evenly() {
    let out = run_ranks(4, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Quad, 2);
        let f = partition(comm, &uniform(comm, &cmesh, 3), false);
        f.validate_global_order(comm).unwrap();
        (f.num_local_elements(), f.element_offsets().to_vec())
    });
    assert!(out.iter().all(|o| o.0 == 32));
    assert_eq!(out[0].1, vec![0, 32, 64, 96, 128]);
}

#[test]
fn rebalances_after_adapt_and_conserves_order() {
    let out = run_ranks(3, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Quad, 2);
        let adapted = adapt(comm, &uniform(comm, &cmesh, 2), false, refine_tree_zero());
        let balanced = partition(comm, &adapted, false);
        balanced.validate_global_order(comm).unwrap();
        (elements(&adapted), elements(&balanced))
    });
    let before: Vec<_> = out.iter().flat_map(|o| o.0.clone()).collect();
    let after: Vec<_> = out.iter().flat_map(|o| o.1.clone()).collect();
    assert_eq!(before, after);
    let counts: Vec<usize> = out.iter().map(|o| o.1.len()).collect();
    let (min, max) = (counts.iter().min().unwrap(), counts.iter().max().unwrap());
    assert!(max - min <= 1, "{counts:?}");
    assert_eq!(counts.iter().sum::<usize>(), 64 + 16);
}

#[test]
fn partitioning_a_balanced_forest_changes_nothing() {
    let out = run_ranks(3, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Hex, 1);
        let adapted = adapt(comm, &uniform(comm, &cmesh, 1), false, refine_tree_zero());
        let once = partition(comm, &adapted, false);
        let twice = partition(comm, &once, false);
        (
            elements(&once) == elements(&twice),
            once.element_offsets() == twice.element_offsets(),
            once.cmesh().local_range() == twice.cmesh().local_range(),
        )
    });
    assert!(out.iter().all(|&o| o == (true, true, true)));
}

#[test]
fn coarse_mesh_follows_the_elements() {
    let out = run_ranks(4, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Quad, 3);
        let adapted = adapt(comm, &uniform(comm, &cmesh, 1), false, refine_tree_zero());
        let f = partition(comm, &adapted, false);
        let ids: Vec<TreeId> = f.local_trees().iter().map(|t| t.id).collect();
        let cm = f.cmesh();
        (
            ids.first().copied() == cm.first_local_tree(),
            ids.last().copied() == cm.last_local_tree(),
            cm.is_partitioned(),
            cm.derived_from().is_some(),
        )
    });
    assert!(out.iter().all(|&o| o == (true, true, true, true)));
}

#[test]
fn weights_move_the_boundary() {
    let out = run_ranks(2, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Quad, 2);
        let src = uniform(comm, &cmesh, 1);
        let mut fb = ForestBuilder::new();
        fb.set_partition(&src, false)
            .set_partition_weight(weight_fn(|tree, _| if tree.get() == 1 { 3 } else { 1 }));
        fb.commit(comm).unwrap().element_offsets().to_vec()
    });
    assert_eq!(out[0], vec![0, 6, 8]);
    assert_eq!(out[0], out[1]);
}

#[test]
fn user_data_survives_partition() {
    let out = run_ranks(2, |comm| {
        let cmesh = mesh_of(comm, ElementClass::Line, 1);
        let mut fb = ForestBuilder::new();
        fb.set_cmesh(&cmesh)
            .set_scheme(SchemeTable::hypercube())
            .set_level(3)
            .set_user_data(std::sync::Arc::new(String::from("tag")));
        let src = fb.commit(comm).unwrap();
        let f = partition(comm, &src, false);
        f.user_data::<String>().cloned()
    });
    assert!(out.iter().all(|o| o.as_deref() == Some("tag")));
}
