mod util;
use util::*;

use mesh_forest::prelude::*;

fn strip_builder() -> CoarseMeshBuilder {
    // four quads in a row, joined +x to -x
    let mut b = CoarseMeshBuilder::new();
    for t in 0..4 {
        b.set_tree_class(TreeId::new(t), ElementClass::Quad);
    }
    for t in 0..3 {
        b.set_join(TreeId::new(t), 1, TreeId::new(t + 1), 0, 0);
    }
    b
}

#[test]
fn range_mode_ranks_describe_only_their_trees() {
    let ranges = [(0, 1), (2, 2), (3, 3)];
    let out = run_ranks(3, |comm| {
        let (first, last) = ranges[comm.rank()];
        let mut b = CoarseMeshBuilder::new();
        for t in first..=last {
            b.set_tree_class(TreeId::new(t), ElementClass::Quad);
        }
        // each rank only joins its own trees to their right neighbour
        for t in first..=last.min(2) {
            b.set_join(TreeId::new(t), 1, TreeId::new(t + 1), 0, 0);
        }
        b.set_partition_range(first, last);
        let cmesh = b.commit(comm).unwrap();
        (
            cmesh.num_trees(),
            cmesh.local_range(),
            cmesh.tree_owner(TreeId::new(3)),
            cmesh.tree_class(TreeId::new(0)).unwrap(),
            cmesh
                .local_trees()
                .iter()
                .map(|t| cmesh.face_neighbor(t.id, 1).unwrap().map(|l| l.tree))
                .collect::<Vec<_>>(),
        )
    });
    assert!(out.iter().all(|o| o.0 == 4 && o.3 == ElementClass::Quad));
    assert_eq!(out[0].1, TreeRange::new(0, 2));
    assert_eq!(out[1].1, TreeRange::new(2, 3));
    assert!(out.iter().all(|o| o.2 == Some(2)));
    assert_eq!(out[0].4, vec![Some(TreeId::new(1)), Some(TreeId::new(2))]);
    assert_eq!(out[2].4, vec![None]);
}

#[test]
fn range_mode_links_joins_declared_on_other_ranks() {
    let out = run_ranks(2, |comm| {
        let mut b = CoarseMeshBuilder::new();
        let me = comm.rank() as u64;
        b.set_tree_class(TreeId::new(me), ElementClass::Quad);
        if me == 0 {
            b.set_join(TreeId::new(0), 1, TreeId::new(1), 0, 0);
        }
        b.set_partition_range(me, me);
        let cmesh = b.commit(comm).unwrap();
        cmesh
            .face_neighbor(TreeId::new(me), if me == 0 { 1 } else { 0 })
            .unwrap()
            .map(|l| (l.tree, l.face))
    });
    assert_eq!(out[0], Some((TreeId::new(1), 0)));
    assert_eq!(out[1], Some((TreeId::new(0), 1)));
}

#[test]
fn range_mode_rejects_joins_ranks_disagree_on() {
    let out = run_ranks(2, |comm| {
        let mut b = CoarseMeshBuilder::new();
        let me = comm.rank() as u64;
        b.set_tree_class(TreeId::new(me), ElementClass::Quad);
        if me == 0 {
            b.set_join(TreeId::new(0), 1, TreeId::new(1), 0, 0);
        } else {
            b.set_join(TreeId::new(1), 0, TreeId::new(0), 3, 0);
        }
        b.set_partition_range(me, me);
        b.commit(comm).map(|_| ())
    });
    assert!(
        out.iter()
            .all(|r| matches!(r, Err(MeshForestError::Connectivity { .. }))),
        "{out:?}"
    );
    assert_eq!(out[0], out[1]);
}

#[test]
fn range_mode_join_error_on_one_rank_fails_every_rank() {
    let out = run_ranks(2, |comm| {
        let mut b = CoarseMeshBuilder::new();
        let me = comm.rank() as u64;
        b.set_tree_class(TreeId::new(me), ElementClass::Quad);
        if me == 0 {
            b.set_join(TreeId::new(0), 2, TreeId::new(0), 2, 0);
        }
        b.set_partition_range(me, me);
        b.commit(comm).map(|_| ())
    });
    let expected = Err(MeshForestError::Connectivity {
        tree: TreeId::new(0),
        face: 2,
        reason: "self join".into(),
    });
    assert_eq!(out, vec![expected.clone(), expected]);
}

#[test]
fn range_mode_rejects_gaps() {
    let ranges = [(0, 0), (2, 3)];
    let out = run_ranks(2, |comm| {
        let (first, last) = ranges[comm.rank()];
        let mut b = strip_builder();
        b.set_partition_range(first, last);
        b.commit(comm).map(|_| ())
    });
    assert!(out.iter().all(|r| matches!(r, Err(MeshForestError::Range(_)))));
}

#[test]
fn uniform_partition_shares_boundary_tree() {
    let out = run_ranks(2, |comm| {
        let mut b = CoarseMeshBuilder::new();
        for t in 0..3 {
            b.set_tree_class(TreeId::new(t), ElementClass::Quad);
        }
        b.set_partition_uniform(1);
        let cmesh = b.commit(comm).unwrap();
        let holders: Vec<usize> = cmesh
            .partition_table()
            .unwrap()
            .holders(TreeId::new(1))
            .collect();
        (cmesh.local_range(), cmesh.tree_owner(TreeId::new(1)), holders)
    });
    assert_eq!(out[0].0, TreeRange::new(0, 2));
    assert_eq!(out[1].0, TreeRange::new(1, 3));
    assert_eq!(out[0].1, Some(0));
    assert_eq!(out[1].2, vec![0, 1]);
}

#[test]
fn derive_moves_trees_with_their_links() {
    let out = run_ranks(2, |comm| {
        let mut b = strip_builder();
        b.set_partition_offsets(&[0, 2, 4]);
        let base = b.commit(comm).unwrap();

        let mut d = CoarseMeshBuilder::new();
        d.set_derive(&base).set_partition_offsets(&[0, 1, 4]);
        let derived = d.commit(comm).unwrap();
        let moved = derived
            .tree(TreeId::new(1))
            .ok()
            .map(|t| (t.face(0).copied(), t.face(1).copied()));
        let provenance = derived.derived_from().map(|m| m.local_range());
        (derived.local_range(), moved, provenance, base.local_range())
    });
    assert_eq!(out[0].0, TreeRange::new(0, 1));
    assert_eq!(out[1].0, TreeRange::new(1, 4));
    let (left, right) = out[1].1.unwrap();
    assert_eq!(left.map(|l| (l.tree, l.face)), Some((TreeId::new(0), 1)));
    assert_eq!(right.map(|l| (l.tree, l.face)), Some((TreeId::new(2), 0)));
    assert_eq!(out[1].2, Some(out[1].3));
    assert!(out[0].1.is_none());
}

#[test]
fn join_errors_surface_before_communication() {
    let mut b = strip_builder();
    b.set_join(TreeId::new(3), 1, TreeId::new(9), 0, 0);
    assert!(matches!(
        b.commit(&NoComm),
        Err(MeshForestError::Connectivity { .. })
    ));

    let mut b = CoarseMeshBuilder::new();
    b.set_tree_class(TreeId::new(0), ElementClass::Hex)
        .set_tree_class(TreeId::new(1), ElementClass::Line)
        .set_join(TreeId::new(0), 0, TreeId::new(1), 0, 0);
    assert!(matches!(
        b.commit(&NoComm),
        Err(MeshForestError::Connectivity { .. })
    ));
}

#[test]
fn clones_share_one_mesh() {
    let cmesh = mesh_of(&NoComm, ElementClass::Hex, 2);
    let other = cmesh.clone();
    assert_eq!(cmesh.ref_count(), 2);
    let f = uniform(&NoComm, &cmesh, 1);
    assert_eq!(cmesh.ref_count(), 3);
    drop((other, f));
    assert_eq!(cmesh.ref_count(), 1);
}
