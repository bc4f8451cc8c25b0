#![allow(dead_code)]
use mesh_forest::prelude::*;

/// Run `f` on every rank of a fresh in-process group; results are indexed by rank.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&RayonComm) -> T + Sync,
{
    let comms = RayonComm::group(n);
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.iter().map(|c| s.spawn(move || f(c))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

/// Replicated coarse mesh of `n` trees of one class.
pub fn mesh_of<C: Communicator>(comm: &C, class: ElementClass, n: u64) -> CoarseMesh {
    let mut b = CoarseMeshBuilder::new();
    for t in 0..n {
        b.set_tree_class(TreeId::new(t), class);
    }
    b.commit(comm).unwrap()
}

pub fn uniform<C: Communicator>(comm: &C, cmesh: &CoarseMesh, level: u8) -> Forest {
    let mut fb = ForestBuilder::new();
    fb.set_cmesh(cmesh)
        .set_scheme(SchemeTable::hypercube())
        .set_level(level);
    fb.commit(comm).unwrap()
}

pub fn adapt<C: Communicator>(comm: &C, src: &Forest, recursive: bool, f: AdaptFn) -> Forest {
    let mut fb = ForestBuilder::new();
    fb.set_adapt(src, f, recursive);
    fb.commit(comm).unwrap()
}

pub fn partition<C: Communicator>(comm: &C, src: &Forest, slack: bool) -> Forest {
    let mut fb = ForestBuilder::new();
    fb.set_partition(src, slack);
    fb.commit(comm).unwrap()
}

/// Local elements as (tree, element) pairs.
pub fn elements(f: &Forest) -> Vec<(TreeId, Element)> {
    f.iter_elements().map(|(t, e)| (t, *e)).collect()
}
