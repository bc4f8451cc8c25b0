//! Structural checks for committed forests.
//!
//! [`DebugInvariants`] covers what one rank can verify alone: local trees in
//! order, elements in curve order tiling their share of each tree, offsets
//! consistent with the local count. [`Forest::validate_global_order`] adds the
//! collective check that the concatenation over all ranks tiles every tree.

use crate::algs::collective::allgather_records;
use crate::algs::communicator::Communicator;
use crate::algs::wire::{WireOrderProbe, kind};
use crate::debug_invariants::DebugInvariants;
use crate::forest::{Forest, LocalTree};
use crate::mesh_error::MeshForestError;
use itertools::Itertools;
use std::cmp::Ordering;
use std::ops::Range;

fn violation(msg: String) -> MeshForestError {
    MeshForestError::InvariantViolation(msg)
}

impl Forest {
    /// Leaf ranges of the first and last element of a local tree.
    fn tree_span(&self, tree: &LocalTree) -> Result<Option<(Range<u64>, Range<u64>)>, MeshForestError> {
        let scheme = self.scheme(tree.class)?;
        Ok(match (tree.elements.first(), tree.elements.last()) {
            (Some(first), Some(last)) => Some((scheme.leaf_range(first), scheme.leaf_range(last))),
            _ => None,
        })
    }

    fn validate_tree(&self, idx: usize, tree: &LocalTree) -> Result<(), MeshForestError> {
        let cmesh = self.cmesh();
        if !cmesh.local_range().contains(tree.id) {
            return Err(violation(format!(
                "tree {} outside coarse range {:?}",
                tree.id,
                cmesh.local_range()
            )));
        }
        if cmesh.tree_class(tree.id)? != tree.class {
            return Err(violation(format!("tree {} class disagrees with coarse mesh", tree.id)));
        }
        let scheme = self.scheme(tree.class)?;
        for (a, b) in tree.elements.iter().tuple_windows() {
            if scheme.compare_key(a, b) != Ordering::Less {
                return Err(violation(format!("tree {}: elements out of curve order", tree.id)));
            }
            if scheme.leaf_range(a).end != scheme.leaf_range(b).start {
                return Err(violation(format!("tree {}: gap or overlap between elements", tree.id)));
            }
        }
        let Some((first, last)) = self.tree_span(tree)? else {
            return Err(violation(format!("tree {} has no elements", tree.id)));
        };
        let root = scheme.leaf_range(&scheme.root());
        let n = self.num_local_trees();
        if idx > 0 && first.start != root.start {
            return Err(violation(format!("tree {} does not start at its root", tree.id)));
        }
        if idx + 1 < n && last.end != root.end {
            return Err(violation(format!("tree {} does not end at its root", tree.id)));
        }
        Ok(())
    }

    /// Collective: check that all ranks' elements, concatenated in rank order,
    /// tile every tree of the coarse mesh exactly once.
    pub fn validate_global_order<C: Communicator>(&self, comm: &C) -> Result<(), MeshForestError> {
        self.check_comm(comm)?;
        self.validate_invariants()?;
        let probe = match (self.local_trees().first(), self.local_trees().last()) {
            (Some(first), Some(last)) => {
                let (start, _) = self.tree_span(first)?.unwrap_or((0..0, 0..0));
                let (_, end) = self.tree_span(last)?.unwrap_or((0..0, 0..0));
                vec![WireOrderProbe::new(
                    self.num_local_elements(),
                    (first.id.get(), start.start),
                    (last.id.get(), end.end),
                )]
            }
            _ => vec![],
        };
        let probes: Vec<WireOrderProbe> = allgather_records(comm, kind::ORDER_PROBE, &probe)?
            .into_iter()
            .flatten()
            .collect();

        let cmesh = self.cmesh();
        let root_of = |tree: u64| -> Result<Range<u64>, MeshForestError> {
            let class = cmesh.tree_class(tree.into())?;
            let scheme = self.scheme(class)?;
            Ok(scheme.leaf_range(&scheme.root()))
        };

        let total: u64 = probes.iter().map(WireOrderProbe::count).sum();
        if total != self.num_global_elements() {
            return Err(violation(format!(
                "ranks hold {total} elements, offsets say {}",
                self.num_global_elements()
            )));
        }
        let num_trees = cmesh.num_trees();
        let (Some(head), Some(tail)) = (probes.first(), probes.last()) else {
            return if num_trees == 0 {
                Ok(())
            } else {
                Err(violation("no rank holds any element".into()))
            };
        };
        if head.first() != (0, root_of(0)?.start) {
            return Err(violation("first element is not the start of tree 0".into()));
        }
        let last_tree = num_trees.saturating_sub(1);
        if tail.last() != (last_tree, root_of(last_tree)?.end) {
            return Err(violation(format!("last element is not the end of tree {last_tree}")));
        }
        for (prev, next) in probes.iter().tuple_windows() {
            let (pt, pend) = prev.last();
            let (nt, nstart) = next.first();
            let joined = if pt == nt {
                nstart == pend
            } else {
                nt == pt + 1 && pend == root_of(pt)?.end && nstart == root_of(nt)?.start
            };
            if !joined {
                return Err(violation(format!(
                    "rank boundary between tree {pt} leaf {pend} and tree {nt} leaf {nstart} is not contiguous"
                )));
            }
        }
        Ok(())
    }
}

impl DebugInvariants for Forest {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "Forest");
    }

    fn validate_invariants(&self) -> Result<(), MeshForestError> {
        let offsets = self.element_offsets();
        if offsets.len() != self.size() + 1 || offsets.first() != Some(&0) {
            return Err(violation(format!(
                "{} element offsets for {} ranks",
                offsets.len(),
                self.size()
            )));
        }
        if offsets.iter().tuple_windows().any(|(a, b)| a > b) {
            return Err(violation("element offsets decrease".into()));
        }
        let rank = self.rank();
        if offsets[rank + 1] - offsets[rank] != self.num_local_elements() {
            return Err(violation(format!(
                "offsets give rank {rank} {} elements, it holds {}",
                offsets[rank + 1] - offsets[rank],
                self.num_local_elements()
            )));
        }
        for (a, b) in self.local_trees().iter().tuple_windows() {
            if a.id >= b.id {
                return Err(violation(format!("local tree {} follows tree {}", b.id, a.id)));
            }
        }
        for (idx, tree) in self.local_trees().iter().enumerate() {
            self.validate_tree(idx, tree)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{NoComm, RayonComm};
    use crate::cmesh::{CoarseMeshBuilder, TreeId};
    use crate::forest::{ForestBuilder, ForestData, Fringe};
    use crate::scheme::{ElementClass, SchemeTable};

    fn uniform<C: Communicator>(comm: &C, trees: u64, level: u8) -> Forest {
        let mut b = CoarseMeshBuilder::new();
        for t in 0..trees {
            b.set_tree_class(TreeId::new(t), ElementClass::Quad);
        }
        let cmesh = b.commit(comm).unwrap();
        let mut fb = ForestBuilder::new();
        fb.set_cmesh(&cmesh)
            .set_scheme(SchemeTable::hypercube())
            .set_level(level);
        fb.commit(comm).unwrap()
    }

    fn rebuilt(f: &Forest, trees: Vec<LocalTree>, offsets: Vec<u64>) -> Forest {
        // bypass from_data so broken layouts can be inspected
        Forest {
            inner: std::sync::Arc::new(ForestData {
                cmesh: f.cmesh().clone(),
                schemes: f.schemes().clone(),
                trees,
                element_offsets: offsets,
                rank: f.rank(),
                size: f.size(),
                source: None,
                user_data: None,
                fringe: Fringe::default(),
                adapt_stats: None,
            }),
        }
    }

    #[test]
    fn uniform_forest_is_valid() {
        let f = uniform(&NoComm, 3, 2);
        assert_eq!(f.validate_invariants(), Ok(()));
        assert_eq!(f.validate_global_order(&NoComm), Ok(()));
    }

    #[test]
    fn swapped_elements_are_reported() {
        let f = uniform(&NoComm, 1, 1);
        let mut trees = f.local_trees().to_vec();
        trees[0].elements.swap(1, 2);
        let bad = rebuilt(&f, trees, vec![0, 4]);
        assert!(matches!(
            bad.validate_invariants(),
            Err(MeshForestError::InvariantViolation(_))
        ));
    }

    #[test]
    fn gap_and_wrong_offsets_are_reported() {
        let f = uniform(&NoComm, 1, 1);
        let mut trees = f.local_trees().to_vec();
        trees[0].elements.remove(1);
        let gap = rebuilt(&f, trees.clone(), vec![0, 3]);
        assert!(gap.validate_invariants().is_err());
        let counts = rebuilt(&f, f.local_trees().to_vec(), vec![0, 5]);
        assert!(counts.validate_invariants().is_err());
    }

    #[test]
    #[should_panic(expected = "mesh-forest: broken invariant after Forest")]
    #[cfg(debug_assertions)]
    fn debug_assert_panics_with_context() {
        let f = uniform(&NoComm, 1, 1);
        let mut trees = f.local_trees().to_vec();
        trees[0].elements.swap(0, 3);
        rebuilt(&f, trees, vec![0, 4]).debug_assert_invariants();
    }

    #[test]
    fn truncated_tree_fails_global_order_only() {
        let f = uniform(&NoComm, 1, 1);
        let mut trees = f.local_trees().to_vec();
        trees[0].elements.pop();
        let partial = rebuilt(&f, trees, vec![0, 3]);
        assert_eq!(partial.validate_invariants(), Ok(()));
        assert!(partial.validate_global_order(&NoComm).is_err());
    }

    #[test]
    fn global_order_holds_across_ranks() {
        let comms = RayonComm::group(3);
        let results: Vec<Result<(), MeshForestError>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|comm| s.spawn(move || uniform(comm, 2, 2).validate_global_order(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(Result::is_ok), "{results:?}");
    }
}
