//! Adapt: refine and coarsen a committed forest under a decision callback.
//!
//! Each local tree is walked in curve order. A run of elements forming a
//! complete family is offered to the callback as a whole; if the answer is not
//! [`AdaptDecision::Coarsen`] its members are offered one by one. Any other
//! element is offered alone. Answers that make no sense for the call
//! (`Coarsen` for one element, `Refine` for a family, `Refine` at max level)
//! keep the element(s).
//!
//! In recursive mode freshly refined children are offered again until the
//! callback keeps them, and a freshly coarsened parent that completes a family
//! with the preceding output is offered again as that family.
//!
//! Adapt never moves elements between ranks. When the source carries a
//! boundary fringe, families straddling a rank boundary are evaluated by every
//! rank that sees them; the rank holding the family's first element keeps the
//! parent and the others drop their members.

use crate::algs::collective::exclusive_offsets;
use crate::algs::communicator::Communicator;
use crate::cmesh::{CoarseMesh, TreeId};
use crate::forest::{Forest, ForestData, Fringe, LocalTree, UserData};
use crate::mesh_error::MeshForestError;
use crate::scheme::{AdaptDecision, Element, ElementScheme};
use std::any::Any;
use std::sync::Arc;

/// Decision callback: `(context, tree, scheme, elements) -> decision`.
///
/// `elements` holds one element, or a complete family. Must not depend on
/// anything but its arguments and the context's user data.
pub type AdaptFn = Arc<
    dyn Fn(&AdaptContext<'_>, TreeId, &dyn ElementScheme, &[Element]) -> AdaptDecision
        + Send
        + Sync,
>;

/// Wrap a closure as an [`AdaptFn`].
pub fn adapt_fn<F>(f: F) -> AdaptFn
where
    F: Fn(&AdaptContext<'_>, TreeId, &dyn ElementScheme, &[Element]) -> AdaptDecision
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Read-only view handed to adapt callbacks.
pub struct AdaptContext<'a> {
    source: &'a Forest,
    user_data: Option<&'a UserData>,
}

impl<'a> AdaptContext<'a> {
    pub fn source(&self) -> &'a Forest {
        self.source
    }

    pub fn cmesh(&self) -> &'a CoarseMesh {
        self.source.cmesh()
    }

    /// User data of the forest being built.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&'a T> {
        self.user_data?.downcast_ref::<T>()
    }
}

/// What one adapt did on this rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdaptStats {
    /// Deepest chain of repeated decisions plus one (1 for a single pass).
    pub passes: u32,
    pub refined: u64,
    pub coarsened: u64,
    /// Refine answers ignored because the element was at max level.
    pub level_bound_hits: u64,
    /// Coarsenings of families straddling a rank boundary emitted here.
    pub cross_rank_coarsened: u64,
}

impl AdaptStats {
    fn merge(&mut self, other: &AdaptStats) {
        self.passes = self.passes.max(other.passes);
        self.refined += other.refined;
        self.coarsened += other.coarsened;
        self.level_bound_hits += other.level_bound_hits;
        self.cross_rank_coarsened += other.cross_rank_coarsened;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Before,
    Local,
    After,
}

struct TreeAdapter<'a> {
    ctx: &'a AdaptContext<'a>,
    callback: &'a AdaptFn,
    tree: TreeId,
    scheme: &'a dyn ElementScheme,
    recursive: bool,
    stats: AdaptStats,
    out: Vec<Element>,
}

impl<'a> TreeAdapter<'a> {
    fn decide(&self, elements: &[Element]) -> AdaptDecision {
        (self.callback)(self.ctx, self.tree, self.scheme, elements)
    }

    fn note_depth(&mut self, depth: u32) {
        self.stats.passes = self.stats.passes.max(depth + 1);
    }

    fn single(&mut self, e: Element, depth: u32) {
        self.note_depth(depth);
        if self.decide(std::slice::from_ref(&e)) != AdaptDecision::Refine {
            self.out.push(e);
            return;
        }
        let children = self.scheme.refine(&e);
        if children.is_empty() {
            self.stats.level_bound_hits += 1;
            self.out.push(e);
            return;
        }
        self.stats.refined += 1;
        if self.recursive {
            for child in children {
                self.single(child, depth + 1);
            }
        } else {
            self.out.extend(children);
        }
    }

    /// Re-offer the family completed by a freshly coarsened parent.
    fn coarsen_tail(&mut self) {
        let cc = self.scheme.children_count();
        let mut depth = 1;
        while self.recursive && cc > 1 && self.out.len() >= cc {
            let start = self.out.len() - cc;
            let family = &self.out[start..];
            if !self.scheme.family_is_complete(family) || self.decide(family) != AdaptDecision::Coarsen {
                break;
            }
            let Some(parent) = self.scheme.coarsen(family) else {
                break;
            };
            self.out.truncate(start);
            self.out.push(parent);
            self.stats.coarsened += 1;
            self.note_depth(depth);
            depth += 1;
        }
    }

    fn run(&mut self, elements: &[Element], origins: &[Origin]) {
        let cc = self.scheme.children_count();
        let mut i = 0;
        while i < elements.len() {
            let end = i + cc;
            if cc > 1 && end <= elements.len() && self.scheme.family_is_complete(&elements[i..end]) {
                self.family(&elements[i..end], &origins[i..end]);
                i = end;
                continue;
            }
            if origins[i] == Origin::Local {
                self.single(elements[i], 0);
            }
            i += 1;
        }
    }

    fn family(&mut self, family: &[Element], origins: &[Origin]) {
        let local = origins.iter().filter(|&&o| o == Origin::Local).count();
        if local == 0 {
            return;
        }
        self.note_depth(0);
        let parent = match self.decide(family) {
            AdaptDecision::Coarsen => self.scheme.coarsen(family),
            _ => None,
        };
        if let Some(parent) = parent {
            if origins[0] == Origin::Local {
                self.out.push(parent);
                self.stats.coarsened += 1;
                if local < family.len() {
                    self.stats.cross_rank_coarsened += 1;
                }
                self.coarsen_tail();
            }
            return;
        }
        for (e, _) in family
            .iter()
            .zip(origins)
            .filter(|(_, o)| **o == Origin::Local)
        {
            self.single(*e, 0);
        }
    }
}

/// Adapt `tree`'s elements, extended by whatever part of `fringe` lies in the
/// same tree on the given sides.
fn adapt_tree(
    ctx: &AdaptContext<'_>,
    callback: &AdaptFn,
    recursive: bool,
    scheme: &dyn ElementScheme,
    tree: &LocalTree,
    fringe_before: &[(TreeId, Element)],
    fringe_after: &[(TreeId, Element)],
) -> (Vec<Element>, AdaptStats) {
    let before: Vec<Element> = fringe_before
        .iter()
        .filter(|(t, _)| *t == tree.id)
        .map(|(_, e)| *e)
        .collect();
    let after: Vec<Element> = fringe_after
        .iter()
        .filter(|(t, _)| *t == tree.id)
        .map(|(_, e)| *e)
        .collect();

    let mut elements = Vec::with_capacity(before.len() + tree.elements.len() + after.len());
    let mut origins = Vec::with_capacity(elements.capacity());
    for (slice, origin) in [
        (&before, Origin::Before),
        (&tree.elements, Origin::Local),
        (&after, Origin::After),
    ] {
        elements.extend_from_slice(slice);
        origins.extend(std::iter::repeat_n(origin, slice.len()));
    }

    let mut adapter = TreeAdapter {
        ctx,
        callback,
        tree: tree.id,
        scheme,
        recursive,
        stats: AdaptStats::default(),
        out: Vec::with_capacity(tree.elements.len()),
    };
    adapter.run(&elements, &origins);
    (adapter.out, adapter.stats)
}

pub(crate) fn commit_adapt<C: Communicator>(
    comm: &C,
    source: &Forest,
    callback: &AdaptFn,
    recursive: bool,
    user_data: Option<UserData>,
) -> Result<Forest, MeshForestError> {
    source.check_comm(comm)?;
    let user_data = user_data.or_else(|| source.user_data_handle().cloned());
    let ctx = AdaptContext {
        source,
        user_data: user_data.as_ref(),
    };

    let fringe = source.fringe();
    let last = source.num_local_trees().saturating_sub(1);
    let mut stats = AdaptStats::default();
    let mut trees = Vec::with_capacity(source.num_local_trees());
    for (idx, tree) in source.local_trees().iter().enumerate() {
        let scheme = source.scheme(tree.class)?;
        let before: &[(TreeId, Element)] = if idx == 0 { &fringe.before } else { &[] };
        let after: &[(TreeId, Element)] = if idx == last { &fringe.after } else { &[] };
        let (elements, tree_stats) =
            adapt_tree(&ctx, callback, recursive, scheme, tree, before, after);
        log::trace!(
            "[rank {}] adapt tree {}: {} -> {} elements, {:?}",
            source.rank(),
            tree.id,
            tree.elements.len(),
            elements.len(),
            tree_stats
        );
        stats.merge(&tree_stats);
        if !elements.is_empty() {
            trees.push(LocalTree::new(tree.id, tree.class, elements));
        }
    }

    let count: u64 = trees.iter().map(|t| t.elements.len() as u64).sum();
    let element_offsets = exclusive_offsets(comm, count)?;

    Ok(Forest::from_data(ForestData {
        cmesh: source.cmesh().clone(),
        schemes: source.schemes().clone(),
        trees,
        element_offsets,
        rank: source.rank(),
        size: source.size(),
        source: Some(source.downgrade()),
        user_data,
        fringe: Fringe::default(),
        adapt_stats: Some(stats),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::cmesh::CoarseMeshBuilder;
    use crate::forest::ForestBuilder;
    use crate::scheme::{ElementClass, HypercubeScheme, SchemeTable};

    fn uniform(class: ElementClass, level: u8, schemes: SchemeTable) -> Forest {
        let mut b = CoarseMeshBuilder::new();
        b.set_tree_class(TreeId::new(0), class);
        let cmesh = b.commit(&NoComm).unwrap();
        let mut fb = ForestBuilder::new();
        fb.set_cmesh(&cmesh).set_scheme(schemes).set_level(level);
        fb.commit(&NoComm).unwrap()
    }

    fn adapt(src: &Forest, recursive: bool, f: AdaptFn) -> Forest {
        let mut b = ForestBuilder::new();
        b.set_adapt(src, f, recursive);
        b.commit(&NoComm).unwrap()
    }

    #[test]
    fn refine_single_element_non_recursive() {
        let src = uniform(ElementClass::Quad, 1, SchemeTable::hypercube());
        let f = adapt(
            &src,
            false,
            adapt_fn(|_, _, scheme, els| {
                if els.len() == 1 && scheme.child_id(&els[0]) == 2 {
                    AdaptDecision::Refine
                } else {
                    AdaptDecision::Keep
                }
            }),
        );
        assert_eq!(f.num_local_elements(), 7);
        let levels: Vec<u8> = f.iter_elements().map(|(_, e)| e.level).collect();
        assert_eq!(levels, vec![1, 1, 2, 2, 2, 2, 1]);
        let stats = f.adapt_stats().unwrap();
        assert_eq!((stats.refined, stats.passes), (1, 1));
    }

    #[test]
    fn coarsen_answer_for_a_single_element_keeps_it() {
        let src = uniform(ElementClass::Line, 0, SchemeTable::hypercube());
        let f = adapt(&src, true, adapt_fn(|_, _, _, _| AdaptDecision::Coarsen));
        assert_eq!(f.num_local_elements(), 1);
    }

    #[test]
    fn refine_answer_for_a_family_falls_back_to_members() {
        let src = uniform(ElementClass::Quad, 1, SchemeTable::hypercube());
        let f = adapt(
            &src,
            false,
            adapt_fn(|_, _, _, els| {
                if els.len() > 1 {
                    AdaptDecision::Refine
                } else {
                    AdaptDecision::Keep
                }
            }),
        );
        assert_eq!(f.num_local_elements(), 4);
        assert_eq!(f.adapt_stats().unwrap().refined, 0);
    }

    #[test]
    fn recursive_coarsen_collapses_to_root() {
        let src = uniform(ElementClass::Quad, 3, SchemeTable::hypercube());
        let once = adapt(&src, false, adapt_fn(|_, _, _, _| AdaptDecision::Coarsen));
        assert_eq!(once.num_local_elements(), 16);
        let all = adapt(&src, true, adapt_fn(|_, _, _, _| AdaptDecision::Coarsen));
        assert_eq!(all.num_local_elements(), 1);
        let stats = all.adapt_stats().unwrap();
        assert_eq!(stats.coarsened, 16 + 4 + 1);
        assert_eq!(stats.passes, 3);
    }

    #[test]
    fn refine_at_max_level_is_counted_not_failed() {
        let shallow = SchemeTable::new().with_scheme(Arc::new(HypercubeScheme::with_max_level(
            ElementClass::Line,
            2,
        ).unwrap()));
        let src = uniform(ElementClass::Line, 1, shallow);
        let f = adapt(&src, true, adapt_fn(|_, _, _, els| {
            if els.len() == 1 {
                AdaptDecision::Refine
            } else {
                AdaptDecision::Keep
            }
        }));
        assert_eq!(f.num_local_elements(), 4);
        let stats = f.adapt_stats().unwrap();
        assert_eq!(stats.refined, 2);
        assert_eq!(stats.level_bound_hits, 4);
        assert!(f.iter_elements().all(|(_, e)| e.level == 2));
    }

    #[test]
    fn callback_sees_user_data_of_the_new_forest() {
        let src = uniform(ElementClass::Line, 2, SchemeTable::hypercube());
        let mut b = ForestBuilder::new();
        b.set_user_data(Arc::new(3u8)).set_adapt(
            &src,
            adapt_fn(|ctx, _, _, els| {
                let max = *ctx.user_data::<u8>().unwrap();
                if els.len() == 1 && els[0].level < max {
                    AdaptDecision::Refine
                } else {
                    AdaptDecision::Keep
                }
            }),
            true,
        );
        let f = b.commit(&NoComm).unwrap();
        assert_eq!(f.num_local_elements(), 8);
    }

    fn forest_with_fringe(local: Vec<Element>, fringe: Fringe) -> Forest {
        let src = uniform(ElementClass::Quad, 0, SchemeTable::hypercube());
        let n = local.len() as u64;
        Forest::from_data(ForestData {
            cmesh: src.cmesh().clone(),
            schemes: src.schemes().clone(),
            trees: vec![LocalTree::new(TreeId::new(0), ElementClass::Quad, local)],
            element_offsets: vec![0, n],
            rank: 0,
            size: 1,
            source: None,
            user_data: None,
            fringe,
            adapt_stats: None,
        })
    }

    #[test]
    fn straddling_family_goes_to_the_holder_of_its_first_element() {
        let s = HypercubeScheme::quad();
        let kids = s.refine(&s.root());
        let t = TreeId::new(0);
        let coarsen = adapt_fn(|_, _, _, _| AdaptDecision::Coarsen);

        let head = forest_with_fringe(
            kids[..2].to_vec(),
            Fringe {
                before: vec![],
                after: kids[2..].iter().map(|e| (t, *e)).collect(),
            },
        );
        let f = adapt(&head, false, coarsen.clone());
        assert_eq!(f.iter_elements().map(|(_, e)| *e).collect::<Vec<_>>(), vec![s.root()]);
        assert_eq!(f.adapt_stats().unwrap().cross_rank_coarsened, 1);
        assert!(f.fringe().is_empty());

        let tail = forest_with_fringe(
            kids[2..].to_vec(),
            Fringe {
                before: kids[..2].iter().map(|e| (t, *e)).collect(),
                after: vec![],
            },
        );
        let f = adapt(&tail, false, coarsen);
        assert_eq!(f.num_local_elements(), 0);
        assert_eq!(f.num_local_trees(), 0);
    }

    #[test]
    fn straddling_family_kept_when_callback_keeps() {
        let s = HypercubeScheme::quad();
        let kids = s.refine(&s.root());
        let t = TreeId::new(0);
        let tail = forest_with_fringe(
            kids[1..].to_vec(),
            Fringe {
                before: vec![(t, kids[0])],
                after: vec![],
            },
        );
        let f = adapt(&tail, false, adapt_fn(|_, _, _, _| AdaptDecision::Keep));
        assert_eq!(f.num_local_elements(), 3);
    }
}
