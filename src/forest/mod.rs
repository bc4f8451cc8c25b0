//! Forest: the distributed set of leaf elements over a coarse mesh.
//!
//! A [`Forest`] is built by [`ForestBuilder::commit`] from exactly one source:
//! a uniform refinement of a coarse mesh, an adaptation of a committed forest,
//! or a repartition of a committed forest. Committed forests are immutable;
//! `Clone` shares the data.
//!
//! Concatenating every rank's elements in rank order gives one sequence sorted
//! by (tree id, scheme key) whose leaf ranges tile every tree exactly.

pub mod adapt;
pub mod partition;
pub mod uniform;
pub mod validation;

pub use adapt::{AdaptContext, AdaptFn, AdaptStats, adapt_fn};
pub use partition::{WeightFn, weight_fn};

use crate::algs::communicator::Communicator;
use crate::cmesh::{CoarseMesh, TreeId};
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshForestError;
use crate::scheme::{Element, ElementClass, ElementScheme, SchemeTable};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Opaque caller data carried by a forest and handed to adapt callbacks.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// The elements of one coarse tree held by this rank, in curve order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTree {
    pub id: TreeId,
    pub class: ElementClass,
    pub elements: Vec<Element>,
    /// Index of `elements[0]` among this rank's elements.
    pub first_local_element: u64,
}

impl LocalTree {
    pub fn new(id: TreeId, class: ElementClass, elements: Vec<Element>) -> Self {
        Self {
            id,
            class,
            elements,
            first_local_element: 0,
        }
    }

    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }
}

/// Copies of the few elements just outside this rank's range, kept by a
/// partition with boundary slack.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fringe {
    pub before: Vec<(TreeId, Element)>,
    pub after: Vec<(TreeId, Element)>,
}

impl Fringe {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

pub(crate) struct ForestData {
    pub(crate) cmesh: CoarseMesh,
    pub(crate) schemes: SchemeTable,
    pub(crate) trees: Vec<LocalTree>,
    pub(crate) element_offsets: Vec<u64>,
    pub(crate) rank: usize,
    pub(crate) size: usize,
    pub(crate) source: Option<Weak<ForestData>>,
    pub(crate) user_data: Option<UserData>,
    pub(crate) fringe: Fringe,
    pub(crate) adapt_stats: Option<AdaptStats>,
}

/// A committed forest.
#[derive(Clone)]
pub struct Forest {
    inner: Arc<ForestData>,
}

impl Forest {
    pub(crate) fn from_data(mut data: ForestData) -> Self {
        let mut next = 0u64;
        for tree in &mut data.trees {
            tree.first_local_element = next;
            next += tree.elements.len() as u64;
        }
        let forest = Self {
            inner: Arc::new(data),
        };
        crate::debug_invariants!(forest.validate_invariants(), "Forest::commit");
        forest
    }

    pub fn cmesh(&self) -> &CoarseMesh {
        &self.inner.cmesh
    }

    pub fn schemes(&self) -> &SchemeTable {
        &self.inner.schemes
    }

    /// Scheme of the given class.
    pub fn scheme(&self, class: ElementClass) -> Result<&dyn ElementScheme, MeshForestError> {
        self.inner.schemes.get(class)
    }

    pub fn local_trees(&self) -> &[LocalTree] {
        &self.inner.trees
    }

    pub fn num_local_trees(&self) -> usize {
        self.inner.trees.len()
    }

    pub fn num_local_elements(&self) -> u64 {
        self.inner
            .trees
            .iter()
            .map(|t| t.elements.len() as u64)
            .sum()
    }

    pub fn num_global_elements(&self) -> u64 {
        self.inner.element_offsets.last().copied().unwrap_or(0)
    }

    /// Global index of this rank's first element.
    pub fn first_global_element(&self) -> u64 {
        self.inner.element_offsets[self.inner.rank]
    }

    /// `P + 1` offsets: rank `r` holds global elements `[o[r], o[r + 1])`.
    pub fn element_offsets(&self) -> &[u64] {
        &self.inner.element_offsets
    }

    /// Local elements in global order, tagged with their tree.
    pub fn iter_elements(&self) -> impl Iterator<Item = (TreeId, &Element)> + '_ {
        self.inner
            .trees
            .iter()
            .flat_map(|t| t.elements.iter().map(move |e| (t.id, e)))
    }

    pub fn tree_elements(&self, tree: TreeId) -> Option<&[Element]> {
        self.inner
            .trees
            .binary_search_by_key(&tree, |t| t.id)
            .ok()
            .map(|i| self.inner.trees[i].elements.as_slice())
    }

    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.user_data.as_ref()?.downcast_ref::<T>()
    }

    pub(crate) fn user_data_handle(&self) -> Option<&UserData> {
        self.inner.user_data.as_ref()
    }

    /// The forest this one was adapted or partitioned from, while it is alive.
    pub fn source(&self) -> Option<Forest> {
        self.inner
            .source
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Forest { inner })
    }

    /// Elements beyond this rank's range kept for cross-rank coarsening.
    pub fn fringe(&self) -> &Fringe {
        &self.inner.fringe
    }

    /// Statistics of the adapt that produced this forest.
    pub fn adapt_stats(&self) -> Option<&AdaptStats> {
        self.inner.adapt_stats.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.inner.rank
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<ForestData> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn check_comm<C: Communicator>(&self, comm: &C) -> Result<(), MeshForestError> {
        if comm.rank() != self.rank() || comm.size() != self.size() {
            return Err(MeshForestError::config(format!(
                "forest of rank {}/{} used with communicator rank {}/{}",
                self.rank(),
                self.size(),
                comm.rank(),
                comm.size()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Forest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forest")
            .field("rank", &self.inner.rank)
            .field("local_trees", &self.inner.trees.len())
            .field("local_elements", &self.num_local_elements())
            .field("global_elements", &self.num_global_elements())
            .finish()
    }
}

enum Source {
    Uniform {
        cmesh: CoarseMesh,
        schemes: SchemeTable,
        level: u8,
    },
    Adapt {
        source: Forest,
        callback: AdaptFn,
        recursive: bool,
    },
    Partition {
        source: Forest,
        slack: bool,
        weight: Option<WeightFn>,
    },
}

/// Mutable forest under construction (init → set_* → commit).
#[derive(Default)]
pub struct ForestBuilder {
    cmesh: Option<CoarseMesh>,
    schemes: Option<SchemeTable>,
    level: Option<u8>,
    adapt: Option<(Forest, AdaptFn, bool)>,
    partition: Option<(Forest, bool)>,
    weight: Option<WeightFn>,
    user_data: Option<UserData>,
}

impl ForestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cmesh(&mut self, cmesh: &CoarseMesh) -> &mut Self {
        self.cmesh = Some(cmesh.clone());
        self
    }

    pub fn set_scheme(&mut self, schemes: SchemeTable) -> &mut Self {
        self.schemes = Some(schemes);
        self
    }

    /// Uniform refinement level.
    pub fn set_level(&mut self, level: u8) -> &mut Self {
        self.level = Some(level);
        self
    }

    /// Build by adapting `source` under `callback`.
    pub fn set_adapt(&mut self, source: &Forest, callback: AdaptFn, recursive: bool) -> &mut Self {
        self.adapt = Some((source.clone(), callback, recursive));
        self
    }

    /// Build by repartitioning `source`; `allow_boundary_slack` keeps a fringe.
    pub fn set_partition(&mut self, source: &Forest, allow_boundary_slack: bool) -> &mut Self {
        self.partition = Some((source.clone(), allow_boundary_slack));
        self
    }

    /// Per-element weight for a partition build (default: 1 per element).
    pub fn set_partition_weight(&mut self, weight: WeightFn) -> &mut Self {
        self.weight = Some(weight);
        self
    }

    /// Attach opaque data; when unset, the source forest's data is inherited.
    pub fn set_user_data(&mut self, data: UserData) -> &mut Self {
        self.user_data = Some(data);
        self
    }

    pub fn get_user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    fn into_source(self) -> Result<(Source, Option<UserData>), MeshForestError> {
        let uniform_touched = self.cmesh.is_some() || self.schemes.is_some() || self.level.is_some();
        let configured = [uniform_touched, self.adapt.is_some(), self.partition.is_some()]
            .iter()
            .filter(|&&b| b)
            .count();
        match configured {
            0 => return Err(MeshForestError::config("no construction source configured")),
            1 => {}
            n => {
                return Err(MeshForestError::config(format!(
                    "{n} construction sources configured, expected exactly one"
                )));
            }
        }
        if self.weight.is_some() && self.partition.is_none() {
            return Err(MeshForestError::config(
                "partition weight set without a partition source",
            ));
        }
        let user_data = self.user_data;
        let source = if let Some((source, callback, recursive)) = self.adapt {
            Source::Adapt {
                source,
                callback,
                recursive,
            }
        } else if let Some((source, slack)) = self.partition {
            Source::Partition {
                source,
                slack,
                weight: self.weight,
            }
        } else {
            match (self.cmesh, self.schemes, self.level) {
                (Some(cmesh), Some(schemes), Some(level)) => Source::Uniform {
                    cmesh,
                    schemes,
                    level,
                },
                _ => {
                    return Err(MeshForestError::config(
                        "uniform build needs a coarse mesh, a scheme table and a level",
                    ));
                }
            }
        };
        Ok((source, user_data))
    }

    /// Materialize the configured forest. Collective over `comm`; configuration
    /// errors are returned before any message is sent.
    pub fn commit<C: Communicator>(self, comm: &C) -> Result<Forest, MeshForestError> {
        let (source, user_data) = self.into_source()?;
        let forest = match source {
            Source::Uniform {
                cmesh,
                schemes,
                level,
            } => uniform::commit_uniform(comm, cmesh, schemes, level, user_data)?,
            Source::Adapt {
                source,
                callback,
                recursive,
            } => adapt::commit_adapt(comm, &source, &callback, recursive, user_data)?,
            Source::Partition {
                source,
                slack,
                weight,
            } => partition::commit_partition(comm, &source, slack, weight.as_ref(), user_data)?,
        };
        log::debug!(
            "[rank {}] committed forest: {} local trees, {} of {} elements",
            forest.rank(),
            forest.num_local_trees(),
            forest.num_local_elements(),
            forest.num_global_elements()
        );
        Ok(forest)
    }
}

impl fmt::Debug for ForestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForestBuilder")
            .field("level", &self.level)
            .field("adapt", &self.adapt.as_ref().map(|(_, _, r)| r))
            .field("partition", &self.partition.as_ref().map(|(_, s)| s))
            .field("weighted", &self.weight.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::cmesh::CoarseMeshBuilder;
    use crate::scheme::AdaptDecision;

    fn quad_mesh(n: u64) -> CoarseMesh {
        let mut b = CoarseMeshBuilder::new();
        for i in 0..n {
            b.set_tree_class(TreeId::new(i), ElementClass::Quad);
        }
        b.commit(&NoComm).unwrap()
    }

    fn uniform(level: u8) -> Forest {
        let mut b = ForestBuilder::new();
        b.set_cmesh(&quad_mesh(2))
            .set_scheme(SchemeTable::hypercube())
            .set_level(level);
        b.commit(&NoComm).unwrap()
    }

    #[test]
    fn zero_sources_is_a_configuration_error() {
        let err = ForestBuilder::new().commit(&NoComm).unwrap_err();
        assert!(matches!(err, MeshForestError::Configuration(_)));
    }

    #[test]
    fn two_sources_is_a_configuration_error() {
        let src = uniform(1);
        let keep = adapt_fn(|_, _, _, _| AdaptDecision::Keep);
        let mut b = ForestBuilder::new();
        b.set_adapt(&src, keep, false).set_partition(&src, false);
        assert!(matches!(
            b.commit(&NoComm),
            Err(MeshForestError::Configuration(_))
        ));

        let mut b = ForestBuilder::new();
        b.set_level(1).set_partition(&src, false);
        assert!(matches!(
            b.commit(&NoComm),
            Err(MeshForestError::Configuration(_))
        ));
    }

    #[test]
    fn incomplete_uniform_configuration_is_rejected() {
        let mut b = ForestBuilder::new();
        b.set_cmesh(&quad_mesh(1)).set_level(2);
        assert!(matches!(
            b.commit(&NoComm),
            Err(MeshForestError::Configuration(_))
        ));
    }

    #[test]
    fn queries_on_a_uniform_forest() {
        let f = uniform(2);
        assert_eq!(f.num_local_trees(), 2);
        assert_eq!(f.num_local_elements(), 32);
        assert_eq!(f.num_global_elements(), 32);
        assert_eq!(f.first_global_element(), 0);
        assert_eq!(f.element_offsets(), &[0, 32]);
        assert_eq!(f.local_trees()[1].first_local_element, 16);
        assert_eq!(f.tree_elements(TreeId::new(1)).map(<[_]>::len), Some(16));
        assert!(f.tree_elements(TreeId::new(2)).is_none());
        let (tree, first) = f.iter_elements().next().unwrap();
        assert_eq!((tree, first.level), (TreeId::new(0), 2));
        assert!(f.fringe().is_empty());
        assert!(f.source().is_none());
    }

    #[test]
    fn user_data_is_opaque_and_inherited() {
        let src = uniform(1);
        let keep = adapt_fn(|_, _, _, _| AdaptDecision::Keep);
        let mut b = ForestBuilder::new();
        b.set_adapt(&src, keep.clone(), false)
            .set_user_data(Arc::new(String::from("payload")));
        assert_eq!(b.get_user_data::<String>().map(String::as_str), Some("payload"));
        let adapted = b.commit(&NoComm).unwrap();
        assert_eq!(adapted.user_data::<String>().map(String::as_str), Some("payload"));
        assert!(adapted.user_data::<u32>().is_none());

        let mut b = ForestBuilder::new();
        b.set_adapt(&adapted, keep, false);
        let again = b.commit(&NoComm).unwrap();
        assert_eq!(again.user_data::<String>().map(String::as_str), Some("payload"));
        assert_eq!(again.source().map(|s| s.num_local_elements()), Some(8));
    }

    #[test]
    fn forests_share_the_coarse_mesh() {
        let f = uniform(1);
        let before = f.cmesh().ref_count();
        let g = f.clone();
        assert_eq!(f.ref_count(), 2);
        assert_eq!(g.cmesh().ref_count(), before);
    }
}
