use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{DfsPostOrder, Reversed};

use crate::config::SchedulerConfig;
use crate::descriptor::{ControlFlag, NodeId, RegionId, TaskDescriptor};
use crate::error::{SchedulerError, TopologyError};
use crate::memory::{MapTable, RegionArena, RegionData};

/// The validated elimination tree.
///
/// Every front is a node of the graph and every edge points from a child to
/// its parent, so a topological order of the graph is a valid factorization
/// order. The store is immutable once built.
#[derive(Debug)]
pub struct DescriptorStore {
    pub(crate) graph: Graph<TaskDescriptor, ()>,
    index: HashMap<NodeId, NodeIndex>,
    root: NodeIndex,
    subtree_sizes: Vec<usize>,
}

impl DescriptorStore {
    /// Validates the analysis output and builds the tree.
    ///
    /// Map tables are always checked for length. When `check_mappings` is set
    /// the parent-side indices are range-checked too, so a corrupted table is
    /// rejected before anything is dispatched; otherwise the assembler catches
    /// it right before writing.
    pub fn new(
        descriptors: Vec<TaskDescriptor>,
        arena: &RegionArena,
        check_mappings: bool,
    ) -> Result<Self, SchedulerError> {
        if descriptors.is_empty() {
            return Err(TopologyError::Empty.into());
        }

        let mut graph = Graph::with_capacity(descriptors.len(), descriptors.len());
        let mut index = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let id = descriptor.node_id;
            let node = graph.add_node(descriptor);
            if index.insert(id, node).is_some() {
                return Err(TopologyError::DuplicateNode(id).into());
            }
        }

        let mut root = None;
        for node in graph.node_indices() {
            let id = graph[node].node_id;
            match graph[node].parent_id {
                Some(parent) => {
                    let &target = index
                        .get(&parent)
                        .ok_or(TopologyError::UnknownParent { node: id, parent })?;
                    graph.add_edge(node, target, ());
                }
                None => match root {
                    None => root = Some(node),
                    Some(first) => {
                        return Err(TopologyError::MultipleRoots(graph[first].node_id, id).into());
                    }
                },
            }
        }

        let root = root.ok_or(TopologyError::NoRoot)?;

        // Children always precede their parent in this order.
        let order = petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| TopologyError::Cycle(graph[cycle.node_id()].node_id))?;

        let mut subtree_sizes = vec![1; graph.node_count()];
        for &node in &order {
            if let Some(parent) = graph.neighbors(node).next() {
                subtree_sizes[parent.index()] += subtree_sizes[node.index()];
            }
        }

        let store = Self {
            graph,
            index,
            root,
            subtree_sizes,
        };

        for node in store.graph.node_indices() {
            store.validate_node(node, arena, check_mappings)?;
        }

        tracing::debug!(
            fronts = store.len(),
            root = %store.root().node_id,
            "descriptor store validated"
        );

        Ok(store)
    }

    /// Same as [`new`](Self::new), taking the mapping check from `config`.
    pub fn from_config(
        descriptors: Vec<TaskDescriptor>,
        arena: &RegionArena,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        Self::new(descriptors, arena, config.check_mappings)
    }

    fn validate_node(
        &self,
        node: NodeIndex,
        arena: &RegionArena,
        check_mappings: bool,
    ) -> Result<(), SchedulerError> {
        let descriptor = &self.graph[node];
        let id = descriptor.node_id;
        let geometry = descriptor.geometry;

        let actual = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .count() as u32;

        if actual != descriptor.children_count {
            return Err(TopologyError::ChildrenCountMismatch {
                node: id,
                declared: descriptor.children_count,
                actual,
            }
            .into());
        }

        if geometry.pivot_dim > geometry.total_dim {
            return Err(TopologyError::PivotExceedsTotal {
                node: id,
                pivot: geometry.pivot_dim,
                total: geometry.total_dim,
            }
            .into());
        }

        if descriptor.flags.is_leaf() && !descriptor.is_leaf() {
            return Err(TopologyError::FlagMismatch {
                node: id,
                flag: ControlFlag::Leaf.name(),
            }
            .into());
        }

        if descriptor.flags.is_root() && !descriptor.is_root() {
            return Err(TopologyError::FlagMismatch {
                node: id,
                flag: ControlFlag::Root.name(),
            }
            .into());
        }

        let data = require(id, descriptor.regions.data, "data")?;
        expect_kind(arena, id, data, "data", &["dense block", "compact block", "empty"])?;

        // Extend-Add writes into the full dense front of every parent.
        if descriptor.children_count > 0 {
            expect_kind(arena, id, data, "data", &["dense block"])?;

            if let Some(RegionData::Dense(block)) = arena.get_cloned(data)
                && block.dim != usize::from(geometry.total_dim)
            {
                return Err(TopologyError::FrontShape {
                    node: id,
                    expected: usize::from(geometry.total_dim),
                    found: block.dim,
                }
                .into());
            }
        }

        let Some(parent) = self.parent_of(node) else {
            return Ok(());
        };

        if let Some(address) = descriptor.regions.parent
            && Some(address) != parent.regions.data
        {
            return Err(TopologyError::ParentAddressMismatch { node: id }.into());
        }

        let update_dim = usize::from(descriptor.update_dim());
        let table = map_table(arena, id, descriptor.regions.map_table)?;

        if table.len() != update_dim {
            return Err(TopologyError::MapTableLength {
                node: id,
                expected: update_dim,
                actual: table.len(),
            }
            .into());
        }

        if update_dim > 0 {
            require(id, descriptor.regions.contribution, "contribution")?;
        }

        if check_mappings
            && let Some((entry, index)) = table.first_out_of_range(parent.geometry.total_dim)
        {
            return Err(SchedulerError::MappingOutOfRange {
                child: id,
                parent: parent.node_id,
                entry,
                index,
                limit: parent.geometry.total_dim,
            });
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn root(&self) -> &TaskDescriptor {
        &self.graph[self.root]
    }

    pub fn get(&self, id: NodeId) -> Option<&TaskDescriptor> {
        self.index.get(&id).map(|&node| &self.graph[node])
    }

    pub(crate) fn index_of(&self, id: NodeId) -> Result<NodeIndex, SchedulerError> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| TopologyError::UnknownNode(id).into())
    }

    pub(crate) fn descriptor(&self, node: NodeIndex) -> &TaskDescriptor {
        &self.graph[node]
    }

    pub(crate) fn parent_of(&self, node: NodeIndex) -> Option<&TaskDescriptor> {
        self.graph
            .neighbors(node)
            .next()
            .map(|parent| &self.graph[parent])
    }

    /// Parent of `id`, or `None` for the root.
    pub fn parent(&self, id: NodeId) -> Result<Option<&TaskDescriptor>, SchedulerError> {
        Ok(self.parent_of(self.index_of(id)?))
    }

    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, SchedulerError> {
        let node = self.index_of(id)?;
        let mut children: Vec<_> = self
            .graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|child| self.graph[child].node_id)
            .collect();
        children.sort();
        Ok(children)
    }

    /// Number of fronts in the subtree rooted at `id`, including `id`.
    pub fn subtree_size(&self, id: NodeId) -> Result<usize, SchedulerError> {
        Ok(self.subtree_sizes[self.index_of(id)?.index()])
    }

    /// Descriptors in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.graph.node_weights()
    }

    /// Depth-first postorder from the root: every child is listed before its
    /// parent.
    pub fn postorder(&self) -> Vec<NodeId> {
        let reversed = Reversed(&self.graph);
        let mut dfs = DfsPostOrder::new(reversed, self.root);
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = dfs.next(reversed) {
            order.push(self.graph[node].node_id);
        }

        order
    }
}

fn require(
    node: NodeId,
    region: Option<RegionId>,
    role: &'static str,
) -> Result<RegionId, TopologyError> {
    region.ok_or(TopologyError::MissingRegion { node, role })
}

fn expect_kind(
    arena: &RegionArena,
    node: NodeId,
    region: RegionId,
    role: &'static str,
    allowed: &[&'static str],
) -> Result<(), TopologyError> {
    match arena.kind_of(region) {
        None => Err(TopologyError::MissingRegion { node, role }),
        Some(found) if !allowed.contains(&found) => Err(TopologyError::WrongRegionKind {
            node,
            region,
            role,
            found,
        }),
        Some(_) => Ok(()),
    }
}

fn map_table(
    arena: &RegionArena,
    node: NodeId,
    region: Option<RegionId>,
) -> Result<MapTable, TopologyError> {
    let region = require(node, region, "map_table")?;

    match arena.get_cloned(region) {
        Some(RegionData::MapTable(table)) => Ok(table),
        Some(other) => Err(TopologyError::WrongRegionKind {
            node,
            region,
            role: "map_table",
            found: other.kind(),
        }),
        None => Err(TopologyError::MissingRegion {
            node,
            role: "map_table",
        }),
    }
}

impl Display for DescriptorStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph BT")?;

        for descriptor in self.iter() {
            let mode = if descriptor.density.is_dense() {
                "dense"
            } else {
                "sparse"
            };
            writeln!(
                f,
                "    {}[\"{} {}x{} k={} {}\"]",
                descriptor.node_id.0,
                descriptor.node_id,
                descriptor.geometry.total_dim,
                descriptor.geometry.total_dim,
                descriptor.geometry.pivot_dim,
                mode,
            )?;
        }

        for descriptor in self.iter() {
            if let Some(parent) = descriptor.parent_id {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    descriptor.node_id.0,
                    descriptor.update_dim(),
                    parent.0
                )?;
            }
        }

        Ok(())
    }
}
