//! Extend-Add: merging a finished child's Schur complement into its parent.
//!
//! The child's map table sends its `i`-th update row and column to parent
//! row and column `map[i]`, so contribution entry `(i, j)` is added to parent
//! entry `(map[i], map[j])`. Addition makes the final parent independent of
//! the order in which siblings are merged.

use std::collections::HashSet;

use crate::descriptor::{DensityMode, NodeId, RegionId, TaskDescriptor};
use crate::error::{SchedulerError, StateViolation, TopologyError};
use crate::memory::{MapTable, RegionArena, RegionData};
use crate::scheduler::TaskState;
use crate::store::DescriptorStore;

/// What a single Extend-Add did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assembly {
    pub child: NodeId,
    pub parent: NodeId,
    /// Number of parent entries that received a value.
    pub entries: usize,
}

/// Applies Extend-Add and remembers which children were already merged, so
/// that no contribution is ever counted twice.
#[derive(Debug, Default)]
pub struct Assembler {
    assembled: HashSet<NodeId>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_assembled(&self, child: NodeId) -> bool {
        self.assembled.contains(&child)
    }

    /// Merges the contribution of `child` into its parent's frontal matrix.
    ///
    /// `state` is the child's current lifecycle state and must be
    /// [`TaskState::Completed`]. The parent's region stays locked for the
    /// whole merge. On any error the parent region is left untouched.
    pub fn assemble(
        &mut self,
        store: &DescriptorStore,
        arena: &RegionArena,
        child: NodeId,
        state: TaskState,
    ) -> Result<Assembly, SchedulerError> {
        if self.assembled.contains(&child) {
            return Err(SchedulerError::state(child, StateViolation::AlreadyAssembled));
        }
        if state != TaskState::Completed {
            return Err(SchedulerError::state(
                child,
                StateViolation::NotCompleted(state.name()),
            ));
        }

        let descriptor = store
            .get(child)
            .ok_or(TopologyError::UnknownNode(child))?;
        let parent = store
            .parent(child)?
            .ok_or_else(|| SchedulerError::state(child, StateViolation::RootHasNoParent))?;

        let table = load_map_table(arena, descriptor)?;

        let update_dim = usize::from(descriptor.update_dim());
        if table.len() != update_dim {
            return Err(TopologyError::MapTableLength {
                node: child,
                expected: update_dim,
                actual: table.len(),
            }
            .into());
        }

        if let Some((entry, index)) = table.first_out_of_range(parent.geometry.total_dim) {
            tracing::error!(child = %child, parent = %parent.node_id, entry, index, "map table out of range");
            return Err(SchedulerError::MappingOutOfRange {
                child,
                parent: parent.node_id,
                entry,
                index,
                limit: parent.geometry.total_dim,
            });
        }

        let entries = match descriptor.regions.contribution {
            Some(region) if !table.is_empty() => {
                extend_add(arena, descriptor, parent, region, &table)?
            }
            _ => 0,
        };

        self.assembled.insert(child);

        tracing::debug!(child = %child, parent = %parent.node_id, entries, "extend-add applied");

        Ok(Assembly {
            child,
            parent: parent.node_id,
            entries,
        })
    }
}

fn load_map_table(
    arena: &RegionArena,
    descriptor: &TaskDescriptor,
) -> Result<MapTable, SchedulerError> {
    let node = descriptor.node_id;
    let region = descriptor.regions.map_table.ok_or(
        TopologyError::MissingRegion {
            node,
            role: "map_table",
        },
    )?;

    match &*arena.lock(node, region)? {
        RegionData::MapTable(table) => Ok(table.clone()),
        other => Err(SchedulerError::state(
            node,
            StateViolation::UnexpectedLayout {
                region,
                expected: "map table",
                found: other.kind(),
            },
        )),
    }
}

fn extend_add(
    arena: &RegionArena,
    child: &TaskDescriptor,
    parent: &TaskDescriptor,
    contribution: RegionId,
    table: &MapTable,
) -> Result<usize, SchedulerError> {
    let node = child.node_id;
    let update_dim = usize::from(child.update_dim());
    let map = &table.parent_indices;

    let target = parent.regions.data.ok_or(TopologyError::MissingRegion {
        node: parent.node_id,
        role: "data",
    })?;

    let source = arena.lock(node, contribution)?;

    let updates: Vec<(usize, usize, f64)> = match (&*source, child.density) {
        (RegionData::Dense(block), DensityMode::Dense) => {
            if block.dim != update_dim || block.values.len() != update_dim * update_dim {
                return Err(SchedulerError::state(
                    node,
                    StateViolation::ContributionShape {
                        expected: update_dim,
                        found: block.dim,
                    },
                ));
            }

            (0..update_dim)
                .flat_map(|i| (0..update_dim).map(move |j| (i, j)))
                .map(|(i, j)| (map[i] as usize, map[j] as usize, block.get(i, j)))
                .collect()
        }
        (RegionData::Compact(block), DensityMode::SparseBlock) => {
            if block.dim != update_dim || !block.is_well_formed() {
                return Err(SchedulerError::state(
                    node,
                    StateViolation::ContributionShape {
                        expected: update_dim,
                        found: block.dim,
                    },
                ));
            }

            block
                .entries()
                .map(|(i, j, value)| (map[i] as usize, map[j] as usize, value))
                .collect()
        }
        (other, density) => {
            return Err(SchedulerError::state(
                node,
                StateViolation::UnexpectedLayout {
                    region: contribution,
                    expected: match density {
                        DensityMode::Dense => "dense block",
                        DensityMode::SparseBlock => "compact block",
                    },
                    found: other.kind(),
                },
            ));
        }
    };

    drop(source);

    let mut guard = arena.lock(parent.node_id, target)?;
    let found = guard.kind();
    let RegionData::Dense(front) = &mut *guard else {
        return Err(SchedulerError::state(
            parent.node_id,
            StateViolation::UnexpectedLayout {
                region: target,
                expected: "dense block",
                found,
            },
        ));
    };

    let total_dim = usize::from(parent.geometry.total_dim);
    if front.dim != total_dim {
        return Err(SchedulerError::state(
            parent.node_id,
            StateViolation::ContributionShape {
                expected: total_dim,
                found: front.dim,
            },
        ));
    }

    for &(row, col, value) in &updates {
        front.add(row, col, value);
    }

    Ok(updates.len())
}
