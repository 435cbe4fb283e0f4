//! Owned memory regions addressed by [`RegionId`].
//!
//! The arena stands in for the device memory the analysis phase allocates.
//! Every region sits behind its own lock: a frontal matrix is written by the
//! kernel while its task is computing and, later, by each child in turn during
//! Extend-Add. The arena never grows once it is shared.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::descriptor::{NodeId, RegionId};
use crate::error::{SchedulerError, StateViolation};

/// Square block stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseBlock {
    pub dim: usize,
    pub values: Vec<f64>,
}

impl DenseBlock {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            values: vec![0.0; dim * dim],
        }
    }

    /// Builds a block from row-major values. Returns `None` if the value count
    /// doesn't match `dim * dim`.
    pub fn from_rows(dim: usize, values: Vec<f64>) -> Option<Self> {
        (values.len() == dim * dim).then_some(Self { dim, values })
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.dim + col]
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        self.values[row * self.dim + col] += value;
    }
}

/// Square block in compressed-column form. Positions that are not listed are
/// structural zeros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactBlock {
    pub dim: usize,
    /// `dim + 1` offsets into `row_indices` / `values`.
    pub col_ptrs: Vec<usize>,
    pub row_indices: Vec<u32>,
    pub values: Vec<f64>,
}

impl CompactBlock {
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            col_ptrs: vec![0; dim + 1],
            row_indices: vec![],
            values: vec![],
        }
    }

    /// Packs the non-zero entries of a dense block.
    pub fn from_dense(block: &DenseBlock) -> Self {
        let mut compact = Self::empty(block.dim);

        for col in 0..block.dim {
            for row in 0..block.dim {
                let value = block.get(row, col);
                if value != 0.0 {
                    compact.row_indices.push(row as u32);
                    compact.values.push(value);
                }
            }
            compact.col_ptrs[col + 1] = compact.values.len();
        }

        compact
    }

    /// Checks that the structure arrays are consistent with `dim`.
    pub fn is_well_formed(&self) -> bool {
        self.col_ptrs.len() == self.dim + 1
            && self.col_ptrs.first() == Some(&0)
            && self.col_ptrs.windows(2).all(|w| w[0] <= w[1])
            && self.col_ptrs.last() == Some(&self.values.len())
            && self.row_indices.len() == self.values.len()
            && self.row_indices.iter().all(|&row| (row as usize) < self.dim)
    }

    /// Iterates `(row, col, value)` over the stored entries.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.col_ptrs.windows(2).enumerate().flat_map(move |(col, w)| {
            (w[0]..w[1]).map(move |k| (self.row_indices[k] as usize, col, self.values[k]))
        })
    }
}

/// Ordered child-to-parent index mapping. Entry `i` holds the parent-local
/// index of the child's `i`-th update row (and column).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapTable {
    pub parent_indices: Vec<u32>,
}

impl MapTable {
    pub fn new(parent_indices: Vec<u32>) -> Self {
        Self { parent_indices }
    }

    pub fn len(&self) -> usize {
        self.parent_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_indices.is_empty()
    }

    /// `(child_index, parent_index)` pairs in table order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.parent_indices.iter().copied().enumerate()
    }

    /// First entry whose parent index falls outside `limit`.
    pub fn first_out_of_range(&self, limit: u16) -> Option<(usize, u32)> {
        self.entries().find(|&(_, index)| index >= u32::from(limit))
    }
}

/// Contents of a single region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionData {
    /// Allocated but not written yet.
    Empty,
    Dense(DenseBlock),
    Compact(CompactBlock),
    MapTable(MapTable),
    Pivots(Vec<u32>),
    /// Returned to the pool; any further access is a scheduler bug.
    Released,
}

impl RegionData {
    pub fn kind(&self) -> &'static str {
        match self {
            RegionData::Empty => "empty",
            RegionData::Dense(_) => "dense block",
            RegionData::Compact(_) => "compact block",
            RegionData::MapTable(_) => "map table",
            RegionData::Pivots(_) => "pivot vector",
            RegionData::Released => "released",
        }
    }
}

#[derive(Debug, Default)]
pub struct RegionArena {
    regions: Vec<Mutex<RegionData>>,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an arena from a list of region contents; slot `i` gets handle
    /// `i + 1`.
    pub fn from_regions(regions: Vec<RegionData>) -> Self {
        Self {
            regions: regions.into_iter().map(Mutex::new).collect(),
        }
    }

    pub fn insert(&mut self, data: RegionData) -> RegionId {
        let id = RegionId::from_slot(self.regions.len());
        self.regions.push(Mutex::new(data));
        id
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Locks a region for exclusive access. `node` is only used to attribute
    /// errors.
    pub fn lock(
        &self,
        node: NodeId,
        id: RegionId,
    ) -> Result<MutexGuard<'_, RegionData>, SchedulerError> {
        let region = self
            .regions
            .get(id.slot())
            .ok_or_else(|| SchedulerError::state(node, StateViolation::UnknownRegion(id)))?;

        let guard = region
            .lock()
            .map_err(|_| SchedulerError::state(node, StateViolation::RegionPoisoned(id)))?;

        if matches!(*guard, RegionData::Released) {
            return Err(SchedulerError::state(
                node,
                StateViolation::RegionReleased(id),
            ));
        }

        Ok(guard)
    }

    /// Replaces the contents of a region, e.g. when the kernel writes a
    /// contribution block.
    pub fn write(&self, node: NodeId, id: RegionId, data: RegionData) -> Result<(), SchedulerError> {
        *self.lock(node, id)? = data;
        Ok(())
    }

    /// Returns a region to the pool, dropping its contents.
    pub fn release(&self, node: NodeId, id: RegionId) -> Result<(), SchedulerError> {
        *self.lock(node, id)? = RegionData::Released;
        Ok(())
    }

    /// Copy of a region's contents, or `None` if the handle is unknown.
    pub fn get_cloned(&self, id: RegionId) -> Option<RegionData> {
        let region = self.regions.get(id.slot())?;
        region.lock().ok().map(|data| data.clone())
    }

    pub fn kind_of(&self, id: RegionId) -> Option<&'static str> {
        let region = self.regions.get(id.slot())?;
        region.lock().ok().map(|data| data.kind())
    }

    /// Clones every region, in slot order.
    pub(crate) fn snapshot(&self) -> Result<Vec<RegionData>, SchedulerError> {
        self.regions
            .iter()
            .enumerate()
            .map(|(slot, region)| {
                region.lock().map(|data| data.clone()).map_err(|_| {
                    SchedulerError::state(
                        NodeId(u32::MAX),
                        StateViolation::RegionPoisoned(RegionId::from_slot(slot)),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_from_dense() {
        let dense = DenseBlock::from_rows(2, vec![1.0, 0.0, 3.0, 4.0]).unwrap();
        let compact = CompactBlock::from_dense(&dense);

        assert!(compact.is_well_formed());
        assert_eq!(compact.col_ptrs, vec![0, 2, 3]);

        let entries: Vec<_> = compact.entries().collect();
        assert_eq!(entries, vec![(0, 0, 1.0), (1, 0, 3.0), (1, 1, 4.0)]);
    }

    #[test]
    fn test_compact_malformed() {
        let mut compact = CompactBlock::empty(2);
        compact.row_indices.push(5);
        compact.values.push(1.0);
        compact.col_ptrs = vec![0, 1, 1];

        assert!(!compact.is_well_formed());
    }

    #[test]
    fn test_map_table_range() {
        let table = MapTable::new(vec![0, 3, 10]);
        assert_eq!(table.first_out_of_range(8), Some((2, 10)));
        assert_eq!(table.first_out_of_range(11), None);
    }

    #[test]
    fn test_release_blocks_access() {
        let mut arena = RegionArena::new();
        let id = arena.insert(RegionData::Dense(DenseBlock::zeros(2)));
        let node = NodeId(1);

        arena.release(node, id).unwrap();

        let err = arena.lock(node, id).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidState {
                violation: StateViolation::RegionReleased(_),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_region() {
        let arena = RegionArena::new();
        let id = RegionId::new(3).unwrap();

        assert!(arena.lock(NodeId(0), id).is_err());
        assert_eq!(arena.kind_of(id), None);
    }
}
