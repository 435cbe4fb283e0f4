//! Per-front task descriptors as produced by the analysis phase.
//!
//! Descriptors are plain data. Raw device addresses from the analysis output
//! are represented by [`RegionId`] handles into a [`RegionArena`], and the
//! control bitfield is split into [`ControlFlags`] and [`DensityMode`]. Bit
//! positions only exist in [`crate::wire`].
//!
//! [`RegionArena`]: crate::memory::RegionArena

use std::fmt::{Display, Formatter};
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Identity of a node in the elimination tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque handle to a memory region owned by the
/// [`RegionArena`](crate::memory::RegionArena). The value `0` is reserved on
/// the wire for "no region", so handles are never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(NonZeroU64);

impl RegionId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(RegionId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub(crate) fn slot(self) -> usize {
        (self.0.get() - 1) as usize
    }

    pub(crate) fn from_slot(slot: usize) -> Self {
        RegionId(NonZeroU64::MIN.saturating_add(slot as u64))
    }
}

impl Display for RegionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Dimensions of a frontal matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Order of the (square) frontal matrix.
    pub total_dim: u16,
    /// Number of pivot rows/columns eliminated by the kernel.
    pub pivot_dim: u16,
}

impl Geometry {
    pub fn new(total_dim: u16, pivot_dim: u16) -> Self {
        Self {
            total_dim,
            pivot_dim,
        }
    }

    /// Order of the Schur complement handed to the parent.
    pub fn update_dim(&self) -> u16 {
        self.total_dim.saturating_sub(self.pivot_dim)
    }

    /// `(m, n, k)` in the form the kernel expects: an `m x n` front with `k`
    /// eliminated pivots.
    pub fn mnk(&self) -> (u16, u16, u16) {
        (self.total_dim, self.total_dim, self.pivot_dim)
    }
}

/// How the kernel treats the front and how it lays out the contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DensityMode {
    /// Dense front, contiguous row-major contribution block.
    #[default]
    Dense,
    /// Block-sparse front, compressed-column contribution block.
    SparseBlock,
}

impl DensityMode {
    pub fn is_dense(self) -> bool {
        matches!(self, DensityMode::Dense)
    }
}

/// A single control flag carried by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Leaf,
    Root,
    /// Kernel should raise a completion interrupt when this front finishes.
    FinishInterrupt,
}

impl ControlFlag {
    pub fn name(self) -> &'static str {
        match self {
            ControlFlag::Leaf => "leaf",
            ControlFlag::Root => "root",
            ControlFlag::FinishInterrupt => "finish-interrupt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlFlags {
    leaf: bool,
    root: bool,
    finish_interrupt: bool,
}

impl ControlFlags {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: ControlFlag) -> Self {
        self.set(flag, true);
        self
    }

    pub fn set(&mut self, flag: ControlFlag, value: bool) {
        match flag {
            ControlFlag::Leaf => self.leaf = value,
            ControlFlag::Root => self.root = value,
            ControlFlag::FinishInterrupt => self.finish_interrupt = value,
        }
    }

    pub fn contains(&self, flag: ControlFlag) -> bool {
        match flag {
            ControlFlag::Leaf => self.leaf,
            ControlFlag::Root => self.root,
            ControlFlag::FinishInterrupt => self.finish_interrupt,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn raises_interrupt(&self) -> bool {
        self.finish_interrupt
    }
}

/// Precision and threshold policy for the kernel. The meaning of the bits is
/// owned by the kernel, so the value is passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigFlags(pub u32);

/// Memory handles of a front. `None` means the analysis phase did not
/// allocate that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionHandles {
    /// Frontal matrix, `total_dim x total_dim`.
    pub data: Option<RegionId>,
    /// The parent's frontal matrix, as recorded by the analysis phase.
    pub parent: Option<RegionId>,
    pub l_factor: Option<RegionId>,
    pub u_factor: Option<RegionId>,
    /// Child-to-parent index mapping used by Extend-Add.
    pub map_table: Option<RegionId>,
    /// Where the kernel writes the Schur complement.
    pub contribution: Option<RegionId>,
    /// Where the kernel writes pivot information.
    pub piv_vector: Option<RegionId>,
}

impl RegionHandles {
    pub fn iter(&self) -> impl Iterator<Item = RegionId> {
        [
            self.data,
            self.parent,
            self.l_factor,
            self.u_factor,
            self.map_table,
            self.contribution,
            self.piv_vector,
        ]
        .into_iter()
        .flatten()
    }

    /// Whether `region` is one of these handles.
    pub fn contains(&self, region: RegionId) -> bool {
        self.iter().any(|id| id == region)
    }
}

/// Everything the scheduler knows about one front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub node_id: NodeId,
    /// `None` for the root.
    pub parent_id: Option<NodeId>,
    /// Number of children, and therefore the initial dependency count.
    pub children_count: u32,
    pub geometry: Geometry,
    pub regions: RegionHandles,
    pub flags: ControlFlags,
    pub density: DensityMode,
    pub config: ConfigFlags,
}

impl TaskDescriptor {
    pub fn new(node_id: NodeId, parent_id: Option<NodeId>, geometry: Geometry) -> Self {
        Self {
            node_id,
            parent_id,
            children_count: 0,
            geometry,
            regions: RegionHandles::default(),
            flags: ControlFlags::empty(),
            density: DensityMode::Dense,
            config: ConfigFlags::default(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children_count == 0
    }

    pub fn update_dim(&self) -> u16 {
        self.geometry.update_dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_dim() {
        assert_eq!(Geometry::new(4, 2).update_dim(), 2);
        assert_eq!(Geometry::new(8, 8).update_dim(), 0);
        assert_eq!(Geometry::new(6, 1).mnk(), (6, 6, 1));
    }

    #[test]
    fn test_region_slots() {
        let region = RegionId::from_slot(0);
        assert_eq!(region.get(), 1);
        assert_eq!(region.slot(), 0);
        assert_eq!(RegionId::new(0), None);
        assert_eq!(RegionId::new(7).map(RegionId::slot), Some(6));
    }

    #[test]
    fn test_control_flags() {
        let flags = ControlFlags::empty()
            .with(ControlFlag::Leaf)
            .with(ControlFlag::FinishInterrupt);

        assert!(flags.is_leaf());
        assert!(!flags.is_root());
        assert!(flags.raises_interrupt());
        assert!(flags.contains(ControlFlag::Leaf));
        assert!(!flags.contains(ControlFlag::Root));
    }
}
