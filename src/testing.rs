//! Tree fixtures shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::descriptor::{DensityMode, Geometry, NodeId, TaskDescriptor};
use crate::error::{KernelError, SchedulerError};
use crate::kernel::{CompletionSender, DispatchRequest, FrontContext, Kernel};
use crate::memory::{CompactBlock, DenseBlock, MapTable, RegionArena, RegionData};
use crate::store::DescriptorStore;

type Patch = Box<dyn FnOnce(&mut TaskDescriptor)>;

/// Builds a descriptor store and a matching arena. Children counts, parent
/// addresses and all regions are filled in automatically; map tables default
/// to `0..update_dim`.
pub(crate) struct TreeBuilder {
    fronts: Vec<TaskDescriptor>,
    maps: HashMap<u32, Vec<u32>>,
    data: HashMap<u32, RegionData>,
    patches: Vec<(u32, Patch)>,
    check_mappings: bool,
}

impl TreeBuilder {
    pub(crate) fn new() -> Self {
        Self {
            fronts: vec![],
            maps: HashMap::new(),
            data: HashMap::new(),
            patches: vec![],
            check_mappings: true,
        }
    }

    /// Root `0` with leaves `1` (maps to `[0, 2]`) and `2` (maps to `[2, 3]`),
    /// all `4x4`; the leaves eliminate 2 pivots.
    pub(crate) fn three_node() -> Self {
        Self::new()
            .front(0, None, Geometry::new(4, 4))
            .front(1, Some(0), Geometry::new(4, 2))
            .front(2, Some(0), Geometry::new(4, 2))
            .map_table(1, vec![0, 2])
            .map_table(2, vec![2, 3])
    }

    /// ```text
    ///        0 (6x6)
    ///       /      \
    ///   1 (5x5)   4 (3x3)
    ///   /    \
    /// 2 (4x4) 3 (4x4)
    /// ```
    pub(crate) fn chain_with_fan() -> Self {
        Self::new()
            .front(0, None, Geometry::new(6, 6))
            .front(1, Some(0), Geometry::new(5, 2))
            .front(2, Some(1), Geometry::new(4, 2))
            .front(3, Some(1), Geometry::new(4, 2))
            .front(4, Some(0), Geometry::new(3, 1))
    }

    pub(crate) fn front(mut self, id: u32, parent: Option<u32>, geometry: Geometry) -> Self {
        self.fronts
            .push(TaskDescriptor::new(NodeId(id), parent.map(NodeId), geometry));
        self
    }

    pub(crate) fn map_table(mut self, id: u32, parent_indices: Vec<u32>) -> Self {
        self.maps.insert(id, parent_indices);
        self
    }

    /// Replaces the zeroed dense front allocated for `id`.
    pub(crate) fn data(mut self, id: u32, data: RegionData) -> Self {
        self.data.insert(id, data);
        self
    }

    pub(crate) fn sparse(self, id: u32) -> Self {
        self.with_descriptor(id, |d| d.density = DensityMode::SparseBlock)
    }

    pub(crate) fn check_mappings(mut self, check: bool) -> Self {
        self.check_mappings = check;
        self
    }

    /// Applied after the automatic fill-in.
    pub(crate) fn with_descriptor(
        mut self,
        id: u32,
        patch: impl FnOnce(&mut TaskDescriptor) + 'static,
    ) -> Self {
        self.patches.push((id, Box::new(patch)));
        self
    }

    pub(crate) fn build(self) -> Result<(DescriptorStore, RegionArena), SchedulerError> {
        let mut arena = RegionArena::new();
        let mut fronts = self.fronts;
        let mut data = self.data;

        for i in 0..fronts.len() {
            let children = fronts
                .iter()
                .filter(|d| d.parent_id == Some(fronts[i].node_id))
                .count() as u32;

            let front = &mut fronts[i];
            let total = usize::from(front.geometry.total_dim);
            let update = front.update_dim();

            front.children_count = children;
            let front_data = data
                .remove(&front.node_id.0)
                .unwrap_or_else(|| RegionData::Dense(DenseBlock::zeros(total)));
            front.regions.data = Some(arena.insert(front_data));
            front.regions.l_factor = Some(arena.insert(RegionData::Empty));
            front.regions.u_factor = Some(arena.insert(RegionData::Empty));
            front.regions.piv_vector = Some(arena.insert(RegionData::Empty));

            if front.parent_id.is_some() {
                let map = self
                    .maps
                    .get(&front.node_id.0)
                    .cloned()
                    .unwrap_or_else(|| (0..u32::from(update)).collect());
                front.regions.map_table =
                    Some(arena.insert(RegionData::MapTable(MapTable::new(map))));
                front.regions.contribution = Some(arena.insert(RegionData::Empty));
            }
        }

        let addresses: HashMap<NodeId, _> =
            fronts.iter().map(|d| (d.node_id, d.regions.data)).collect();
        for front in &mut fronts {
            if let Some(parent) = front.parent_id {
                front.regions.parent = addresses.get(&parent).copied().flatten();
            }
        }

        for (id, patch) in self.patches {
            if let Some(front) = fronts.iter_mut().find(|d| d.node_id == NodeId(id)) {
                patch(front);
            }
        }

        let store = DescriptorStore::new(fronts, &arena, self.check_mappings)?;
        Ok((store, arena))
    }
}

/// Copy of the frontal matrix of `id`.
pub(crate) fn front_values(arena: &RegionArena, store: &DescriptorStore, id: u32) -> DenseBlock {
    let region = store.get(NodeId(id)).unwrap().regions.data.unwrap();
    match arena.get_cloned(region) {
        Some(RegionData::Dense(block)) => block,
        other => panic!("front {id} is not dense: {other:?}"),
    }
}

/// Writes `node_id + 1` into every entry of the contribution block, in the
/// layout the front's density mode asks for.
pub(crate) fn fill_contribution(ctx: &FrontContext<'_>) -> anyhow::Result<()> {
    let request = ctx.request;
    let dim = usize::from(request.geometry.update_dim());
    let value = f64::from(request.node.0 + 1);
    let block = DenseBlock {
        dim,
        values: vec![value; dim * dim],
    };

    let data = match request.density {
        DensityMode::Dense => RegionData::Dense(block),
        DensityMode::SparseBlock => RegionData::Compact(CompactBlock::from_dense(&block)),
    };

    ctx.write_contribution(data)?;
    ctx.write_pivots((0..u32::from(request.geometry.pivot_dim)).collect())?;
    Ok(())
}

/// Kernel that only records launches. Tests finish fronts by hand and feed
/// the completion to the scheduler themselves.
pub(crate) struct ManualKernel {
    arena: Arc<RegionArena>,
    launched: Mutex<Vec<DispatchRequest>>,
}

impl ManualKernel {
    pub(crate) fn new(arena: Arc<RegionArena>) -> Self {
        Self {
            arena,
            launched: Mutex::new(vec![]),
        }
    }

    pub(crate) fn launched(&self) -> Vec<NodeId> {
        self.launched.lock().unwrap().iter().map(|r| r.node).collect()
    }

    /// Writes a dense contribution filled with `value` for a launched front.
    pub(crate) fn finish(&self, node: NodeId, value: f64) {
        let launched = self.launched.lock().unwrap();
        let request = launched.iter().find(|r| r.node == node).unwrap();
        let dim = usize::from(request.geometry.update_dim());

        if let Some(region) = request.regions.contribution {
            let block = DenseBlock {
                dim,
                values: vec![value; dim * dim],
            };
            self.arena
                .write(node, region, RegionData::Dense(block))
                .unwrap();
        }
    }
}

impl Kernel for ManualKernel {
    fn launch(&self, request: DispatchRequest, _: CompletionSender) -> Result<(), KernelError> {
        self.launched.lock().unwrap().push(request);
        Ok(())
    }
}
