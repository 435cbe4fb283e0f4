use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::descriptor::TaskDescriptor;
use crate::error::SnapshotError;
use crate::memory::{RegionArena, RegionData};
use crate::store::DescriptorStore;

/// A replayable copy of an analysis result: descriptors plus the contents of
/// every region, stored as CBOR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub descriptors: Vec<TaskDescriptor>,
    pub regions: Vec<RegionData>,
}

impl Snapshot {
    /// Captures the store and the current contents of the arena.
    pub fn capture(store: &DescriptorStore, arena: &RegionArena) -> Result<Self, SnapshotError> {
        Ok(Self {
            descriptors: store.iter().cloned().collect(),
            regions: arena.snapshot()?,
        })
    }

    pub fn save(&self, writer: impl Write) -> Result<(), SnapshotError> {
        ciborium::into_writer(self, writer)?;
        Ok(())
    }

    pub fn load(reader: impl Read) -> Result<Self, SnapshotError> {
        Ok(ciborium::from_reader(reader)?)
    }

    /// Rebuilds and revalidates the tree.
    pub fn restore(self, check_mappings: bool) -> Result<(DescriptorStore, RegionArena), SnapshotError> {
        let arena = RegionArena::from_regions(self.regions);
        let store = DescriptorStore::new(self.descriptors, &arena, check_mappings)?;
        Ok((store, arena))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::NodeId;
    use crate::testing::TreeBuilder;

    #[test]
    fn test_save_and_restore() {
        let (store, arena) = TreeBuilder::chain_with_fan().sparse(2).build().unwrap();

        let mut bytes = vec![];
        Snapshot::capture(&store, &arena).unwrap().save(&mut bytes).unwrap();

        let (restored, restored_arena) = Snapshot::load(bytes.as_slice())
            .unwrap()
            .restore(true)
            .unwrap();

        assert_eq!(restored.len(), store.len());
        assert_eq!(restored_arena.len(), arena.len());
        assert_eq!(restored.get(NodeId(2)), store.get(NodeId(2)));
        assert_eq!(restored.postorder(), store.postorder());
    }

    #[test]
    fn test_restore_revalidates() {
        let (store, arena) = TreeBuilder::three_node().build().unwrap();
        let mut snapshot = Snapshot::capture(&store, &arena).unwrap();
        snapshot.descriptors[0].children_count = 5;

        let err = snapshot.restore(true).unwrap_err();
        assert!(matches!(err, SnapshotError::Scheduler(_)));
    }

    #[test]
    fn test_load_garbage() {
        let err = Snapshot::load(&[0xFF, 0x00, 0x13][..]).unwrap_err();
        assert!(matches!(err, SnapshotError::Decode(_)));
    }

    #[test]
    fn test_restore_rejects_unusable_parent_front() {
        let (store, arena) = TreeBuilder::three_node().build().unwrap();
        let root_front = store.root().regions.data.unwrap();
        arena.write(NodeId(0), root_front, RegionData::Empty).unwrap();

        let err = Snapshot::capture(&store, &arena)
            .unwrap()
            .restore(true)
            .unwrap_err();

        assert!(matches!(
            err,
            SnapshotError::Scheduler(crate::error::SchedulerError::InvalidTopology(
                crate::error::TopologyError::WrongRegionKind { role: "data", .. }
            ))
        ));
    }
}
