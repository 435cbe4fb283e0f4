use crate::descriptor::NodeId;
use crate::error::{SchedulerError, StateViolation};
use crate::store::DescriptorStore;

/// Outcome of reporting a finished child to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Countdown {
    /// The finished task was the root; there is nothing left to unlock.
    Root,
    /// The parent still waits on `remaining` children.
    Waiting { parent: NodeId, remaining: u32 },
    /// The last child of `parent` has finished, it can be dispatched.
    Ready(NodeId),
}

/// Live count of outstanding children for every front.
///
/// Counts start at `children_count` and only go down. Each count hits zero
/// exactly once; leaves start there.
#[derive(Debug)]
pub struct DependencyTracker {
    remaining: Vec<u32>,
    reported: Vec<bool>,
}

impl DependencyTracker {
    /// Builds the counters from the store and returns them along with the
    /// leaves, in store order.
    pub fn initialize(store: &DescriptorStore) -> (Self, Vec<NodeId>) {
        let remaining: Vec<u32> = store.iter().map(|d| d.children_count).collect();
        let leaves = store
            .iter()
            .filter(|d| d.children_count == 0)
            .map(|d| d.node_id)
            .collect();

        let tracker = Self {
            reported: vec![false; remaining.len()],
            remaining,
        };

        (tracker, leaves)
    }

    /// Number of children `id` is still waiting for.
    pub fn remaining(&self, store: &DescriptorStore, id: NodeId) -> Result<u32, SchedulerError> {
        Ok(self.remaining[store.index_of(id)?.index()])
    }

    /// Records that `child` has completed and been assembled, decrementing
    /// its parent's count.
    pub fn on_child_completed(
        &mut self,
        store: &DescriptorStore,
        child: NodeId,
    ) -> Result<Countdown, SchedulerError> {
        let node = store.index_of(child)?;

        if std::mem::replace(&mut self.reported[node.index()], true) {
            return Err(SchedulerError::state(child, StateViolation::DuplicateChildReport));
        }

        let Some(parent) = store.parent_of(node) else {
            return Ok(Countdown::Root);
        };

        let parent_id = parent.node_id;
        let slot = store.index_of(parent_id)?.index();

        let count = &mut self.remaining[slot];
        if *count == 0 {
            return Err(SchedulerError::state(parent_id, StateViolation::CountUnderflow));
        }
        *count -= 1;

        tracing::debug!(child = %child, parent = %parent_id, remaining = *count, "dependency released");

        Ok(match *count {
            0 => Countdown::Ready(parent_id),
            remaining => Countdown::Waiting {
                parent: parent_id,
                remaining,
            },
        })
    }
}
