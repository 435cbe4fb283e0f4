use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::{ConfigFlags, DensityMode, Geometry, NodeId, RegionHandles};
use crate::error::{SchedulerError, StateViolation};
use crate::store::DescriptorStore;

/// Order in which ready fronts are handed to the kernel. Both policies are
/// deterministic for a given enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// First enqueued, first dispatched.
    #[default]
    Fifo,
    /// Largest subtree first, ties broken by enqueue order.
    LargestSubtree,
}

/// Everything the kernel needs to factor one front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub node: NodeId,
    pub geometry: Geometry,
    pub density: DensityMode,
    pub config: ConfigFlags,
    pub finish_interrupt: bool,
    pub regions: RegionHandles,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    rank: usize,
    seq: Reverse<u64>,
    node: NodeId,
}

/// Ready fronts waiting for a kernel slot, plus the set of fronts in flight.
#[derive(Debug)]
pub struct ReadyQueue {
    policy: DispatchPolicy,
    max_in_flight: Option<usize>,
    heap: BinaryHeap<Entry>,
    queued: HashSet<NodeId>,
    in_flight: HashSet<NodeId>,
    retired: HashSet<NodeId>,
    seq: u64,
}

impl ReadyQueue {
    pub fn new(policy: DispatchPolicy, max_in_flight: Option<usize>) -> Self {
        Self {
            policy,
            max_in_flight,
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            retired: HashSet::new(),
            seq: 0,
        }
    }

    /// Admits a ready front. Each front may be admitted exactly once.
    pub fn enqueue(&mut self, store: &DescriptorStore, node: NodeId) -> Result<(), SchedulerError> {
        if self.in_flight.contains(&node) {
            return Err(SchedulerError::state(node, StateViolation::AlreadyInFlight));
        }
        if self.retired.contains(&node) {
            return Err(SchedulerError::state(node, StateViolation::AlreadyRetired));
        }
        if !self.queued.insert(node) {
            return Err(SchedulerError::state(node, StateViolation::DuplicateEnqueue));
        }

        let rank = match self.policy {
            DispatchPolicy::Fifo => 0,
            DispatchPolicy::LargestSubtree => store.subtree_size(node)?,
        };

        self.heap.push(Entry {
            rank,
            seq: Reverse(self.seq),
            node,
        });
        self.seq += 1;

        Ok(())
    }

    /// Whether another front may be put in flight right now.
    pub fn has_capacity(&self) -> bool {
        self.max_in_flight
            .is_none_or(|limit| self.in_flight.len() < limit)
    }

    /// Removes the next ready front, marks it in flight and builds the kernel
    /// request for it. Returns `None` when nothing is ready or the in-flight
    /// limit is reached.
    pub fn dispatch_next(
        &mut self,
        store: &DescriptorStore,
    ) -> Result<Option<DispatchRequest>, SchedulerError> {
        if !self.has_capacity() {
            return Ok(None);
        }

        let Some(Entry { node, .. }) = self.heap.pop() else {
            return Ok(None);
        };

        self.queued.remove(&node);
        if !self.in_flight.insert(node) {
            return Err(SchedulerError::state(node, StateViolation::AlreadyInFlight));
        }

        let descriptor = store.descriptor(store.index_of(node)?);

        Ok(Some(DispatchRequest {
            node,
            geometry: descriptor.geometry,
            density: descriptor.density,
            config: descriptor.config,
            finish_interrupt: descriptor.flags.raises_interrupt(),
            regions: descriptor.regions,
        }))
    }

    /// Takes a completed front out of flight.
    pub fn retire(&mut self, node: NodeId) -> Result<(), SchedulerError> {
        if !self.in_flight.remove(&node) {
            return Err(SchedulerError::state(node, StateViolation::NotInFlight));
        }
        self.retired.insert(node);
        Ok(())
    }

    pub fn is_in_flight(&self, node: NodeId) -> bool {
        self.in_flight.contains(&node)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn ready(&self) -> usize {
        self.heap.len()
    }

    pub fn is_idle(&self) -> bool {
        self.heap.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TreeBuilder;

    fn drain(queue: &mut ReadyQueue, store: &DescriptorStore) -> Vec<NodeId> {
        let mut order = vec![];
        while let Some(request) = queue.dispatch_next(store).unwrap() {
            order.push(request.node);
        }
        order
    }

    #[test]
    fn test_fifo_order() {
        let (store, _) = TreeBuilder::chain_with_fan().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, None);

        for id in [4, 2, 3] {
            queue.enqueue(&store, NodeId(id)).unwrap();
        }

        assert_eq!(drain(&mut queue, &store), vec![NodeId(4), NodeId(2), NodeId(3)]);
        assert_eq!(queue.in_flight(), 3);
    }

    #[test]
    fn test_largest_subtree_order() {
        let (store, _) = TreeBuilder::chain_with_fan().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::LargestSubtree, None);

        // Subtree sizes: 1 -> 3, 4 -> 1, 2 -> 1
        for id in [4, 1, 2] {
            queue.enqueue(&store, NodeId(id)).unwrap();
        }

        assert_eq!(drain(&mut queue, &store), vec![NodeId(1), NodeId(4), NodeId(2)]);
    }

    #[test]
    fn test_duplicate_enqueue() {
        let (store, _) = TreeBuilder::three_node().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, None);

        queue.enqueue(&store, NodeId(1)).unwrap();
        let err = queue.enqueue(&store, NodeId(1)).unwrap_err();

        assert!(matches!(
            err,
            SchedulerError::InvalidState {
                violation: StateViolation::DuplicateEnqueue,
                ..
            }
        ));
        assert_eq!(queue.ready(), 1);
    }

    #[test]
    fn test_no_redispatch_while_in_flight() {
        let (store, _) = TreeBuilder::three_node().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, None);

        queue.enqueue(&store, NodeId(1)).unwrap();
        queue.dispatch_next(&store).unwrap();

        let err = queue.enqueue(&store, NodeId(1)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidState {
                violation: StateViolation::AlreadyInFlight,
                ..
            }
        ));

        queue.retire(NodeId(1)).unwrap();
        let err = queue.enqueue(&store, NodeId(1)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidState {
                violation: StateViolation::AlreadyRetired,
                ..
            }
        ));
    }

    #[test]
    fn test_in_flight_limit() {
        let (store, _) = TreeBuilder::three_node().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, Some(1));

        queue.enqueue(&store, NodeId(1)).unwrap();
        queue.enqueue(&store, NodeId(2)).unwrap();

        assert_eq!(queue.dispatch_next(&store).unwrap().map(|r| r.node), Some(NodeId(1)));
        assert_eq!(queue.dispatch_next(&store).unwrap(), None);

        queue.retire(NodeId(1)).unwrap();
        assert_eq!(queue.dispatch_next(&store).unwrap().map(|r| r.node), Some(NodeId(2)));
    }

    #[test]
    fn test_request_carries_descriptor_fields() {
        let (store, _) = TreeBuilder::three_node().build().unwrap();
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, None);

        queue.enqueue(&store, NodeId(2)).unwrap();
        let request = queue.dispatch_next(&store).unwrap().unwrap();
        let descriptor = store.get(NodeId(2)).unwrap();

        assert_eq!(request.geometry, Geometry::new(4, 2));
        assert_eq!(request.regions, descriptor.regions);
        assert!(request.regions.contribution.is_some());
    }

    #[test]
    fn test_retire_unknown() {
        let mut queue = ReadyQueue::new(DispatchPolicy::Fifo, None);
        assert!(queue.retire(NodeId(7)).is_err());
    }
}
