use std::sync::Arc;

use thiserror::Error;

use crate::descriptor::{NodeId, RegionId};

/// Opaque failure reported by the factorization kernel for a single front.
///
/// The payload is shared so that the error can be cloned into diagnostics and
/// still be surfaced to the caller.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct KernelError(#[from] pub(crate) Arc<anyhow::Error>);

impl KernelError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(e: anyhow::Error) -> Self {
        KernelError(Arc::new(e))
    }
}

/// Fatal errors raised while scheduling an elimination tree. None of these are
/// retried; the caller decides whether to rerun the whole analysis.
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    #[error("Invalid elimination tree:\n{0}")]
    InvalidTopology(#[from] TopologyError),

    #[error("Node {node}: {violation}")]
    InvalidState {
        node: NodeId,
        violation: StateViolation,
    },

    #[error(
        "Node {child}: map entry {entry} targets parent index {index}, but parent {parent} has total_dim {limit}"
    )]
    MappingOutOfRange {
        child: NodeId,
        parent: NodeId,
        entry: usize,
        index: u32,
        limit: u16,
    },

    #[error("Kernel failed on node {node}:\n{source}")]
    KernelFailure { node: NodeId, source: KernelError },
}

impl SchedulerError {
    pub(crate) fn state(node: NodeId, violation: StateViolation) -> Self {
        SchedulerError::InvalidState { node, violation }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("descriptor store is empty")]
    Empty,

    #[error("node {0} is declared more than once")]
    DuplicateNode(NodeId),

    #[error("node {0} is not present in the descriptor store")]
    UnknownNode(NodeId),

    #[error("node {node} names parent {parent}, which is not present in the descriptor store")]
    UnknownParent { node: NodeId, parent: NodeId },

    #[error("no root node found")]
    NoRoot,

    #[error("more than one root node found: {0} and {1}")]
    MultipleRoots(NodeId, NodeId),

    #[error("cycle detected through node {0}")]
    Cycle(NodeId),

    #[error("node {node} declares {declared} children, but {actual} nodes name it as parent")]
    ChildrenCountMismatch {
        node: NodeId,
        declared: u32,
        actual: u32,
    },

    #[error("node {node} has pivot_dim {pivot} larger than total_dim {total}")]
    PivotExceedsTotal { node: NodeId, pivot: u16, total: u16 },

    #[error("node {node}: control flag '{flag}' contradicts the tree structure")]
    FlagMismatch { node: NodeId, flag: &'static str },

    #[error("node {node}: map table has {actual} entries, update_dim is {expected}")]
    MapTableLength {
        node: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("node {node}: parent_address does not match the parent's data region")]
    ParentAddressMismatch { node: NodeId },

    #[error("node {node}: required region '{role}' is missing")]
    MissingRegion { node: NodeId, role: &'static str },

    #[error("node {node}: front is {found}x{found}, total_dim is {expected}")]
    FrontShape {
        node: NodeId,
        expected: usize,
        found: usize,
    },

    #[error("node {node}: region {region} for '{role}' has the wrong kind ({found})")]
    WrongRegionKind {
        node: NodeId,
        region: RegionId,
        role: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateViolation {
    #[error("task was enqueued twice")]
    DuplicateEnqueue,

    #[error("task is not ready, current state is {0}")]
    NotReady(&'static str),

    #[error("task is already in flight")]
    AlreadyInFlight,

    #[error("task is not in flight")]
    NotInFlight,

    #[error("task was already retired")]
    AlreadyRetired,

    #[error("completion signal for a task that was never launched, current state is {0}")]
    NotLaunched(&'static str),

    #[error("failure signal received after the task had already completed")]
    ConflictingCompletion,

    #[error("task must be completed before Extend-Add, current state is {0}")]
    NotCompleted(&'static str),

    #[error("contribution was already assembled into the parent")]
    AlreadyAssembled,

    #[error("root task has no parent to assemble into")]
    RootHasNoParent,

    #[error("child completion reported twice")]
    DuplicateChildReport,

    #[error("dependency count would drop below zero")]
    CountUnderflow,

    #[error("region {0} does not belong to this task")]
    ForeignRegion(RegionId),

    #[error("region {0} was already released")]
    RegionReleased(RegionId),

    #[error("region {0} does not exist")]
    UnknownRegion(RegionId),

    #[error("region {0} lock was poisoned by a panicking writer")]
    RegionPoisoned(RegionId),

    #[error("region {region} holds {found}, expected {expected}")]
    UnexpectedLayout {
        region: RegionId,
        expected: &'static str,
        found: &'static str,
    },

    #[error("contribution block is {found}x{found}, expected {expected}x{expected}")]
    ContributionShape { expected: usize, found: usize },

    #[error("scheduler stalled: nothing ready and nothing in flight before the root completed")]
    Stalled,
}

/// Failures while decoding the fixed-width descriptor records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor table length {0} is not a whole number of records plus digest")]
    Length(usize),

    #[error("record {record}: unknown control bits {bits:#010x}")]
    UnknownControlBits { record: usize, bits: u32 },

    #[error("descriptor table digest does not match its contents")]
    Checksum,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse scheduler configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("max_in_flight must be at least 1")]
    ZeroInFlight,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Couldn't write snapshot.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't read snapshot.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
