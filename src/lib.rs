#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod assembler;
mod config;
mod descriptor;
mod diagnostics;
mod error;
pub mod kernel;
#[cfg(feature = "logging")]
mod logging;
mod memory;
mod queue;
mod scheduler;
mod snapshot;
mod store;
#[cfg(test)]
mod testing;
mod tracker;
pub mod wire;

pub use crate::assembler::{Assembler, Assembly};
pub use crate::config::SchedulerConfig;
pub use crate::descriptor::{
    ConfigFlags, ControlFlag, ControlFlags, DensityMode, Geometry, NodeId, RegionHandles,
    RegionId, TaskDescriptor,
};
pub use crate::diagnostics::{Diagnostics, FrontExecution};
pub use crate::error::*;
pub use crate::kernel::{Completion, CompletionSender, FrontContext, Kernel, ThreadPoolKernel};
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::memory::{CompactBlock, DenseBlock, MapTable, RegionArena, RegionData};
pub use crate::queue::{DispatchPolicy, DispatchRequest, ReadyQueue};
pub use crate::scheduler::{Progress, Scheduler, TaskState};
pub use crate::snapshot::Snapshot;
pub use crate::store::DescriptorStore;
pub use crate::tracker::{Countdown, DependencyTracker};
pub use crate::wire::{Endian, WireConfig};
