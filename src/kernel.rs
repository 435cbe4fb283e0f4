//! The boundary to the factorization unit.
//!
//! The scheduler never factors anything itself. It hands a [`DispatchRequest`]
//! to a [`Kernel`] and waits for a [`Completion`] to come back through the
//! channel it supplied. How the request reaches the hardware is up to the
//! implementation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use tracing::Level;

use crate::descriptor::{NodeId, RegionId};
use crate::error::{KernelError, SchedulerError, StateViolation, TopologyError};
use crate::memory::{RegionArena, RegionData};
pub use crate::queue::DispatchRequest;

/// Completion signal for a single front.
#[derive(Debug, Clone)]
pub struct Completion {
    pub node: NodeId,
    pub outcome: Result<(), KernelError>,
}

impl Completion {
    pub fn success(node: NodeId) -> Self {
        Self {
            node,
            outcome: Ok(()),
        }
    }

    pub fn failure(node: NodeId, err: impl Into<anyhow::Error>) -> Self {
        Self {
            node,
            outcome: Err(KernelError::new(err)),
        }
    }
}

/// What travels from the kernel back to the scheduler.
#[derive(Debug)]
pub(crate) enum Signal {
    Done(Completion),
    /// Every sender for a launch was dropped without reporting anything.
    Dropped(NodeId),
}

/// Channel end the kernel uses to report the completion of one launch.
///
/// It may be cloned and moved to other threads, and delivering a signal
/// more than once is allowed; the scheduler absorbs repeats. Dropping every
/// clone without sending anything tells the scheduler the front was lost.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    node: NodeId,
    tx: Sender<Signal>,
    watch: Arc<Watch>,
}

#[derive(Debug)]
struct Watch {
    node: NodeId,
    tx: Sender<Signal>,
    signalled: AtomicBool,
}

impl Drop for Watch {
    fn drop(&mut self) {
        if !*self.signalled.get_mut() {
            // Nobody is listening any more if this fails.
            let _ = self.tx.send(Signal::Dropped(self.node));
        }
    }
}

impl CompletionSender {
    pub(crate) fn new(node: NodeId, tx: Sender<Signal>) -> Self {
        Self {
            node,
            tx: tx.clone(),
            watch: Arc::new(Watch {
                node,
                tx,
                signalled: AtomicBool::new(false),
            }),
        }
    }

    /// The front this sender was handed out for.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Reports a completion. Fails only if the scheduler is gone.
    pub fn send(&self, completion: Completion) -> Result<(), KernelError> {
        self.watch.signalled.store(true, Ordering::Release);
        self.tx.send(Signal::Done(completion)).map_err(|_| {
            KernelError::new(anyhow::anyhow!("scheduler dropped the completion channel"))
        })
    }
}

/// Something that can factor fronts.
///
/// `launch` must return promptly: the front is processed asynchronously and
/// its completion is reported through `signal`. Returning an error means the
/// kernel refused the request, and no completion will follow.
pub trait Kernel {
    fn launch(&self, request: DispatchRequest, signal: CompletionSender) -> Result<(), KernelError>;
}

/// The view of memory a front routine gets while its front is computing.
pub struct FrontContext<'a> {
    pub request: &'a DispatchRequest,
    arena: &'a RegionArena,
}

impl<'a> FrontContext<'a> {
    /// Contents of one of the front's own regions. Handles that are not in
    /// the request are refused.
    pub fn read(&self, region: RegionId) -> Result<RegionData, SchedulerError> {
        let node = self.request.node;
        if !self.request.regions.contains(region) {
            return Err(SchedulerError::state(node, StateViolation::ForeignRegion(region)));
        }
        Ok(self.arena.lock(node, region)?.clone())
    }

    /// Current frontal matrix, including everything assembled from children.
    pub fn front(&self) -> Result<RegionData, SchedulerError> {
        let region = self.request.regions.data.ok_or(TopologyError::MissingRegion {
            node: self.request.node,
            role: "data",
        })?;
        self.read(region)
    }

    /// Stores the Schur complement for the parent. Does nothing for fronts
    /// without a contribution region.
    pub fn write_contribution(&self, data: RegionData) -> Result<(), SchedulerError> {
        match self.request.regions.contribution {
            Some(region) => self.arena.write(self.request.node, region, data),
            None => Ok(()),
        }
    }

    pub fn write_pivots(&self, pivots: Vec<u32>) -> Result<(), SchedulerError> {
        match self.request.regions.piv_vector {
            Some(region) => self
                .arena
                .write(self.request.node, region, RegionData::Pivots(pivots)),
            None => Ok(()),
        }
    }
}

/// Runs a front routine on the rayon thread pool, one job per front.
///
/// This is the reference [`Kernel`] for hosts that emulate the factorization
/// unit in software, and the one the test suite drives. Panics inside the
/// routine are reported as kernel failures.
pub struct ThreadPoolKernel<F> {
    arena: Arc<RegionArena>,
    routine: Arc<F>,
}

impl<F> ThreadPoolKernel<F>
where
    F: Fn(&FrontContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(arena: Arc<RegionArena>, routine: F) -> Self {
        Self {
            arena,
            routine: Arc::new(routine),
        }
    }
}

impl<F> Kernel for ThreadPoolKernel<F>
where
    F: Fn(&FrontContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn launch(&self, request: DispatchRequest, signal: CompletionSender) -> Result<(), KernelError> {
        let arena = self.arena.clone();
        let routine = self.routine.clone();

        rayon::spawn(move || {
            let span = tracing::span!(Level::INFO, "front", node = %request.node);
            let _enter = span.enter();

            let context = FrontContext {
                request: &request,
                arena: &arena,
            };

            // Regions are only reachable through their locks; a panic mid-write
            // poisons the lock and surfaces on the next access.
            let outcome = match catch_unwind(AssertUnwindSafe(|| routine(&context))) {
                Ok(result) => result.map_err(KernelError::from),
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Front routine panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Front routine panicked: {s}")
                    } else {
                        String::from("Front routine panicked with unknown payload")
                    };

                    Err(KernelError::new(anyhow::anyhow!(msg)))
                }
            };

            // The scheduler may have aborted and dropped the receiver.
            if signal
                .send(Completion {
                    node: request.node,
                    outcome,
                })
                .is_err()
            {
                tracing::debug!("completion dropped, scheduler is gone");
            }
        });

        Ok(())
    }
}
