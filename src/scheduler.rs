use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use indicatif::ProgressStyle;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::assembler::Assembler;
use crate::config::SchedulerConfig;
use crate::descriptor::NodeId;
use crate::diagnostics::Diagnostics;
use crate::error::{SchedulerError, StateViolation};
use crate::kernel::{Completion, CompletionSender, Kernel, Signal};
use crate::memory::RegionArena;
use crate::queue::ReadyQueue;
use crate::store::DescriptorStore;
use crate::tracker::{Countdown, DependencyTracker};

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Lifecycle of a single front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for children.
    Pending,
    /// All children assembled, waiting for a kernel slot.
    Ready,
    /// Handed to the kernel, launch not yet acknowledged.
    Dispatched,
    Computing,
    Completed,
    /// Contribution merged into the parent; only non-root fronts get here.
    AssembledIntoParent,
    Failed,
}

impl TaskState {
    pub fn name(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Dispatched => "dispatched",
            TaskState::Computing => "computing",
            TaskState::Completed => "completed",
            TaskState::AssembledIntoParent => "assembled",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::AssembledIntoParent)
    }
}

/// What handling one completion signal led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A non-root front finished; the run goes on.
    Continue,
    /// The root finished, the tree is factorized.
    Finished,
    /// The signal repeated an earlier one and was ignored.
    Duplicate,
}

/// Drives one elimination tree from leaves to root.
///
/// The scheduler itself is single-threaded. Any fronts without an
/// ancestor/descendant relation may be in flight at the same time, and a
/// parent is dispatched only once every child has completed and been
/// assembled into it.
///
/// [`run`](Self::run) drives a whole tree against a [`Kernel`].
/// [`dispatch`](Self::dispatch) and [`handle_completion`](Self::handle_completion)
/// expose the same steps for hosts that own their own event loop.
///
/// Of the [`SchedulerConfig`], only the policy and the in-flight limit are
/// read here. Mapping checks happen when the [`DescriptorStore`] is built.
pub struct Scheduler<'a> {
    store: &'a DescriptorStore,
    arena: Arc<RegionArena>,
    tracker: DependencyTracker,
    queue: ReadyQueue,
    assembler: Assembler,
    states: Vec<TaskState>,
    finished: bool,
    diagnostics: Diagnostics,
    signal: Sender<Signal>,
    signals: Receiver<Signal>,
}

impl<'a> Scheduler<'a> {
    /// Initializes the dependency counts and enqueues every leaf.
    pub fn new(
        store: &'a DescriptorStore,
        arena: Arc<RegionArena>,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let (tracker, leaves) = DependencyTracker::initialize(store);
        let (signal, signals) = channel();

        let mut scheduler = Self {
            store,
            arena,
            tracker,
            queue: ReadyQueue::new(config.policy, config.max_in_flight),
            assembler: Assembler::new(),
            states: vec![TaskState::Pending; store.len()],
            finished: false,
            diagnostics: Diagnostics::default(),
            signal,
            signals,
        };

        for leaf in leaves {
            scheduler.make_ready(leaf)?;
        }

        Ok(scheduler)
    }

    pub fn state(&self, node: NodeId) -> Result<TaskState, SchedulerError> {
        Ok(self.states[self.store.index_of(node)?.index()])
    }

    fn set_state(&mut self, node: NodeId, state: TaskState) -> Result<(), SchedulerError> {
        let slot = self.store.index_of(node)?.index();
        tracing::debug!(node = %node, from = self.states[slot].name(), to = state.name(), "transition");
        self.states[slot] = state;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Number of children `node` is still waiting for.
    pub fn remaining_children(&self, node: NodeId) -> Result<u32, SchedulerError> {
        self.tracker.remaining(self.store, node)
    }

    fn make_ready(&mut self, node: NodeId) -> Result<(), SchedulerError> {
        let state = self.state(node)?;
        if state != TaskState::Pending {
            return Err(SchedulerError::state(node, StateViolation::DuplicateEnqueue));
        }

        self.queue.enqueue(self.store, node)?;
        self.set_state(node, TaskState::Ready)
    }

    /// Hands ready fronts to the kernel until the queue is empty or the
    /// in-flight limit is reached. Returns how many were launched.
    pub fn dispatch<K>(&mut self, kernel: &K) -> Result<usize, SchedulerError>
    where
        K: Kernel + ?Sized,
    {
        let mut launched = 0;

        while let Some(request) = self.queue.dispatch_next(self.store)? {
            let node = request.node;

            let state = self.state(node)?;
            if state != TaskState::Ready {
                return Err(SchedulerError::state(node, StateViolation::NotReady(state.name())));
            }

            self.set_state(node, TaskState::Dispatched)?;
            self.diagnostics.record_dispatch(node);

            let signal = CompletionSender::new(node, self.signal.clone());
            if let Err(source) = kernel.launch(request, signal) {
                self.set_state(node, TaskState::Failed)?;
                tracing::error!(node = %node, "kernel refused front: {source}");
                return Err(SchedulerError::KernelFailure { node, source });
            }

            self.set_state(node, TaskState::Computing)?;
            launched += 1;
        }

        Ok(launched)
    }

    /// Processes one completion signal: Extend-Add into the parent, release
    /// the parent's dependency and enqueue it if it became ready.
    ///
    /// A success signal repeated for a front that already completed is
    /// absorbed. Anything else out of order is fatal.
    pub fn handle_completion(&mut self, completion: Completion) -> Result<Progress, SchedulerError> {
        let Completion { node, outcome } = completion;
        let state = self.state(node)?;

        match (state, &outcome) {
            (TaskState::Computing, _) => {}
            (state, Ok(())) if state.is_done() => {
                tracing::warn!(node = %node, "duplicate completion signal absorbed");
                self.diagnostics.duplicates_absorbed += 1;
                return Ok(Progress::Duplicate);
            }
            (state, Err(_)) if state.is_done() => {
                return Err(SchedulerError::state(node, StateViolation::ConflictingCompletion));
            }
            (state, _) => {
                return Err(SchedulerError::state(node, StateViolation::NotLaunched(state.name())));
            }
        }

        if let Err(source) = outcome {
            self.set_state(node, TaskState::Failed)?;
            tracing::error!(node = %node, "front failed, aborting tree: {source}");
            return Err(SchedulerError::KernelFailure { node, source });
        }

        self.queue.retire(node)?;
        self.set_state(node, TaskState::Completed)?;
        self.diagnostics.record_completion(node);

        let index = self.store.index_of(node)?;
        if self.store.parent_of(index).is_none() {
            self.finished = true;
            tracing::info!(node = %node, "root front completed");
            return Ok(Progress::Finished);
        }

        let assembly = self
            .assembler
            .assemble(self.store, &self.arena, node, TaskState::Completed)?;
        self.diagnostics.record_assembly(&assembly);

        if let Some(contribution) = self.store.descriptor(index).regions.contribution {
            self.arena.release(node, contribution)?;
        }
        self.set_state(node, TaskState::AssembledIntoParent)?;

        match self.tracker.on_child_completed(self.store, node)? {
            Countdown::Ready(parent) => self.make_ready(parent)?,
            Countdown::Waiting { .. } => {}
            Countdown::Root => {
                return Err(SchedulerError::state(node, StateViolation::RootHasNoParent));
            }
        }

        Ok(Progress::Continue)
    }

    /// Takes a front whose kernel dropped every completion sender out of
    /// flight. It never completes, so neither does its parent.
    fn handle_dropped(&mut self, node: NodeId) -> Result<(), SchedulerError> {
        if !self.queue.is_in_flight(node) {
            return Ok(());
        }

        tracing::error!(node = %node, "kernel dropped the completion signal, front is lost");
        self.queue.retire(node)?;
        self.set_state(node, TaskState::Failed)
    }

    /// Runs the whole tree against `kernel` and blocks until the root front
    /// completes or the run fails.
    pub fn run<K>(mut self, kernel: &K) -> Result<Diagnostics, SchedulerError>
    where
        K: Kernel + ?Sized,
    {
        let start = Instant::now();
        let root = self.store.root().node_id;

        let root_span = tracing::span!(Level::INFO, "factorizing_tree", fronts = self.store.len());
        root_span.pb_set_length(self.store.len() as u64);
        root_span.pb_set_style(&PROGRESS_STYLE);
        root_span.pb_set_message("Factorizing fronts...");
        let _enter = root_span.enter();

        while !self.finished {
            self.dispatch(kernel)?;

            if self.queue.is_idle() {
                return Err(SchedulerError::state(root, StateViolation::Stalled));
            }

            // We hold a sender ourselves, so this never sees a disconnect.
            let signal = self
                .signals
                .recv()
                .map_err(|_| SchedulerError::state(root, StateViolation::Stalled))?;

            match signal {
                Signal::Done(completion) => match self.handle_completion(completion)? {
                    Progress::Continue | Progress::Finished => root_span.pb_inc(1),
                    Progress::Duplicate => {}
                },
                Signal::Dropped(node) => self.handle_dropped(node)?,
            }
        }

        self.diagnostics.elapsed = start.elapsed();
        tracing::info!("Factorization complete!");

        Ok(self.diagnostics)
    }
}
