use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::time::{Duration, Instant};

use console::style;

use crate::assembler::Assembly;
use crate::descriptor::NodeId;
use crate::store::DescriptorStore;

#[derive(Debug, Clone)]
pub struct FrontExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Run diagnostics and kernel timings.
///
/// Returned by [`Scheduler::run`](crate::Scheduler::run). Durations are
/// measured from dispatch to the handling of the completion signal, so they
/// include queueing inside the kernel.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Per-front execution metrics.
    pub executions: HashMap<NodeId, FrontExecution>,
    /// Fronts in the order their completion was handled.
    pub completion_order: Vec<NodeId>,
    /// Number of Extend-Add operations applied.
    pub assemblies: usize,
    /// Parent entries written across all Extend-Add operations.
    pub assembled_entries: usize,
    /// Repeated completion signals that were ignored.
    pub duplicates_absorbed: usize,
    /// Wall time of the whole run.
    pub elapsed: Duration,
    dispatched: HashMap<NodeId, Instant>,
}

impl Diagnostics {
    pub(crate) fn record_dispatch(&mut self, node: NodeId) {
        self.dispatched.insert(node, Instant::now());
    }

    pub(crate) fn record_completion(&mut self, node: NodeId) {
        if let Some(start) = self.dispatched.remove(&node) {
            self.executions.insert(
                node,
                FrontExecution {
                    start,
                    duration: start.elapsed(),
                },
            );
        }
        self.completion_order.push(node);
    }

    pub(crate) fn record_assembly(&mut self, assembly: &Assembly) {
        self.assemblies += 1;
        self.assembled_entries += assembly.entries;
    }

    /// Renders the elimination tree as a Mermaid diagram, color-coded by
    /// kernel duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Never completed
    pub fn render_mermaid(&self, store: &DescriptorStore) -> String {
        let mut f = String::new();
        writeln!(f, "graph BT").unwrap();

        let times = &self.executions;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // Nothing completed
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all fronts took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for descriptor in store.iter() {
            let id = descriptor.node_id;

            let (label_extra, color_code) = match times.get(&id) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), heat(t))
                }
                None => ("pending".to_string(), "#D3D3D3".to_string()),
            };

            writeln!(
                f,
                "    {}[\"{}\\n{}x{} k={}\\n{}\"]",
                id.0,
                id,
                descriptor.geometry.total_dim,
                descriptor.geometry.total_dim,
                descriptor.geometry.pivot_dim,
                label_extra
            )
            .unwrap();
            writeln!(f, "    style {} fill:{}", id.0, color_code).unwrap();
        }

        for descriptor in store.iter() {
            if let Some(parent) = descriptor.parent_id {
                writeln!(f, "    {} --> {}", descriptor.node_id.0, parent.0).unwrap();
            }
        }

        f
    }
}

/// Green -> Yellow -> Red for `t` in `0.0..=1.0`.
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        let t_scaled = t * 2.0;
        ((255.0 * t_scaled) as u8, 255, 0)
    } else {
        let t_scaled = (t - 0.5) * 2.0;
        (255, (255.0 * (1.0 - t_scaled)) as u8, 0)
    };

    format!("#{:02X}{:02X}{:02X}", r, g, b)
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} fronts, {} extend-adds ({} entries), {} duplicate signals in {}",
            style(self.completion_order.len()).green(),
            style(self.assemblies).cyan(),
            self.assembled_entries,
            style(self.duplicates_absorbed).yellow(),
            style(format!("{:.2?}", self.elapsed)).blue(),
        )
    }
}
