//! Schedule bounding.
//!
//! When a bound is configured, executions that exceed it are mooted: the
//! branch is abandoned without being counted or reported. Bounds are
//! measured over the stamp order, which coincides with the schedule the
//! driver actually ran.

use crate::event::Event;
use crate::event_label::LabelEnum;
use crate::exec_graph::ExecutionGraph;
use crate::BoundType;

pub(crate) struct BoundDecider {
    btype: BoundType,
    bound: u32,
}

impl BoundDecider {
    pub(crate) fn new(btype: BoundType, bound: u32) -> Self {
        Self { btype, bound }
    }

    pub(crate) fn exceeds(&self, g: &ExecutionGraph) -> bool {
        match self.btype {
            BoundType::Context => self.count_switches(g) > self.bound,
            BoundType::Round => self.count_rounds(g) > self.bound,
        }
    }

    // Begin labels are excluded: they are added by the parent's spawn step,
    // not by scheduling the child, so they are not schedule steps.
    fn stamp_order(g: &ExecutionGraph) -> Vec<Event> {
        let mut all: Vec<Event> = g
            .threads
            .iter()
            .flat_map(|t| t.labels.iter())
            .filter(|lab| !matches!(lab, LabelEnum::Begin(_)))
            .map(|l| l.pos())
            .collect();
        all.sort_by_key(|&e| g.label(e).stamp());
        all
    }

    /// Involuntary context switches: the scheduler moved away from a thread
    /// that could still run. Switches away from a finished or blocked
    /// thread are free.
    fn count_switches(&self, g: &ExecutionGraph) -> u32 {
        let order = Self::stamp_order(g);
        let mut switches = 0;
        for w in order.windows(2) {
            let (a, b) = (w[0], w[1]);
            if a.thread == b.thread {
                continue;
            }
            let voluntary = matches!(
                g.label(a),
                LabelEnum::End(_) | LabelEnum::Block(_) | LabelEnum::TCreate(_)
            );
            if !voluntary {
                switches += 1;
            }
        }
        switches
    }

    /// Round-robin rounds: a round ends whenever the schedule wraps back to
    /// a lower-numbered thread.
    fn count_rounds(&self, g: &ExecutionGraph) -> u32 {
        let order = Self::stamp_order(g);
        let mut rounds = 1;
        for w in order.windows(2) {
            if w[1].thread < w[0].thread {
                rounds += 1;
            }
        }
        rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_label::{Begin, TCreate, Write, WriteKind};
    use crate::loc::{MemAddr, MemOrdering};
    use crate::thread::{construct_thread_id, main_thread_id};

    // main spawns t1, then the two threads alternate writes:
    // t0: TCreate, W, W / t1: Begin, W in between.
    fn alternating_graph() -> ExecutionGraph {
        let mut g = ExecutionGraph::new();
        let t0 = main_thread_id();
        let t1 = construct_thread_id(1);
        let addr = MemAddr(1);

        let create_pos = Event::new(t0, 1);
        let tclab = TCreate::new(create_pos, t1, None, None, vec![1]);
        g.add_label(LabelEnum::TCreate(tclab.clone()));
        g.add_new_thread(tclab);
        g.add_label(LabelEnum::Begin(Begin::new(Event::new(t1, 0), Some(create_pos), None)));

        let mut add_write = |pos: Event, val| {
            g.add_label(LabelEnum::Write(Write::new(
                pos,
                addr,
                MemOrdering::Relaxed,
                val,
                WriteKind::Plain,
            )));
        };
        add_write(Event::new(t0, 2), 1);
        add_write(Event::new(t1, 1), 2);
        add_write(Event::new(t0, 3), 3);
        g
    }

    #[test]
    fn context_bound_counts_preemptions() {
        let g = alternating_graph();
        // t0's write at index 2 is preempted by t1's write, which is
        // preempted back.
        let d = BoundDecider::new(BoundType::Context, 1);
        assert!(d.exceeds(&g));
        let d = BoundDecider::new(BoundType::Context, 2);
        assert!(!d.exceeds(&g));
    }

    #[test]
    fn round_bound_counts_wraps() {
        let g = alternating_graph();
        // The schedule wraps from t1 back to t0 once.
        let d = BoundDecider::new(BoundType::Round, 1);
        assert!(d.exceeds(&g));
        let d = BoundDecider::new(BoundType::Round, 2);
        assert!(!d.exceeds(&g));
    }
}
