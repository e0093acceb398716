//! A generic cycle checker over derived relations of the execution graph.
//!
//! Consistency axioms are acyclicity requirements over unions and
//! compositions of the primitive edges (po, rf, co, fr, create/join). The
//! checker runs a DFS whose successor sets are produced by a caller-supplied
//! edge function, memoizing per-event status in a stamp-indexed table:
//! a back-edge into an `Entered` node is a cycle, a node once `Left` never
//! needs revisiting within the query.

use crate::event::Event;
use crate::exec_graph::ExecutionGraph;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Status {
    Unseen,
    Entered,
    Left,
}

/// Produces the successors of an event under the relation being checked.
pub(crate) type EdgeFn<'a> = dyn Fn(&ExecutionGraph, Event, &mut Vec<Event>) + 'a;

pub(crate) struct CycleChecker<'g> {
    g: &'g ExecutionGraph,
    /// Status per event, indexed by stamp (stamps are dense).
    status: Vec<Status>,
}

impl<'g> CycleChecker<'g> {
    pub(crate) fn new(g: &'g ExecutionGraph) -> Self {
        Self {
            g,
            status: vec![Status::Unseen; g.stamp() + 1],
        }
    }

    /// Whether the relation produced by `succs` is acyclic over the whole
    /// graph.
    pub(crate) fn acyclic(&mut self, succs: &EdgeFn) -> bool {
        let events: Vec<Event> = self
            .g
            .threads
            .iter()
            .flat_map(|t| t.labels.iter().map(|l| l.pos()))
            .collect();
        for e in events {
            if self.status[self.g.label(e).stamp()] == Status::Unseen && !self.visit(e, succs) {
                return false;
            }
        }
        true
    }

    fn visit(&mut self, e: Event, succs: &EdgeFn) -> bool {
        self.status[self.g.label(e).stamp()] = Status::Entered;

        let mut buf = Vec::new();
        succs(self.g, e, &mut buf);
        for n in buf {
            match self.status[self.g.label(n).stamp()] {
                Status::Entered => return false,
                Status::Left => {}
                Status::Unseen => {
                    if !self.visit(n, succs) {
                        return false;
                    }
                }
            }
        }

        self.status[self.g.label(e).stamp()] = Status::Left;
        true
    }
}
