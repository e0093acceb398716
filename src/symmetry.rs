//! Symmetry reduction.
//!
//! A thread spawned with [`crate::thread::spawn_symmetric`] declares that it
//! runs the same code as an earlier sibling. When the two threads have
//! behaved identically so far (same events, same reads-from), any execution
//! reachable by letting the later thread act first is a thread-id
//! permutation of one reachable from the earlier thread, and is pruned.
//!
//! Pruning is applied in two places: revisit generation (a write of a
//! symmetric thread with a symmetric prefix generates no backward revisits)
//! and rf-candidate filtering (a read does not consider a write when the
//! symmetric sibling offers an earlier-stamped equivalent).

use std::collections::HashSet;

use crate::event::Event;
use crate::event_label::LabelEnum;
use crate::exec_graph::ExecutionGraph;
use crate::thread::ThreadId;

pub(crate) struct SymmetryChecker;

impl SymmetryChecker {
    /// Whether thread `pos.thread` and its declared-symmetric sibling have
    /// identical histories before `pos.index`.
    pub(crate) fn prefix_symmetric(
        g: &ExecutionGraph,
        sym_id: Option<ThreadId>,
        pos: Event,
    ) -> bool {
        let Some(sym_id) = sym_id else {
            return false;
        };
        let tid = pos.thread;
        if g.thread_size(sym_id) <= pos.index as usize {
            return false;
        }
        (1..pos.index).all(|i| {
            Self::labels_symmetric(
                g.label(Event::new(tid, i)),
                g.label(Event::new(sym_id, i)),
            )
        })
    }

    /// Two labels are symmetric when swapping the thread ids cannot be
    /// observed: same operation, and for reads the same incoming rf.
    fn labels_symmetric(a: &LabelEnum, b: &LabelEnum) -> bool {
        match (a, b) {
            (LabelEnum::Read(a), LabelEnum::Read(b)) => {
                a.addr() == b.addr()
                    && a.ordering() == b.ordering()
                    && a.kind() == b.kind()
                    && a.rf() == b.rf()
            }
            (LabelEnum::Write(a), LabelEnum::Write(b)) => {
                a.addr() == b.addr() && a.ordering() == b.ordering() && a.val() == b.val()
            }
            (LabelEnum::Fence(a), LabelEnum::Fence(b)) => a.ordering() == b.ordering(),
            (LabelEnum::Malloc(a), LabelEnum::Malloc(b)) => a.size() == b.size(),
            (LabelEnum::Free(a), LabelEnum::Free(b)) => a.addr() == b.addr(),
            (LabelEnum::Toss(a), LabelEnum::Toss(b)) => a.result() == b.result(),
            (LabelEnum::Choice(a), LabelEnum::Choice(b)) => a.result() == b.result(),
            (LabelEnum::TCreate(_), LabelEnum::TCreate(_)) => true,
            (LabelEnum::TJoin(_), LabelEnum::TJoin(_)) => true,
            (LabelEnum::Block(a), LabelEnum::Block(b)) => a.btype() == b.btype(),
            (LabelEnum::Optional(a), LabelEnum::Optional(b)) => {
                a.is_expanded() == b.is_expanded()
            }
            (LabelEnum::MethodBegin(a), LabelEnum::MethodBegin(b)) => a.name() == b.name(),
            (LabelEnum::MethodEnd(a), LabelEnum::MethodEnd(b)) => a.name() == b.name(),
            (LabelEnum::Begin(_), LabelEnum::Begin(_)) => true,
            (LabelEnum::End(_), LabelEnum::End(_)) => true,
            _ => false,
        }
    }

    /// Drop rf candidates whose thread is symmetric to a lower-stamped
    /// sibling that offers an equivalent candidate: reading from the later
    /// twin yields a permutation of an execution already explored through
    /// the earlier one.
    pub(crate) fn filter_symmetric_rfs(g: &ExecutionGraph, rfs: &mut Vec<Event>) {
        let mut sym_rfs = HashSet::new();
        for &rf in rfs.iter() {
            let Some(blab) = g.thread_first(rf.thread) else {
                continue;
            };
            let Some(sym) = blab.sym_id() else {
                continue;
            };
            if rfs.iter().any(|&rf2| {
                rf2 != rf
                    && rf2.thread == sym
                    && Self::prefix_symmetric(g, Some(sym), rf)
                    && g.label(rf2).stamp() < g.label(rf).stamp()
            }) {
                sym_rfs.insert(rf);
            }
        }
        rfs.retain(|rf| !sym_rfs.contains(rf));
    }
}
