//! Memory-model consistency checking.
//!
//! One `Consistency` instance serves a whole exploration. It answers the
//! questions that drive the search: which views each new label carries,
//! which writes a read may observe, where a write may sit in coherence
//! order, which revisits keep the graph consistent, and whether a complete
//! graph satisfies the chosen model's axioms.
//!
//! Views are calculated exactly once per label, right after insertion.
//! Any label whose cached views could be invalidated by a later rf or co
//! change is po-after the changed event and therefore removed by the
//! restriction that accompanies the change.

use crate::errors::{ErrorDetails, VerificationError};
use crate::event::Event;
use crate::event_label::{AsEventLabel, LabelEnum, Read, ReadKind, Write};
use crate::exec_graph::ExecutionGraph;
use crate::loc::MemAddr;
use crate::relation::CycleChecker;
use crate::revisit::Revisit;
use crate::vector_clock::VectorClock;
use crate::MemoryModel;

pub(crate) struct Consistency {
    model: MemoryModel,
}

impl Consistency {
    pub(crate) fn new(model: MemoryModel) -> Self {
        Self { model }
    }

    /// Whether a read of this ordering synchronizes with its write's
    /// release sequence. Under SC and TSO every atomic rf edge
    /// synchronizes; the C11-family models require acquire semantics.
    fn read_syncs(&self, rlab: &Read) -> bool {
        match self.model {
            MemoryModel::Sc | MemoryModel::Tso => rlab.ordering().is_atomic(),
            MemoryModel::Ra | MemoryModel::Rc11 | MemoryModel::Imm => {
                rlab.ordering().at_least_acquire()
            }
        }
    }

    fn write_releases(&self, wlab: &Write) -> bool {
        match self.model {
            MemoryModel::Sc | MemoryModel::Tso => wlab.ordering().is_atomic(),
            MemoryModel::Ra | MemoryModel::Rc11 | MemoryModel::Imm => {
                wlab.ordering().at_least_release()
            }
        }
    }

    /// Calculates and caches the views for `pos`. Must be called exactly
    /// once, immediately after the label is added.
    pub(crate) fn calc_views(&self, g: &mut ExecutionGraph, pos: Event) {
        if pos.index == 0 {
            let mut own = VectorClock::new();
            own.set_tid(pos.thread);
            g.label_mut(pos).set_porf_cache(own.clone());
            g.label_mut(pos).set_hb_cache(own);
            g.label_mut(pos).set_rel_cache(VectorClock::new());
            g.label_mut(pos).set_acc_cache(VectorClock::new());
            return;
        }

        let prev = pos.prev();
        let mut porf = g.label(prev).cached_porf().clone();
        let mut hb = g.label(prev).cached_hb().clone();
        let mut rel = g.label(prev).cached_rel().clone();
        let mut acc = g.label(prev).cached_acc().clone();

        porf.update_idx(pos);
        hb.update_idx(pos);

        // Cached views do not include prev's direct dependency
        // (rf/TCreate/TEnd, or the sw edges into a fence). Fold them in.
        match g.label(prev) {
            LabelEnum::Read(rlab) => {
                if let Some(rf) = rlab.rf() {
                    porf.update(g.label(rf).cached_porf());
                    let wlab = g.write_label(rf).unwrap();
                    if self.read_syncs(rlab) {
                        hb.update(wlab.msg_view());
                    }
                    if rlab.ordering().is_atomic() {
                        acc.update(wlab.msg_view());
                    }
                }
            }
            LabelEnum::Begin(blab) => {
                if let Some(parent) = blab.parent() {
                    porf.update(g.label(parent).cached_porf());
                    // Create -> Begin always synchronizes
                    hb.update(g.label(parent).cached_hb());
                }
            }
            LabelEnum::TJoin(jlab) => {
                let end = g.thread_last(jlab.cid()).unwrap();
                porf.update(end.cached_porf());
                // End -> Join always synchronizes
                hb.update(end.cached_hb());
            }
            LabelEnum::Fence(flab) => {
                if flab.ordering().at_least_acquire() {
                    // The fence received the message views of all po-earlier
                    // reads; its po-successors see them as hb.
                    hb.update(g.label(prev).cached_acc());
                }
                if flab.ordering().at_least_release() {
                    // Writes po-after the fence release everything hb at it.
                    rel = g.label(prev).cached_hb().clone();
                    if flab.ordering().at_least_acquire() {
                        rel.update(g.label(prev).cached_acc());
                    }
                }
            }
            _ => {}
        }

        g.label_mut(pos).set_porf_cache(porf);
        g.label_mut(pos).set_hb_cache(hb.clone());
        g.label_mut(pos).set_rel_cache(rel.clone());
        g.label_mut(pos).set_acc_cache(acc);

        // A write's message view: what an acquiring reader of it inherits.
        let msg = match g.label(pos) {
            LabelEnum::Write(wlab) => {
                let mut msg = if self.write_releases(wlab) {
                    hb
                } else {
                    rel
                };
                if wlab.is_exclusive() {
                    // An RMW write continues the release sequence of the
                    // write its paired read observed.
                    if let Some(rf) = g.read_label(prev).and_then(|r| r.rf()) {
                        msg.update(g.write_label(rf).unwrap().msg_view());
                    }
                }
                Some(msg)
            }
            _ => None,
        };
        if let Some(msg) = msg {
            g.write_label_mut(pos).unwrap().set_msg_view(msg);
        }
    }

    /// The full happens-before view of `pos`, including its own direct
    /// dependency (which the cached view omits).
    pub(crate) fn hb_full(&self, g: &ExecutionGraph, pos: Event) -> VectorClock {
        let lab = g.label(pos);
        let mut hb = lab.cached_hb().clone();
        match lab {
            LabelEnum::Read(rlab) => {
                if let Some(rf) = rlab.rf() {
                    if self.read_syncs(rlab) {
                        hb.update(g.write_label(rf).unwrap().msg_view());
                    }
                }
            }
            LabelEnum::Begin(blab) => {
                if let Some(parent) = blab.parent() {
                    hb.update(g.label(parent).cached_hb());
                }
            }
            LabelEnum::TJoin(jlab) => {
                hb.update(g.thread_last(jlab.cid()).unwrap().cached_hb());
            }
            LabelEnum::Fence(flab) => {
                if flab.ordering().at_least_acquire() {
                    hb.update(lab.cached_acc());
                }
            }
            _ => {}
        }
        hb
    }

    /// The writes `rlab` may read from, coherence-latest first (the first
    /// entry is the choice of a maximal addition).
    pub(crate) fn coherent_stores(&self, g: &ExecutionGraph, rlab: &Read) -> Vec<Event> {
        self.coherent_rfs_in_view(g, None, rlab)
    }

    /// Same, after (hypothetically) restricting the graph to `view` with
    /// one event excluded (a revisiting write under consideration).
    fn coherent_rfs_in_view(
        &self,
        g: &ExecutionGraph,
        view: Option<(&VectorClock, Event)>,
        rlab: &Read,
    ) -> Vec<Event> {
        let rpos = rlab.pos();
        let addr = rlab.addr();
        // The read's own rf is irrelevant here; its po-prefix hb is what
        // constrains the candidates.
        let hb = g.label(rpos).cached_hb();

        let in_view = |e: Event| match view {
            None => true,
            Some((v, excl)) => e != excl && v.contains(e),
        };

        let co: Vec<Event> = g
            .co_list(addr)
            .iter()
            .copied()
            .filter(|&w| in_view(w))
            .collect();

        // A write is readable unless some coherence-later write (or a read
        // of one) is already hb-before the read.
        let mut lo = 0;
        for (i, &w) in co.iter().enumerate() {
            if hb.contains(w) {
                lo = i;
                continue;
            }
            let read_in_hb = g.write_label(w).unwrap().readers().iter().any(|&r2| {
                r2 != rpos && in_view(r2) && hb.contains(r2)
            });
            if read_in_hb {
                lo = i;
            }
        }

        co[lo..].iter().rev().copied().collect()
    }

    /// The coherence predecessors after which a new (non-RMW) write may be
    /// placed; `None` means coherence-first. Maximal placement first.
    pub(crate) fn coherent_placings(
        &self,
        g: &ExecutionGraph,
        wlab: &Write,
    ) -> Vec<Option<Event>> {
        let addr = wlab.addr();
        let pos = wlab.pos();
        let hb = g.label(pos).cached_hb();
        let co: Vec<Event> = g
            .co_list(addr)
            .iter()
            .copied()
            .filter(|&w| w != pos)
            .collect();

        // The write must go after every same-address write (and every write
        // observed by a read) that is hb-before it.
        let mut j_min = 0;
        for (i, &w) in co.iter().enumerate() {
            if hb.contains(w)
                || g.write_label(w)
                    .unwrap()
                    .readers()
                    .iter()
                    .any(|&r| hb.contains(r))
            {
                j_min = i + 1;
            }
        }

        let mut placings = Vec::new();
        for j in (j_min..=co.len()).rev() {
            // Never split an RMW: the slot right after a write consumed by
            // an RMW whose paired write is next is not a legal placement.
            if j > 0 && j < co.len() {
                let prev = co[j - 1];
                let rmw_reader = g
                    .write_label(prev)
                    .unwrap()
                    .readers()
                    .iter()
                    .copied()
                    .find(|&r| g.is_rmw_reader(r));
                if let Some(r) = rmw_reader {
                    if co[j] == r.next() {
                        continue;
                    }
                }
            }
            placings.push(if j == 0 { None } else { Some(co[j - 1]) });
        }
        placings
    }

    /// Whether `rlab` could consistently read from `wlab` after the
    /// corresponding backward revisit restricted the graph.
    pub(crate) fn is_revisit_consistent(
        &self,
        g: &ExecutionGraph,
        rlab: &Read,
        wlab: &Write,
    ) -> bool {
        assert_eq!(rlab.addr(), wlab.addr());

        let rpos = rlab.pos();
        let wpos = wlab.pos();
        let v = g.revisit_view(&Revisit::new(rpos, wpos));
        let hb_r = g.label(rpos).cached_hb();

        // Reading w is inconsistent if a write coherence-after w survives
        // the restriction and is already hb-before the read (or observed by
        // an hb-before read).
        let addr = rlab.addr();
        let wi = g.co_index(addr, wpos);
        for &w2 in &g.co_list(addr)[wi + 1..] {
            if !v.contains(w2) {
                continue;
            }
            if hb_r.contains(w2) {
                return false;
            }
            if g.write_label(w2).unwrap().readers().iter().any(|&r2| {
                r2 != rpos && v.contains(r2) && hb_r.contains(r2)
            }) {
                return false;
            }
        }
        true
    }

    /// Returns whether an affected read is maximal during a revisit: its
    /// current rf must be the choice a maximal addition would have made in
    /// the view of a hypothetical `[rev.rev -> rlab]` revisit. For lock
    /// acquisitions the maximal addition is the latest *zero-valued*
    /// candidate (any other would have blocked instead).
    pub(crate) fn reads_tiebreaker(&self, g: &ExecutionGraph, rlab: &Read, rev: &Revisit) -> bool {
        // rlab is not in the prefix of the revisitor
        assert!(!g.write_label(rev.rev).unwrap().porf().contains(rlab.pos()));
        // rlab is stamp greater or equal to the revisitee's stamp
        assert!(rlab.stamp() >= g.label(rev.pos).stamp());

        let view = g.revisit_view(&Revisit::new(rlab.pos(), rev.rev));
        let mut rfs = self.coherent_rfs_in_view(g, Some((&view, rev.rev)), rlab);
        if rlab.kind() == ReadKind::Lock {
            rfs.retain(|&w| g.write_label(w).unwrap().val() == 0);
        }
        match rfs.first() {
            None => rlab.rf().is_none(),
            Some(&max) => rlab.rf() == Some(max),
        }
    }

    // ==== race detection

    /// Looks for accesses conflicting with the just-added access at `pos`:
    /// same location, different event, not ordered by happens-before. A
    /// conflict involving a non-atomic access is a data race; two unordered
    /// atomic writes are a write-write race (soft by default).
    ///
    /// `pos` is the latest addition, so any hb ordering between it and an
    /// older access must place the older one first.
    pub(crate) fn check_races(&self, g: &ExecutionGraph, pos: Event) -> Option<ErrorDetails> {
        let hb = self.hb_full(g, pos);
        match g.label(pos) {
            LabelEnum::Read(rlab) => {
                let addr = rlab.addr();
                for &w in g.co_list(addr) {
                    if hb.contains(w) {
                        continue;
                    }
                    let wlab = g.write_label(w).unwrap();
                    if !rlab.ordering().is_atomic() || !wlab.ordering().is_atomic() {
                        return Some(
                            ErrorDetails::new(
                                pos,
                                VerificationError::RaceNotAtomic,
                                format!("read of {} races with a write", addr),
                            )
                            .with_racy(w),
                        );
                    }
                }
                None
            }
            LabelEnum::Write(wlab) => {
                let addr = wlab.addr();
                for &r in g.reads_list(addr) {
                    if r == pos || hb.contains(r) {
                        continue;
                    }
                    let rlab = g.read_label(r).unwrap();
                    if !rlab.ordering().is_atomic() || !wlab.ordering().is_atomic() {
                        return Some(
                            ErrorDetails::new(
                                pos,
                                VerificationError::RaceNotAtomic,
                                format!("write to {} races with a read", addr),
                            )
                            .with_racy(r),
                        );
                    }
                }
                let mut ww = None;
                for &w2 in g.co_list(addr) {
                    if w2 == pos || hb.contains(w2) {
                        continue;
                    }
                    let w2lab = g.write_label(w2).unwrap();
                    if !wlab.ordering().is_atomic() || !w2lab.ordering().is_atomic() {
                        return Some(
                            ErrorDetails::new(
                                pos,
                                VerificationError::RaceNotAtomic,
                                format!("write to {} races with a write", addr),
                            )
                            .with_racy(w2),
                        );
                    }
                    ww = Some(w2);
                }
                ww.map(|w2| {
                    ErrorDetails::new(
                        pos,
                        VerificationError::WWRace,
                        format!("unordered atomic writes to {}", addr),
                    )
                    .with_racy(w2)
                })
            }
            _ => None,
        }
    }

    // ==== whole-graph consistency

    /// Evaluates the model's axioms on the (usually complete) graph.
    pub(crate) fn is_consistent(&self, g: &ExecutionGraph) -> bool {
        if !self.coherence_ok(g) || !self.atomicity_ok(g) {
            return false;
        }
        match self.model {
            MemoryModel::Sc => self.acyclic_sc(g),
            MemoryModel::Tso => self.acyclic_tso(g),
            MemoryModel::Rc11 | MemoryModel::Imm => self.psc_acyclic(g),
            MemoryModel::Ra => true,
        }
    }

    /// Per-location coherence: co must agree with hb (CoWW), no read may
    /// observe a write overwritten in its hb (CoWR), reads ordered by hb
    /// must not observe coherence-reversed writes (CoRR), and a write
    /// hb-after a read must not be placed coherence-before the read's rf
    /// (CoRW).
    fn coherence_ok(&self, g: &ExecutionGraph) -> bool {
        let addrs: Vec<MemAddr> = g.co_addrs().collect();
        for addr in addrs {
            let co = g.co_list(addr);
            for (i, &wi) in co.iter().enumerate() {
                let hb_wi = self.hb_full(g, wi);
                for &wj in &co[i + 1..] {
                    // wj is co-after wi; wj hb-before wi is CoWW.
                    if hb_wi.contains(wj) {
                        return false;
                    }
                }
            }
            for &r in g.reads_list(addr) {
                let Some(rf) = g.read_label(r).unwrap().rf() else {
                    continue;
                };
                let hb_r = self.hb_full(g, r);
                let rfi = g.co_index(addr, rf);
                for &w2 in &co[rfi + 1..] {
                    // CoWR: a coherence-later write is hb-before the read.
                    if hb_r.contains(w2) {
                        return false;
                    }
                    // CoRR: a read of a coherence-later write is hb-before.
                    if g.write_label(w2)
                        .unwrap()
                        .readers()
                        .iter()
                        .any(|&r2| r2 != r && hb_r.contains(r2))
                    {
                        return false;
                    }
                }
                for &w2 in &co[..rfi] {
                    // CoRW: the read is hb-before a coherence-earlier write.
                    if self.hb_full(g, w2).contains(r) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// RMW atomicity: every exclusive write sits immediately after the
    /// write its paired read observed, and no write feeds two RMWs.
    fn atomicity_ok(&self, g: &ExecutionGraph) -> bool {
        for thread in g.threads.iter() {
            for lab in thread.labels.iter() {
                let LabelEnum::Write(wlab) = lab else {
                    continue;
                };
                let excl = wlab
                    .readers()
                    .iter()
                    .filter(|&&r| g.is_rmw_reader(r))
                    .count();
                if excl > 1 {
                    return false;
                }
                if wlab.is_exclusive() {
                    let rf = g
                        .read_label(lab.pos().prev())
                        .and_then(|r| r.rf())
                        .expect("exclusive write without a resolved paired read");
                    if g.co_imm_succ(wlab.addr(), rf) != Some(lab.pos()) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// SC: acyclicity of po ∪ rf ∪ co ∪ fr (plus create/join edges).
    fn acyclic_sc(&self, g: &ExecutionGraph) -> bool {
        CycleChecker::new(g).acyclic(&|g, e, buf| {
            Self::po_succ(g, e, buf);
            Self::sync_succ(g, e, buf);
            Self::comm_succ(g, e, buf);
        })
    }

    /// TSO: acyclicity of ppo ∪ rfe ∪ co ∪ fr, where ppo drops the
    /// write-to-read program order (a read may overtake a buffered write
    /// unless a fence intervenes; the fence is itself a node, so W -> F ->
    /// R survives).
    fn acyclic_tso(&self, g: &ExecutionGraph) -> bool {
        CycleChecker::new(g).acyclic(&|g, e, buf| {
            if g.is_write(e) {
                // Skip po-adjacent reads; the first non-read successor
                // restores transitivity for the preserved pairs.
                let size = g.thread_size(e.thread) as u32;
                let mut n = e.next();
                while n.index < size && g.is_read(n) {
                    n = n.next();
                }
                if n.index < size {
                    buf.push(n);
                }
            } else {
                Self::po_succ(g, e, buf);
            }
            Self::sync_succ(g, e, buf);
            // rf-internal is not global under TSO (store forwarding).
            if let Some(wlab) = g.write_label(e) {
                buf.extend(
                    wlab.readers()
                        .iter()
                        .copied()
                        .filter(|r| r.thread != e.thread),
                );
            }
            if let Some(wlab) = g.write_label(e) {
                if let Some(succ) = g.co_imm_succ(wlab.addr(), e) {
                    buf.push(succ);
                }
            }
            if let Some(fr) = g.fr_imm_succ(e) {
                buf.push(fr);
            }
        })
    }

    /// RC11: acyclicity of the SC order approximated over SC-ordered
    /// events, with hb, co and fr steps between them.
    fn psc_acyclic(&self, g: &ExecutionGraph) -> bool {
        let sc_events: Vec<Event> = g
            .threads
            .iter()
            .flat_map(|t| t.labels.iter())
            .filter(|lab| match lab {
                LabelEnum::Read(r) => r.ordering().is_sc(),
                LabelEnum::Write(w) => w.ordering().is_sc(),
                LabelEnum::Fence(f) => f.ordering().is_sc(),
                _ => false,
            })
            .map(|lab| lab.pos())
            .collect();
        if sc_events.len() < 2 {
            return true;
        }

        // Successors of an SC event among SC events: hb, co, fr.
        CycleChecker::new(g).acyclic(&|g, e, buf| {
            if !sc_events.contains(&e) {
                return;
            }
            for &e2 in &sc_events {
                if e2 == e {
                    continue;
                }
                if self.hb_full(g, e2).contains(e) {
                    buf.push(e2);
                    continue;
                }
                let co_step = match (g.write_label(e), g.write_label(e2)) {
                    (Some(w1), Some(w2)) if w1.addr() == w2.addr() => {
                        g.co_index(w1.addr(), e) < g.co_index(w1.addr(), e2)
                    }
                    _ => false,
                };
                if co_step {
                    buf.push(e2);
                    continue;
                }
                let fr_step = match (g.read_label(e), g.write_label(e2)) {
                    (Some(r), Some(w2)) if r.addr() == w2.addr() => match r.rf() {
                        Some(rf) => {
                            rf != e2 && g.co_index(r.addr(), rf) < g.co_index(r.addr(), e2)
                        }
                        None => false,
                    },
                    _ => false,
                };
                if fr_step {
                    buf.push(e2);
                }
            }
        })
    }

    fn po_succ(g: &ExecutionGraph, e: Event, buf: &mut Vec<Event>) {
        if (e.index as usize) + 1 < g.thread_size(e.thread) {
            buf.push(e.next());
        }
    }

    /// Thread-lifecycle edges: TCreate -> Begin of the child, End -> TJoin
    /// of the joiner.
    fn sync_succ(g: &ExecutionGraph, e: Event, buf: &mut Vec<Event>) {
        match g.label(e) {
            LabelEnum::TCreate(tclab) => {
                if g.get_thr_opt(&tclab.cid()).is_some() && g.thread_size(tclab.cid()) > 0 {
                    buf.push(Event::new(tclab.cid(), 0));
                }
            }
            LabelEnum::End(_) => {
                for thread in g.threads.iter() {
                    for lab in thread.labels.iter() {
                        if let LabelEnum::TJoin(jlab) = lab {
                            if jlab.cid() == e.thread {
                                buf.push(lab.pos());
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Communication edges: rf, co (immediate), fr (immediate).
    fn comm_succ(g: &ExecutionGraph, e: Event, buf: &mut Vec<Event>) {
        if let Some(wlab) = g.write_label(e) {
            buf.extend(wlab.readers().iter().copied());
            if let Some(succ) = g.co_imm_succ(wlab.addr(), e) {
                buf.push(succ);
            }
        }
        if let Some(fr) = g.fr_imm_succ(e) {
            buf.push(fr);
        }
    }
}
