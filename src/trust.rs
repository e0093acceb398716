//! The exploration engine.
//!
//! `Trust` drives the runtime one operation at a time, turning each visible
//! operation into a graph label, consulting the consistency checker for the
//! choices the label admits (reads-from, coherence placement), and queuing
//! the alternatives as revisits. When an execution runs out of schedulable
//! threads, the engine pops the next revisit, restricts the graph back to
//! the revisit's causal prefix, and replays forward. Backward revisits push
//! the whole driver state onto a stack so that nested revisit recursion
//! never loses the outer branch.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::File;
use std::io::Write as IoWrite;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use log::{debug, info, trace};
use rand::prelude::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};

use crate::bound::BoundDecider;
use crate::cons::Consistency;
use crate::errors::{ErrorDetails, VerificationError};
use crate::event::Event;
use crate::event_label::*;
use crate::exec_graph::ExecutionGraph;
use crate::exec_pool::ExecutionPool;
use crate::loc::{AddrAllocator, MemAddr, MemOrdering};
use crate::replay as REPLAY;
use crate::revisit::{Revisit, RevisitEnum};
use crate::runtime::Reply;
use crate::symmetry::SymmetryChecker;
use crate::telemetry::{Telemetry, BLOCKED, EXECS, EXECS_EST, MOOT};
use crate::thread::ThreadId;
use crate::{Config, ExplorationMode, SchedulePolicy, Stats};

type RQueue = BTreeMap<usize, Vec<RevisitEnum>>;
type StateStack = Vec<TrustState>;

/// A graph and the work generated while building it, together with the
/// address allocator that must stay in sync with the graph's allocations.
/// Pushed on the state stack when a backward revisit opens a nested branch.
#[derive(Default, Clone, Serialize, Deserialize)]
pub(crate) struct TrustState {
    graph: ExecutionGraph,
    rqueue: RQueue,
    alloc: AddrAllocator,
}

impl TrustState {
    fn new() -> Self {
        Self::default()
    }
}

/// What the runtime should do with the worker that issued an operation.
pub(crate) enum Outcome {
    /// Deliver the reply; the worker's next operation sits at index `next`.
    Continue { reply: Reply, next: u32 },
    /// Keep the worker parked. Its operation is re-processed at the same
    /// position if the scheduler ever unblocks the thread.
    Park,
    /// Keep the worker parked, but deliver `reply` without re-processing
    /// once the thread is unblocked.
    ParkDeliver { reply: Reply, next: u32 },
}

type ExecutionGraphEnqueuePair = (Arc<Mutex<VecDeque<Option<ExecutionGraph>>>>, Arc<Condvar>);

pub(crate) struct Trust {
    states: StateStack,
    current: TrustState,
    replay_info: REPLAY::ReplayInformation,
    checker: Consistency,
    pub(crate) config: Config,
    rng: Pcg64Mcg,
    stop: bool,
    /// The current branch broke RMW uniqueness speculatively; it is
    /// discarded without reporting anything once it ends.
    moot: bool,
    warn_limit: usize,
    bound: Option<BoundDecider>,
    errors: Vec<ErrorDetails>,
    warnings: Vec<ErrorDetails>,
    warned: HashSet<(VerificationError, Event)>,
    pqueue: Option<ExecutionGraphEnqueuePair>,
    pub(crate) telemetry: Telemetry,
    pub(crate) started_at: Instant,
}

impl Trust {
    pub(crate) fn new(conf: Config, replay_mode: bool) -> Self {
        let seed = conf.seed;
        if conf.schedule_policy == SchedulePolicy::Arbitrary
            || conf.mode == ExplorationMode::Estimation
        {
            info!("random schedule seed: {}", seed);
        }
        Self {
            states: Vec::new(),
            current: TrustState::new(),
            replay_info: REPLAY::ReplayInformation::new(conf.clone(), replay_mode),
            checker: Consistency::new(conf.model),
            rng: Pcg64Mcg::seed_from_u64(seed),
            stop: false,
            moot: false,
            warn_limit: 1,
            bound: conf.bound.map(|(ty, n)| BoundDecider::new(ty, n)),
            config: conf,
            errors: Vec::new(),
            warnings: Vec::new(),
            warned: HashSet::new(),
            pqueue: None,
            telemetry: Telemetry::new(),
            started_at: Instant::now(),
        }
    }

    pub(crate) fn begin_execution(&mut self) {
        self.current.graph.initialize_for_execution();
        self.moot = false;
    }

    pub(crate) fn set_parallel_queues(&mut self, pq: ExecutionGraphEnqueuePair) {
        self.pqueue = Some(pq);
    }

    /// Adopt a graph handed over from another pool worker.
    pub(crate) fn reset_execution_graph(&mut self, eg: ExecutionGraph) {
        self.current.rqueue.clear();
        self.states.clear();
        self.current.alloc = AddrAllocator::new();
        self.current.alloc.seed_above(eg.max_addr());
        self.current.graph = eg;
    }

    /// Add the replay information to a fresh instance of the engine.
    pub(crate) fn load_replay_information(&mut self, replay_info: REPLAY::ReplayInformation) {
        self.replay_info = replay_info;
        self.current = self.replay_info.extract_error_state();
        self.config = self.replay_info.config();
    }

    /// Extract the replay information from a failing execution; only the
    /// first error of a run is persisted.
    fn store_replay_information(&mut self, pos: Option<Event>, err: &ErrorDetails) {
        if self.replay_info.error_found() {
            return;
        }
        let sorted_error_graph = self.current.graph.top_sort(pos);
        let replay_info = REPLAY::ReplayInformation::create(
            sorted_error_graph,
            self.current.clone(),
            self.config.clone(),
            err.clone(),
        );

        match self.config.error_trace_file.as_ref() {
            None => {
                debug!("no counterexample written; use Config::with_error_trace()");
            }
            Some(f) => {
                let mut file = File::create(f).unwrap();
                match serde_json::to_string_pretty(&replay_info) {
                    Ok(replay_str) => writeln!(&mut file, "{}", replay_str).unwrap(),
                    Err(err) => println!("can't serialize the error graph: {}", err),
                }
            }
        }
        self.replay_info = replay_info;
    }

    /// Mark the replayed `label` reproduced in the counterexample's
    /// linearization.
    fn try_consume(&mut self, label: &LabelEnum) {
        if !self.replay_info.replay_mode() {
            return;
        }
        info!("|| consuming {}", label);
        if let Err(e) = self.replay_info.consume(label.pos()) {
            panic!("replay failure: {}", e);
        }
    }

    /// Validate a re-executed operation against the graph-resident label.
    fn replay_event(&mut self, lab: LabelEnum) {
        self.current.graph.validate_replay_event(&lab);
        self.try_consume(&lab);
    }

    fn is_replay(&self, pos: Event) -> bool {
        self.current.graph.contains(pos)
    }

    // ==== scheduling

    /// Pick the next thread to advance, among `candidates` of
    /// `(thread, index of the worker's next operation)` pairs.
    pub(crate) fn next_thread(&mut self, candidates: &[(ThreadId, u32)]) -> Option<ThreadId> {
        if self.is_stopped() {
            return None;
        }

        // A counterexample replay is scheduled by the linearization.
        if self.replay_info.replay_mode() {
            return self.replay_info.next_thread();
        }

        let next = match self.config.schedule_policy {
            SchedulePolicy::LTR => candidates
                .iter()
                .find(|(t, i)| self.is_thread_runnable(*t, *i))
                .map(|(t, _)| *t),
            SchedulePolicy::Arbitrary => {
                let mut shuffled = candidates.to_vec();
                shuffled.shuffle(&mut self.rng);
                shuffled
                    .iter()
                    .find(|(t, i)| self.is_thread_runnable(*t, *i))
                    .map(|(t, _)| *t)
            }
        };
        next.or_else(|| self.unblock_ready(candidates))
    }

    // A blocked thread is still runnable while the worker replays the
    // prefix before the Block label.
    fn is_thread_runnable(&self, t: ThreadId, next_idx: u32) -> bool {
        match self.current.graph.thread_last(t) {
            Some(LabelEnum::Block(blab)) => next_idx < blab.pos().index,
            _ => true,
        }
    }

    /// When nothing is runnable, look for blocked threads whose wait
    /// condition has been met, remove their Block labels, and hand the
    /// first of them back to the scheduler.
    fn unblock_ready(&mut self, candidates: &[(ThreadId, u32)]) -> Option<ThreadId> {
        let ready: Vec<ThreadId> = candidates
            .iter()
            .map(|(t, _)| *t)
            .filter(|&t| self.is_unblockable(t))
            .collect();
        for &t in &ready {
            self.current.graph.remove_last(t);
        }
        ready.first().copied()
    }

    fn is_unblockable(&self, t: ThreadId) -> bool {
        let Some(LabelEnum::Block(blab)) = self.current.graph.thread_last(t) else {
            return false;
        };
        let g = &self.current.graph;
        match blab.btype() {
            BlockType::Join(cid) => g.is_thread_complete(*cid),
            BlockType::Lock(addr) => Self::latest_value_is_zero(g, *addr),
            BlockType::Barrier(addr) => Self::latest_value_is_zero(g, *addr),
            _ => false,
        }
    }

    fn latest_value_is_zero(g: &ExecutionGraph, addr: MemAddr) -> bool {
        g.co_max(addr)
            .is_some_and(|w| g.write_label(w).unwrap().val() == 0)
    }

    // ==== label plumbing

    fn add_to_graph(&mut self, lab: LabelEnum) -> Event {
        let tid = lab.thread();
        let tindex = self.current.graph.thread_size(tid);
        if tindex > self.config.thread_threshold as usize && self.warn_limit > 0 {
            self.warn(&format!(
                "large thread size ({} events)! Is the model bounded?",
                tindex
            ));
            self.stop();
        }
        let pos = self.current.graph.add_label(lab);
        self.checker.calc_views(&mut self.current.graph, pos);
        pos
    }

    // ==== handlers (one per runtime operation)

    pub(crate) fn handle_tcreate(
        &mut self,
        pos: Event,
        name: Option<String>,
        sym: Option<ThreadId>,
    ) -> ThreadId {
        let parent_tclab = self.current.graph.get_thread_tclab(pos.thread);
        let mut origination_vec = parent_tclab.origination_vec();
        origination_vec.push(pos.index);
        let tid = self.current.graph.tid_for_spawn(&pos, &origination_vec);
        let tclab = TCreate::new(pos, tid, name, sym, origination_vec);

        if self.is_replay(pos) {
            info!("| replay mode for {}", tclab);
            self.replay_event(LabelEnum::TCreate(tclab));
            return tid;
        }
        info!("| handle mode for {}", tclab);

        let spawn_pos = self.add_to_graph(LabelEnum::TCreate(tclab.clone()));
        assert_eq!(spawn_pos, pos);
        self.current.graph.add_new_thread(tclab);
        self.add_to_graph(LabelEnum::Begin(Begin::new(
            Event::new(tid, 0),
            Some(spawn_pos),
            sym,
        )));
        tid
    }

    pub(crate) fn handle_tjoin(&mut self, pos: Event, cid: ThreadId) -> Outcome {
        if self.is_replay(pos) {
            if let LabelEnum::Block(_) = self.current.graph.label(pos) {
                self.replay_event(LabelEnum::Block(Block::new(pos, BlockType::Join(cid))));
                return Outcome::Park;
            }
            self.replay_event(LabelEnum::TJoin(TJoin::new(pos, cid)));
            return Outcome::Continue {
                reply: Reply::Unit,
                next: pos.index + 1,
            };
        }

        if self.current.graph.is_thread_complete(cid) {
            self.add_to_graph(LabelEnum::TJoin(TJoin::new(pos, cid)));
            Outcome::Continue {
                reply: Reply::Unit,
                next: pos.index + 1,
            }
        } else {
            self.add_to_graph(LabelEnum::Block(Block::new(pos, BlockType::Join(cid))));
            Outcome::Park
        }
    }

    pub(crate) fn handle_tend(&mut self, pos: Event) {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::End(End::new(pos)));
            return;
        }
        self.add_to_graph(LabelEnum::End(End::new(pos)));
    }

    pub(crate) fn handle_load(
        &mut self,
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
    ) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Read(Read::new(pos, addr, ordering, ReadKind::Plain)));
            let val = self.current.graph.val(pos).expect("replayed read has no rf");
            return Outcome::Continue {
                reply: Reply::Val(val),
                next: pos.index + 1,
            };
        }
        if let Some(err) = self.access_error(pos, addr) {
            self.report_error(err);
            return Outcome::Park;
        }
        self.add_to_graph(LabelEnum::Read(Read::new(pos, addr, ordering, ReadKind::Plain)));
        match self.pick_read_rf(pos, true) {
            Some(val) => {
                self.check_new_access(pos);
                Outcome::Continue {
                    reply: Reply::Val(val),
                    next: pos.index + 1,
                }
            }
            None => {
                self.report_error(ErrorDetails::new(
                    pos,
                    VerificationError::UninitializedMem,
                    format!("read of {} with no write to read from", addr),
                ));
                Outcome::Park
            }
        }
    }

    pub(crate) fn handle_store(
        &mut self,
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        val: u64,
    ) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Write(Write::new(
                pos,
                addr,
                ordering,
                val,
                WriteKind::Plain,
            )));
            return Outcome::Continue {
                reply: Reply::Unit,
                next: pos.index + 1,
            };
        }
        if let Some(err) = self.access_error(pos, addr) {
            self.report_error(err);
            return Outcome::Park;
        }
        let pos = self.add_to_graph(LabelEnum::Write(Write::new(
            pos,
            addr,
            ordering,
            val,
            WriteKind::Plain,
        )));
        self.place_write(pos, true);
        self.calc_revisits(pos);
        self.check_new_access(pos);
        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_cas(
        &mut self,
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        expected: u64,
        new: u64,
    ) -> Outcome {
        let kind = ReadKind::Cas { expected, new };
        let val = match self.rmw_read(pos, addr, ordering, kind, true) {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        if val != expected {
            return Outcome::Continue {
                reply: Reply::Val(val),
                next: pos.index + 1,
            };
        }
        self.commit_rmw_write(pos, addr, ordering, new, WriteKind::CasExcl);
        Outcome::Continue {
            reply: Reply::Val(val),
            next: pos.index + 2,
        }
    }

    pub(crate) fn handle_fai(
        &mut self,
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        op: FaiOp,
        operand: u64,
    ) -> Outcome {
        let kind = ReadKind::Fai { op, operand };
        let val = match self.rmw_read(pos, addr, ordering, kind, true) {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        self.commit_rmw_write(pos, addr, ordering, op.apply(val, operand), WriteKind::FaiExcl);
        Outcome::Continue {
            reply: Reply::Val(val),
            next: pos.index + 2,
        }
    }

    /// Lock acquisition: an exclusive read that succeeds only on observing
    /// 0. When every readable store carries a nonzero value, the thread
    /// blocks in place and is woken when an unlock shows up. A lock read
    /// that a later unlock-chain write revisits into a nonzero value is
    /// converted back into a Block on replay (the revisit is "forced":
    /// the only thing the thread can do is wait).
    pub(crate) fn handle_lock(&mut self, pos: Event, addr: MemAddr) -> Outcome {
        if self.is_replay(pos) {
            if let LabelEnum::Block(_) = self.current.graph.label(pos) {
                self.replay_event(LabelEnum::Block(Block::new(pos, BlockType::Lock(addr))));
                return Outcome::Park;
            }
            self.replay_event(LabelEnum::Read(Read::new(
                pos,
                addr,
                MemOrdering::Acquire,
                ReadKind::Lock,
            )));
            let val = self.current.graph.val(pos).expect("replayed lock read has no rf");
            if val == 0 {
                self.commit_rmw_write(pos, addr, MemOrdering::Relaxed, 1, WriteKind::CasExcl);
                return Outcome::Continue {
                    reply: Reply::Unit,
                    next: pos.index + 2,
                };
            }
            // Revisited into a held lock: block in place instead.
            self.current.graph.remove_last(pos.thread);
            self.add_to_graph(LabelEnum::Block(Block::new(pos, BlockType::Lock(addr))));
            return Outcome::Park;
        }
        if let Some(err) = self.access_error(pos, addr) {
            self.report_error(err);
            return Outcome::Park;
        }
        self.add_to_graph(LabelEnum::Read(Read::new(
            pos,
            addr,
            MemOrdering::Acquire,
            ReadKind::Lock,
        )));
        let (rfs, satisfying) = {
            let g = &self.current.graph;
            let rlab = g.read_label(pos).unwrap();
            let mut rfs = self.checker.coherent_stores(g, rlab);
            if self.config.symmetry {
                SymmetryChecker::filter_symmetric_rfs(g, &mut rfs);
            }
            let satisfying: Vec<Event> = rfs
                .iter()
                .copied()
                .filter(|&w| g.write_label(w).unwrap().val() == 0)
                .collect();
            (rfs, satisfying)
        };
        if rfs.is_empty() {
            self.report_error(ErrorDetails::new(
                pos,
                VerificationError::UninitializedMem,
                format!("lock acquisition of uninitialized {}", addr),
            ));
            return Outcome::Park;
        }
        if satisfying.is_empty() {
            // Held. Retract the read and wait for an unlock; the
            // scheduler re-runs the acquisition in place once the lock's
            // latest write is 0 again.
            self.current.graph.remove_last(pos.thread);
            self.add_to_graph(LabelEnum::Block(Block::new(pos, BlockType::Lock(addr))));
            return Outcome::Park;
        }
        self.assign_rf(pos, &satisfying, true, true);
        self.check_new_access(pos);
        self.commit_rmw_write(pos, addr, MemOrdering::Relaxed, 1, WriteKind::CasExcl);
        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 2,
        }
    }

    /// Barrier arrival: a fetch-and-decrement. The thread that brings the
    /// counter to 0 releases every earlier arrival.
    pub(crate) fn handle_barrier_wait(&mut self, pos: Event, addr: MemAddr) -> Outcome {
        let kind = ReadKind::Fai {
            op: FaiOp::Sub,
            operand: 1,
        };
        // Under barrier-aware reduction the arrival FAIs take their single
        // placement and generate no alternatives.
        let enumerate = !self.config.bam;
        let val = match self.rmw_read(pos, addr, MemOrdering::AcqRel, kind, enumerate) {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let newv = val.wrapping_sub(1);
        self.commit_rmw_write(pos, addr, MemOrdering::AcqRel, newv, WriteKind::BarrierFai);
        if newv == 0 {
            return Outcome::Continue {
                reply: Reply::Unit,
                next: pos.index + 2,
            };
        }
        let bpos = pos.next().next();
        if self.is_replay(bpos) {
            self.replay_event(LabelEnum::Block(Block::new(bpos, BlockType::Barrier(addr))));
        } else {
            self.add_to_graph(LabelEnum::Block(Block::new(bpos, BlockType::Barrier(addr))));
        }
        Outcome::ParkDeliver {
            reply: Reply::Unit,
            next: bpos.index,
        }
    }

    pub(crate) fn handle_fence(&mut self, pos: Event, ordering: MemOrdering) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Fence(Fence::new(pos, ordering)));
        } else {
            self.add_to_graph(LabelEnum::Fence(Fence::new(pos, ordering)));
        }
        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_malloc(&mut self, pos: Event, words: u64, heap: bool) -> Outcome {
        if self.is_replay(pos) {
            let LabelEnum::Malloc(mlab) = self.current.graph.label(pos) else {
                panic!("replayed malloc at {} is not a Malloc label", pos);
            };
            let addr = mlab.addr();
            self.replay_event(LabelEnum::Malloc(Malloc::new(pos, addr, words)));
            return Outcome::Continue {
                reply: Reply::Addr(addr),
                next: pos.index + 1,
            };
        }
        let addr = self.current.alloc.fresh(words);
        let pos = self.add_to_graph(LabelEnum::Malloc(Malloc::new(pos, addr, words)));
        self.current.graph.register_alloc(pos, addr, words, heap);
        Outcome::Continue {
            reply: Reply::Addr(addr),
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_free(&mut self, pos: Event, addr: MemAddr) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Free(Free::new(pos, addr)));
            return Outcome::Continue {
                reply: Reply::Unit,
                next: pos.index + 1,
            };
        }
        let checked = match self.current.graph.alloc_covering(addr) {
            None => Err(ErrorDetails::new(
                pos,
                VerificationError::AccessNonMalloc,
                format!("free of non-allocated address {}", addr),
            )),
            Some((base, _)) if base != addr => Err(ErrorDetails::new(
                pos,
                VerificationError::AccessNonMalloc,
                format!("free of {} inside an allocation starting at {}", addr, base),
            )),
            Some((_, info)) => match info.free {
                Some(f) => Err(ErrorDetails::new(
                    pos,
                    VerificationError::DoubleFree,
                    format!("second free of {}", addr),
                )
                .with_racy(f)),
                None => Ok(info.size),
            },
        };
        let size = match checked {
            Ok(size) => size,
            Err(err) => {
                self.report_error(err);
                return Outcome::Park;
            }
        };
        let pos = self.add_to_graph(LabelEnum::Free(Free::new(pos, addr)));
        self.current.graph.register_free(pos, addr);

        // An access to the allocation that is not ordered before the free
        // can also observe freed memory.
        let racy = {
            let g = &self.current.graph;
            let hb = self.checker.hb_full(g, pos);
            (0..size)
                .map(|off| addr.plus(off))
                .flat_map(|a| {
                    g.co_list(a)
                        .iter()
                        .chain(g.reads_list(a).iter())
                        .copied()
                        .collect::<Vec<_>>()
                })
                .find(|&e| !hb.contains(e))
        };
        if let Some(e) = racy {
            self.report_error(
                ErrorDetails::new(
                    pos,
                    VerificationError::AccessFreed,
                    format!("free of {} races with an access", addr),
                )
                .with_racy(e),
            );
            return Outcome::Park;
        }

        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_block(&mut self, pos: Event, btype: BlockType) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Block(Block::new(pos, btype)));
            return Outcome::Park;
        }
        self.add_to_graph(LabelEnum::Block(Block::new(pos, btype.clone())));
        if btype == BlockType::Assert && self.checker.is_consistent(&self.current.graph) {
            self.report_error(ErrorDetails::new(
                pos,
                VerificationError::AssertionFailure,
                "assertion failed".to_owned(),
            ));
        }
        Outcome::Park
    }

    pub(crate) fn handle_toss(&mut self, pos: Event) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Toss(Toss::new(pos)));
            let LabelEnum::Toss(tlab) = self.current.graph.label(pos) else {
                unreachable!()
            };
            let result = tlab.result();
            return Outcome::Continue {
                reply: Reply::Bool(result),
                next: pos.index + 1,
            };
        }
        let pos = self.add_to_graph(LabelEnum::Toss(Toss::new(pos)));
        let stamp = self.current.graph.label(pos).stamp();

        if self.config.mode == ExplorationMode::Estimation {
            self.telemetry.histogram(EXECS_EST, 2.0);
            let toss = self.rng.gen_bool(0.5);
            let LabelEnum::Toss(tlab) = self.current.graph.label_mut(pos) else {
                unreachable!()
            };
            tlab.set_result(toss);
            return Outcome::Continue {
                reply: Reply::Bool(toss),
                next: pos.index + 1,
            };
        }

        push_worklist(&mut self.current.rqueue, stamp, RevisitEnum::RerunForward(pos));
        Outcome::Continue {
            reply: Reply::Bool(Toss::maximal()),
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_choice(
        &mut self,
        pos: Event,
        range: std::ops::RangeInclusive<u64>,
    ) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Choice(Choice::new(pos, range)));
            let LabelEnum::Choice(chlab) = self.current.graph.label(pos) else {
                unreachable!()
            };
            let result = chlab.result();
            return Outcome::Continue {
                reply: Reply::Val(result),
                next: pos.index + 1,
            };
        }
        let (start, end) = (*range.start(), *range.end());
        let pos = self.add_to_graph(LabelEnum::Choice(Choice::new(pos, range)));
        let stamp = self.current.graph.label(pos).stamp();

        if self.config.mode == ExplorationMode::Estimation {
            self.telemetry
                .histogram(EXECS_EST, (end - start + 1) as f64);
            let result = self.rng.gen_range(start..=end);
            let LabelEnum::Choice(chlab) = self.current.graph.label_mut(pos) else {
                unreachable!()
            };
            chlab.set_result(result);
            return Outcome::Continue {
                reply: Reply::Val(result),
                next: pos.index + 1,
            };
        }

        if start < end {
            push_worklist(&mut self.current.rqueue, stamp, RevisitEnum::RerunForward(pos));
        }
        Outcome::Continue {
            reply: Reply::Val(start),
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_optional(&mut self, pos: Event) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Optional(Optional::new(pos)));
            let LabelEnum::Optional(olab) = self.current.graph.label(pos) else {
                unreachable!()
            };
            let expanded = olab.is_expanded();
            return Outcome::Continue {
                reply: Reply::Bool(expanded),
                next: pos.index + 1,
            };
        }
        let pos = self.add_to_graph(LabelEnum::Optional(Optional::new(pos)));
        let stamp = self.current.graph.label(pos).stamp();

        if self.config.mode == ExplorationMode::Estimation {
            self.telemetry.histogram(EXECS_EST, 2.0);
            let expanded = self.rng.gen_bool(0.5);
            let LabelEnum::Optional(olab) = self.current.graph.label_mut(pos) else {
                unreachable!()
            };
            olab.set_expanded(expanded);
            return Outcome::Continue {
                reply: Reply::Bool(expanded),
                next: pos.index + 1,
            };
        }

        push_worklist(
            &mut self.current.rqueue,
            stamp,
            RevisitEnum::OptionalForward(pos),
        );
        Outcome::Continue {
            reply: Reply::Bool(false),
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_method_begin(&mut self, pos: Event, name: String) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::MethodBegin(MethodBegin::new(pos, name)));
        } else {
            self.add_to_graph(LabelEnum::MethodBegin(MethodBegin::new(pos, name)));
        }
        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 1,
        }
    }

    pub(crate) fn handle_method_end(&mut self, pos: Event, name: String) -> Outcome {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::MethodEnd(MethodEnd::new(pos, name)));
        } else {
            self.add_to_graph(LabelEnum::MethodEnd(MethodEnd::new(pos, name)));
        }
        Outcome::Continue {
            reply: Reply::Unit,
            next: pos.index + 1,
        }
    }

    /// A panic in model code. Unlike `memforge::assert`, the model's state
    /// is unrecoverable, so the run stops even with keep-going set.
    pub(crate) fn handle_panic(&mut self, pos: Event, msg: String) {
        // A panic inside a moot branch (e.g. model code observing a
        // speculatively broken mutual exclusion) is part of the discarded
        // speculation, not a verification outcome.
        if self.moot {
            return;
        }
        self.report_error(ErrorDetails::new(pos, VerificationError::Panic, msg));
        self.stop();
    }

    // ==== read/write machinery

    /// The read half of an RMW: replay or add, pick an rf, race-check.
    /// Returns the observed value, or the outcome that parks the worker.
    fn rmw_read(
        &mut self,
        pos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        kind: ReadKind,
        enumerate: bool,
    ) -> Result<u64, Outcome> {
        if self.is_replay(pos) {
            self.replay_event(LabelEnum::Read(Read::new(pos, addr, ordering, kind)));
            return Ok(self
                .current
                .graph
                .val(pos)
                .expect("replayed RMW read has no rf"));
        }
        if let Some(err) = self.access_error(pos, addr) {
            self.report_error(err);
            return Err(Outcome::Park);
        }
        self.add_to_graph(LabelEnum::Read(Read::new(pos, addr, ordering, kind)));
        match self.pick_read_rf(pos, enumerate) {
            Some(val) => {
                self.check_new_access(pos);
                Ok(val)
            }
            None => {
                self.report_error(ErrorDetails::new(
                    pos,
                    VerificationError::UninitializedMem,
                    format!("atomic update of uninitialized {}", addr),
                ));
                Err(Outcome::Park)
            }
        }
    }

    /// The write half of an RMW. It has exactly one legal coherence
    /// placement: immediately after the write its read observed.
    fn commit_rmw_write(
        &mut self,
        rpos: Event,
        addr: MemAddr,
        ordering: MemOrdering,
        val: u64,
        kind: WriteKind,
    ) {
        let wpos = rpos.next();
        if self.is_replay(wpos) {
            self.replay_event(LabelEnum::Write(Write::new(wpos, addr, ordering, val, kind)));
            return;
        }
        let rf = self
            .current
            .graph
            .read_label(rpos)
            .and_then(|r| r.rf())
            .expect("exclusive write without a resolved paired read");
        let wpos = self.add_to_graph(LabelEnum::Write(Write::new(wpos, addr, ordering, val, kind)));
        self.current.graph.insert_co_after(wpos, Some(rf));
        // Completing an RMW whose rf another RMW already consumed makes
        // the branch moot; the revisits computed below still stand (they
        // are how the competing RMW gets reordered after this one).
        if self.current.graph.has_exclusive_reader(rf, Some(rpos)) {
            self.moot = true;
        }
        if !(kind == WriteKind::BarrierFai && self.config.bam) {
            self.calc_revisits(wpos);
        }
        self.check_new_access(wpos);
    }

    /// Pick the rf for a just-added read: the maximal candidate, queuing
    /// the rest as forward revisits (or a random one in estimation mode).
    /// Returns the value read, or None if no write is readable.
    ///
    /// An exclusive read may pick a write another RMW has consumed. The
    /// speculation makes this branch moot, but the new RMW's write then
    /// revisits the competing read, which is exactly how the alternative
    /// RMW orders are discovered.
    fn pick_read_rf(&mut self, pos: Event, enumerate: bool) -> Option<u64> {
        let (rfs, exclusive) = {
            let g = &self.current.graph;
            let rlab = g.read_label(pos).unwrap();
            let mut rfs = self.checker.coherent_stores(g, rlab);
            if self.config.symmetry {
                SymmetryChecker::filter_symmetric_rfs(g, &mut rfs);
            }
            (rfs, rlab.is_exclusive())
        };
        if rfs.is_empty() {
            return None;
        }
        self.assign_rf(pos, &rfs, enumerate, exclusive);
        self.current.graph.val(pos)
    }

    /// Make the rf choice among the (maximal-first) candidates, register
    /// the read, and flag the branch moot if the choice breaks RMW
    /// uniqueness.
    fn assign_rf(&mut self, pos: Event, rfs: &[Event], enumerate: bool, exclusive: bool) {
        let stamp = self.current.graph.label(pos).stamp();
        if !enumerate {
            // Reads that take only the maximal choice (barrier arrivals
            // under BAM) do so in every mode.
            self.current.graph.change_rf(pos, Some(rfs[0]));
        } else if self.config.mode == ExplorationMode::Estimation {
            self.telemetry.histogram(EXECS_EST, rfs.len() as f64);
            let idx = self.rng.gen_range(0..rfs.len());
            info!("| choosing rf {} out of {}", idx, rfs.len());
            self.current.graph.change_rf(pos, Some(rfs[idx]));
        } else {
            self.current.graph.change_rf(pos, Some(rfs[0]));
            for &rf in &rfs[1..] {
                push_worklist(
                    &mut self.current.rqueue,
                    stamp,
                    RevisitEnum::new_read_forward(pos, rf),
                );
            }
        }
        let chosen = self.current.graph.read_label(pos).unwrap().rf().unwrap();
        if exclusive && self.current.graph.has_exclusive_reader(chosen, Some(pos)) {
            self.moot = true;
        }
        self.current.graph.register_read(&pos);
    }

    /// Place a just-added plain write in coherence order: maximally, with
    /// the other placements queued as forward revisits.
    fn place_write(&mut self, pos: Event, enumerate: bool) {
        let placings = {
            let g = &self.current.graph;
            let wlab = g.write_label(pos).unwrap();
            self.checker.coherent_placings(g, wlab)
        };
        assert!(!placings.is_empty(), "no coherence placement for {}", pos);
        let stamp = self.current.graph.label(pos).stamp();

        if self.config.mode == ExplorationMode::Estimation {
            self.telemetry.histogram(EXECS_EST, placings.len() as f64);
            let idx = self.rng.gen_range(0..placings.len());
            self.current.graph.insert_co_after(pos, placings[idx]);
            return;
        }
        self.current.graph.insert_co_after(pos, placings[0]);
        if enumerate {
            for &pred in &placings[1..] {
                push_worklist(
                    &mut self.current.rqueue,
                    stamp,
                    RevisitEnum::new_write_forward(pos, pred.unwrap_or_else(Event::new_init)),
                );
            }
        }
    }

    fn check_new_access(&mut self, pos: Event) {
        if let Some(err) = self.checker.check_races(&self.current.graph, pos) {
            self.report_error(err);
        }
    }

    fn access_error(&self, pos: Event, addr: MemAddr) -> Option<ErrorDetails> {
        let g = &self.current.graph;
        match g.alloc_covering(addr) {
            None => Some(ErrorDetails::new(
                pos,
                VerificationError::AccessNonMalloc,
                format!("access to non-allocated address {}", addr),
            )),
            Some((_, info)) => info.free.map(|f| {
                ErrorDetails::new(
                    pos,
                    VerificationError::AccessFreed,
                    format!("access to freed address {}", addr),
                )
                .with_racy(f)
            }),
        }
    }

    // ==== backward revisits

    /// The backward revisit set of the write at `pos`: the existing
    /// same-address reads that could consistently be changed to read from
    /// it, filtered down to maximal extensions so that no execution is
    /// derived twice.
    fn calc_revisits(&mut self, pos: Event) {
        if self.config.symmetry {
            let g = &self.current.graph;
            let flab = g.thread_first(pos.thread).unwrap();
            if flab.sym_id().is_some()
                && SymmetryChecker::prefix_symmetric(g, flab.sym_id(), pos)
            {
                return;
            }
        }

        let revs: Vec<Event> = {
            let g = &self.current.graph;
            let wlab = g.write_label(pos).unwrap();
            let stamp0 = wlab.stamp();
            let porf = wlab.porf();
            let addr = wlab.addr();
            g.reads_list(addr)
                .iter()
                .rev()
                .map(|&r| g.read_label(r).unwrap())
                .filter(|rlab| rlab.stamp() < stamp0 && !porf.contains(rlab.pos()))
                // Stop at the first non-maximal read: it cannot be deleted,
                // so any stamp-earlier revisit is futile.
                .take_while(|rlab| self.is_maximal_read(rlab, &Revisit::new(rlab.pos(), pos)))
                .filter(|rlab| {
                    self.revisit_atomicity_ok(rlab, pos)
                        && self.checker.is_revisit_consistent(g, rlab, wlab)
                })
                .take_while(|rlab| self.is_maximal_extension(&Revisit::new(rlab.pos(), pos)))
                .map(|rlab| rlab.pos())
                .collect()
        };

        if self.config.mode == ExplorationMode::Estimation {
            self.pick_revisit(revs, pos);
            return;
        }

        let stamp = self.current.graph.label(pos).stamp();
        for &r in &revs {
            push_worklist(
                &mut self.current.rqueue,
                stamp,
                RevisitEnum::new_backward(r, pos),
            );
        }
    }

    /// Whether `rlab` reads from a stamp-later write that the revisit
    /// would delete. Such a read has already been revisited and must not
    /// be revisited again from a smaller prefix.
    fn revisited_by_deleted(&self, rlab: &Read, rev: &Revisit) -> bool {
        let g = &self.current.graph;
        rlab.rf().is_some_and(|rf| {
            let stamp = g.label(rf).stamp();
            stamp > rlab.stamp()
                && stamp > g.label(rev.pos).stamp()
                && !g.write_label(rev.rev).unwrap().porf().contains(rf)
        })
    }

    fn is_maximal_read(&self, rlab: &Read, rev: &Revisit) -> bool {
        !self.revisited_by_deleted(rlab, rev)
            && rlab.is_revisitable()
            && self.checker.reads_tiebreaker(&self.current.graph, rlab, rev)
    }

    /// An exclusive read may not be revisited into a write that already
    /// feeds another RMW surviving the restriction.
    fn revisit_atomicity_ok(&self, rlab: &Read, wpos: Event) -> bool {
        if !rlab.is_exclusive() {
            return true;
        }
        let g = &self.current.graph;
        let v = g.revisit_view(&Revisit::new(rlab.pos(), wpos));
        !g.write_label(wpos)
            .unwrap()
            .readers()
            .iter()
            .any(|&r| v.contains(r) && g.is_rmw_reader(r))
    }

    /// No event deleted by the revisit may have been added non-maximally;
    /// otherwise the revisited graph is reachable from a different branch
    /// and exploring it here would duplicate work.
    fn is_maximal_extension(&self, rev: &Revisit) -> bool {
        let g = &self.current.graph;
        let porf = g.write_label(rev.rev).unwrap().porf();
        let stamp = g.label(rev.pos).stamp();
        for thread in g.threads.iter() {
            // Binary search for the first event the revisit would delete
            // (the predicate is monotonic over po-ordered events).
            let i = thread
                .labels
                .partition_point(|lab| lab.stamp() <= stamp || porf.contains(lab.pos()));
            if thread.labels[i..]
                .iter()
                .any(|lab| !self.is_maximal(lab, rev))
            {
                return false;
            }
        }
        true
    }

    fn is_maximal(&self, lab: &LabelEnum, rev: &Revisit) -> bool {
        match lab {
            LabelEnum::Read(rlab) => self.is_maximal_read(rlab, rev),
            LabelEnum::Write(wlab) => self.write_added_max(wlab),
            LabelEnum::Toss(tlab) => tlab.result() == Toss::maximal(),
            LabelEnum::Choice(chlab) => chlab.result() == *chlab.range().start(),
            LabelEnum::Optional(olab) => !olab.is_expanded(),
            _ => true,
        }
    }

    /// A write was added maximally iff it was placed coherence-last at
    /// addition time, i.e. every coherence-successor carries a later stamp.
    fn write_added_max(&self, wlab: &Write) -> bool {
        let g = &self.current.graph;
        let addr = wlab.addr();
        let i = g.co_index(addr, wlab.pos());
        g.co_list(addr)[i + 1..]
            .iter()
            .all(|&w2| g.label(w2).stamp() > wlab.stamp())
    }

    // ==== the backtracking loop

    /// Pop revisits until one yields a new branch to run, unwinding the
    /// state stack as queues empty. Returns false when nothing is left.
    pub(crate) fn try_revisit(&mut self) -> bool {
        loop {
            if self.current.rqueue.is_empty() {
                if self.try_pop_state() {
                    continue;
                }
                return false;
            }
            let rev = pop_worklist(&mut self.current.rqueue);
            trace!("popped revisit {:?}", rev);
            if match &rev {
                RevisitEnum::ReadForward(r) => self.read_forward_revisit(r),
                RevisitEnum::WriteForward(r) => self.write_forward_revisit(r),
                RevisitEnum::Backward(r) => self.backward_revisit(r),
                RevisitEnum::OptionalForward(pos) => self.optional_forward_revisit(*pos),
                RevisitEnum::RerunForward(pos) => self.rerun_forward_revisit(*pos),
            } {
                return true;
            }
        }
    }

    fn read_forward_revisit(&mut self, rev: &Revisit) -> bool {
        info!("================ read forward revisit {:?} ================", rev);
        let stamp = self.current.graph.label(rev.pos).stamp();
        self.current.graph.change_rf(rev.pos, Some(rev.rev));
        self.current.graph.cut_to_stamp(stamp);
        true
    }

    fn write_forward_revisit(&mut self, rev: &Revisit) -> bool {
        info!("================ write forward revisit {:?} ================", rev);
        let stamp = self.current.graph.label(rev.pos).stamp();
        let pred = if rev.rev == Event::new_init() {
            None
        } else {
            Some(rev.rev)
        };
        self.current.graph.change_co(rev.pos, pred);
        self.current.graph.cut_to_stamp(stamp);
        true
    }

    fn rerun_forward_revisit(&mut self, pos: Event) -> bool {
        let stamp = self.current.graph.label(pos).stamp();
        match self.current.graph.label_mut(pos) {
            LabelEnum::Toss(tlab) => tlab.set_result(!tlab.result()),
            LabelEnum::Choice(chlab) => {
                let next = chlab.result() + 1;
                chlab.set_result(next);
                if next < *chlab.range().end() {
                    push_worklist(
                        &mut self.current.rqueue,
                        stamp,
                        RevisitEnum::RerunForward(pos),
                    );
                }
            }
            lab => panic!("rerun revisit on unexpected label {}", lab),
        }
        self.current.graph.cut_to_stamp(stamp);
        true
    }

    fn optional_forward_revisit(&mut self, pos: Event) -> bool {
        let stamp = self.current.graph.label(pos).stamp();
        match self.current.graph.label_mut(pos) {
            LabelEnum::Optional(olab) => olab.set_expanded(true),
            lab => panic!("optional revisit on unexpected label {}", lab),
        }
        self.current.graph.cut_to_stamp(stamp);
        true
    }

    /// Mark reads in the revisiting write's porf prefix non-revisitable,
    /// preventing the same revisit from being re-derived inside the new
    /// branch.
    fn mark_prefix_non_revisitable(&mut self, write: Event) {
        let prefix = self
            .current
            .graph
            .write_label(write)
            .unwrap()
            .porf()
            .clone();
        for thread in self.current.graph.threads.iter_mut() {
            let j = thread
                .labels
                .partition_point(|lab| prefix.contains(lab.pos()));
            for lab in &mut thread.labels[..j] {
                if let LabelEnum::Read(rlab) = lab {
                    rlab.set_revisitable(false)
                }
            }
        }
    }

    fn backward_revisit(&mut self, rev: &Revisit) -> bool {
        info!("================ backward revisit {:?} ================", rev);
        let v = self.current.graph.revisit_view(rev);
        let ng = self.current.graph.copy_to_view(&v);

        self.push_state();
        self.current.graph = ng;
        self.current.alloc = AddrAllocator::new();
        self.current.alloc.seed_above(self.current.graph.max_addr());

        self.mark_prefix_non_revisitable(rev.rev);
        self.current.graph.change_rf(rev.pos, Some(rev.rev));

        if self.config.verbose >= 3 {
            println!("graph after backward revisit:");
            println!("{}", self.current.graph);
        }

        // With a pool attached, hand the reconstructed branch to an idle
        // worker instead of exploring it inline, as long as the shared
        // queue is short (backpressure).
        if let Some((queue, cond)) = &self.pqueue {
            let mut queue = queue.lock().expect("couldn't lock the shared work queue");
            if queue.len() < ExecutionPool::MAX_QUEUE_SIZE {
                queue.push_back(Some(self.current.graph.clone()));
                cond.notify_one();
                return false;
            }
        }

        true
    }

    /// Estimation mode: keep at most one randomly chosen backward revisit,
    /// possibly abandoning the current execution in its favor.
    fn pick_revisit(&mut self, revs: Vec<Event>, pos: Event) {
        self.telemetry
            .histogram(EXECS_EST, (revs.len() + 1) as f64);
        let idx = self.rng.gen_range(0..=revs.len());
        if idx < revs.len() {
            let stamp = self.current.graph.label(pos).stamp();
            push_worklist(
                &mut self.current.rqueue,
                stamp,
                RevisitEnum::new_backward(revs[idx], pos),
            );
            self.block_exec(BlockType::Assume);
            self.stop();
        }
    }

    /// Block every live thread, abandoning the rest of this execution.
    fn block_exec(&mut self, bt: BlockType) {
        let tids: Vec<ThreadId> = self
            .current
            .graph
            .thread_ids()
            .into_iter()
            .filter(|&t| {
                !self.current.graph.is_thread_complete(t)
                    && !self.current.graph.is_thread_blocked(t)
            })
            .collect();
        for t in tids {
            let pos = self.current.graph.thread_last(t).unwrap().pos().next();
            self.add_to_graph(LabelEnum::Block(Block::new(pos, bt.clone())));
        }
    }

    fn try_pop_state(&mut self) -> bool {
        match self.states.pop() {
            Some(state) => {
                self.current = state;
                true
            }
            None => false,
        }
    }

    fn push_state(&mut self) {
        self.states.push(std::mem::take(&mut self.current));
    }

    fn stop(&mut self) {
        self.stop = true;
    }

    fn unstop(&mut self) {
        self.stop = false;
    }

    fn is_stopped(&self) -> bool {
        self.stop
    }

    // ==== execution accounting

    /// Invoked when a single execution has finished. Returns true when
    /// there is nothing more to explore.
    pub(crate) fn complete_execution(&mut self) -> bool {
        if cfg!(debug_assertions) {
            self.current.graph.validate();
        }

        if self.replay_info.replay_mode() {
            println!("{}", self.print_graph(None));
            if let Some(err) = self.replay_info.error() {
                println!("memforge replay: reproduced {}", err);
            }
            return true;
        }

        let maybe_block = self.check_blocked();
        if self.record_ending_telemetry(&maybe_block) {
            return true;
        }
        self.unstop();
        !self.try_revisit()
    }

    /// Why the execution is blocked, if it is.
    fn check_blocked(&self) -> Option<BlockType> {
        for t in self.current.graph.thread_ids() {
            if self.current.graph.is_thread_blocked(t) {
                if let Some(LabelEnum::Block(blab)) = self.current.graph.thread_last(t) {
                    return Some(blab.btype().clone());
                }
            }
        }
        None
    }

    fn record_ending_telemetry(&mut self, maybe_block: &Option<BlockType>) -> bool {
        if !self.errors.is_empty() && !self.config.keep_going_after_error {
            // The run stops on the first hard error; the partial execution
            // it interrupted is not counted.
            return true;
        }

        let consistent = !self.moot && self.checker.is_consistent(&self.current.graph);
        let exceeded = self
            .bound
            .as_ref()
            .is_some_and(|b| b.exceeds(&self.current.graph));
        if !consistent || exceeded {
            self.telemetry.counter(MOOT);
        } else if maybe_block.is_some() {
            self.telemetry.counter(BLOCKED);
            self.check_liveness_violation();
            if self.config.verbose >= 2 {
                println!("one more blocked execution");
                println!("{}", self.print_graph(None));
            }
        } else {
            self.telemetry.counter(EXECS);
            self.check_unfreed_memory();
            if self.config.verbose >= 1 {
                println!("one more complete execution");
                println!("{}", self.print_graph(None));
            }
        }

        let num_execs = self.telemetry.read_counter(EXECS);
        let num_blocked = self.telemetry.read_counter(BLOCKED);
        let num_total = num_execs + num_blocked;
        if self.config.progress_report > 0 {
            if num_total % (self.config.progress_report as u64) == 0 {
                self.print_progress(num_execs, num_blocked);
            }
        } else if Self::should_report(num_total) {
            self.print_progress(num_execs, num_blocked);
        }

        if let Some(n) = self.config.max_iterations {
            if n <= num_total {
                println!("stopping exploration: max_iterations reached");
                return true;
            }
        }
        false
    }

    fn print_progress(&self, execs: u64, blocked: u64) {
        let elapsed = Instant::now() - self.started_at;
        let total = execs + blocked;
        let speed = if elapsed.as_secs() < 5 {
            String::new()
        } else {
            format!(" ({:.2}/sec)", total as f64 / elapsed.as_secs() as f64)
        };
        println!(
            "executions so far: {} total, {} complete, {} blocked{}",
            total, execs, blocked, speed
        );
    }

    /// Adaptive progress cadence: report at 1, 2, ..., 10, 20, ..., 100,
    /// 200, and so on.
    fn should_report(n: u64) -> bool {
        if n == 0 {
            return false;
        }
        let mut p = n;
        while p % 10 == 0 {
            p /= 10;
        }
        p < 10
    }

    /// A blocked execution in which every unfinished thread sits in a spin
    /// loop makes no progress under any schedule.
    fn check_liveness_violation(&mut self) {
        if !self.config.check_liveness {
            return;
        }
        let g = &self.current.graph;
        let unfinished: Vec<ThreadId> = g
            .thread_ids()
            .into_iter()
            .filter(|&t| !g.is_thread_complete(t))
            .collect();
        if unfinished.is_empty() {
            return;
        }
        let all_spin = unfinished.iter().all(|&t| {
            matches!(
                g.thread_last(t),
                Some(LabelEnum::Block(blab)) if *blab.btype() == BlockType::Spinloop
            )
        });
        if all_spin {
            let pos = g.thread_last(unfinished[0]).unwrap().pos();
            self.report_error(ErrorDetails::new(
                pos,
                VerificationError::Liveness,
                "all unfinished threads spin without any writer making progress".to_owned(),
            ));
        }
    }

    /// Heap allocations never freed in a complete execution, warned once
    /// per allocation site.
    fn check_unfreed_memory(&mut self) {
        let leaked: Vec<(Event, MemAddr)> = self
            .current
            .graph
            .allocs()
            .filter(|(_, info)| info.heap && info.free.is_none())
            .map(|(addr, info)| (info.malloc, *addr))
            .collect();
        for (malloc, addr) in leaked {
            self.report_error(ErrorDetails::new(
                malloc,
                VerificationError::UnfreedMemory,
                format!("allocation {} is never freed", addr),
            ));
        }
    }

    // ==== error reporting

    fn report_error(&mut self, err: ErrorDetails) {
        if self.moot {
            return;
        }
        let hard = err.kind.is_hard()
            || (err.kind == VerificationError::WWRace && self.config.symmetry)
            || self.config.warnings_as_errors;
        if !hard {
            if self.warned.insert((err.kind, err.pos)) {
                log::warn!("{}", err);
                self.warnings.push(err);
            }
            return;
        }

        println!("memforge: {}", err);
        println!("{}", self.print_graph(Some(err.pos)));
        self.store_replay_information(Some(err.pos), &err);
        self.errors.push(err);
        if !self.config.keep_going_after_error {
            self.stop();
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("{}", msg);
        self.warn_limit -= 1;
        if self.config.warnings_as_errors {
            eprintln!("exiting because warnings_as_errors is set");
            std::process::exit(exitcode::DATAERR);
        }
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            execs: self.telemetry.read_counter(EXECS) as usize,
            blocked: self.telemetry.read_counter(BLOCKED) as usize,
            moot: self.telemetry.read_counter(MOOT) as usize,
            errors: self.errors.clone(),
            warnings: self.warnings.clone(),
        }
    }

    pub(crate) fn execs_est(&self) -> f64 {
        self.telemetry.read_histogram(EXECS_EST)
    }

    pub(crate) fn sorted_error_graph_printout(&self) -> String {
        format!("{}", self.replay_info.sorted_error_graph())
    }

    // ==== printing

    pub(crate) fn print_graph(&self, pos: Option<Event>) -> String {
        let out = format!("{}", self.current.graph);
        if self.config.dot_file.is_some() {
            self.print_graph_dot(pos)
                .expect("could not dot-print to the supplied file");
        }
        out
    }

    /// DOT rendering of the error's causal prefix (or the whole graph):
    /// one cluster per thread, po edges downward, rf in green, create/join
    /// in blue.
    fn print_graph_dot(&self, error: Option<Event>) -> std::io::Result<()> {
        let g = &self.current.graph;
        let v = if let Some(event) = error {
            g.porf(event)
        } else {
            g.view_from_stamp(g.stamp())
        };
        let mut out = File::create(self.config.dot_file.as_ref().unwrap())?;

        writeln!(out, "strict digraph {{")?;
        writeln!(out, "node [shape=plaintext]")?;
        writeln!(out, "labeljust=l")?;
        writeln!(out, "splines=false")?;

        for (tid, ind) in v.entries() {
            writeln!(out, "subgraph cluster_{} {{", tid)?;
            writeln!(out, "\tlabel=\"thread {}\"", tid)?;
            for j in 1..=ind {
                let pos = Event::new(tid, j);
                let highlight = if error == Some(pos) {
                    ",style=filled,fillcolor=yellow"
                } else {
                    ""
                };
                writeln!(out, "\t\"{}\" [label=<{}>{}]", pos, g.label(pos), highlight)?;
            }
            writeln!(out, "}}")?;
        }

        for (tid, ind) in v.entries() {
            for j in 1..=ind {
                let pos = Event::new(tid, j);
                if j < ind {
                    writeln!(out, "\"{}\" -> \"{}\"", pos, pos.next())?;
                }
                match g.label(pos) {
                    LabelEnum::Read(rlab) => {
                        if let Some(rf) = rlab.rf() {
                            if rf.index > 0 {
                                writeln!(out, "\"{}\" -> \"{}\"[color=green]", rf, pos)?;
                            }
                        }
                    }
                    LabelEnum::TCreate(tclab) => {
                        if v.get(tclab.cid()).is_some_and(|i| i >= 1) {
                            writeln!(
                                out,
                                "\"{}\" -> \"{}\"[color=blue]",
                                pos,
                                Event::new(tclab.cid(), 1)
                            )?;
                        }
                    }
                    LabelEnum::TJoin(jlab) => {
                        if let Some(last) = v.get(jlab.cid()) {
                            writeln!(
                                out,
                                "\"{}\" -> \"{}\"[color=blue]",
                                Event::new(jlab.cid(), last),
                                pos
                            )?;
                        }
                    }
                    _ => {}
                }
            }
        }

        writeln!(out, "}}")?;
        Ok(())
    }
}

fn push_worklist(worklist: &mut RQueue, stamp: usize, r: RevisitEnum) {
    worklist.entry(stamp).or_default().push(r);
}

/// Pop from the highest stamp first: alternatives closest to the end of
/// the current execution are explored before deeper ones.
fn pop_worklist(worklist: &mut RQueue) -> RevisitEnum {
    let (stamp, rev, is_empty) = {
        let (stamp, revs) = worklist
            .iter_mut()
            .next_back()
            .expect("worklist is not empty");
        let rev = revs.pop().unwrap();
        (*stamp, rev, revs.is_empty())
    };
    if is_empty {
        worklist.remove(&stamp);
    }
    rev
}
