use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::event_label::*;
use crate::indexed_map::IndexedMap;
use crate::loc::MemAddr;
use crate::replay as REPLAY;
use crate::revisit::Revisit;
use crate::thread::{construct_thread_id, main_thread_id, ThreadId};
use crate::vector_clock::VectorClock;

/// Encapsulates the execution information about a single thread
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ThreadInfo {
    tid: ThreadId,
    tclab: TCreate,
    pub(crate) labels: Vec<LabelEnum>,
}

/// A live (or freed) allocation: its `Malloc` event, its extent, and the
/// `Free` event once one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AllocInfo {
    pub(crate) malloc: Event,
    pub(crate) size: u64,
    pub(crate) free: Option<Event>,
    /// Heap allocations participate in the unfreed-memory check; the
    /// static-like cells backing `sync` types do not.
    pub(crate) heap: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ExecutionGraph {
    pub(crate) threads: IndexedMap<ThreadInfo>,
    stamp: usize,
    pub(crate) finished_threads: HashSet<ThreadId>,
    /// Coherence order: for each address, the total order over the writes
    /// to it. Entries are positions into `threads`, not owned labels.
    co: BTreeMap<MemAddr, Vec<Event>>,
    /// Same-address reads in increasing stamp order; the backward-revisit
    /// candidate pool.
    reads: BTreeMap<MemAddr, Vec<Event>>,
    /// Allocations keyed by base address.
    allocs: BTreeMap<MemAddr, AllocInfo>,
}

impl ExecutionGraph {
    pub(crate) fn new() -> ExecutionGraph {
        let t0 = main_thread_id();
        let event = Event::new(t0, 0);
        ExecutionGraph {
            threads: IndexedMap::new_with_first(ThreadInfo {
                tid: t0,
                tclab: TCreate::new(event, t0, Some("main".to_owned()), None, vec![]),
                labels: vec![LabelEnum::Begin(Begin::main())],
            }),
            stamp: 0,
            finished_threads: HashSet::new(),
            co: BTreeMap::new(),
            reads: BTreeMap::new(),
            allocs: BTreeMap::new(),
        }
    }

    /// Called just before an execution starts. When a revisit replays, the
    /// graph is a restriction of an older one and may carry bookkeeping that
    /// must be recomputed for the fresh run.
    pub(crate) fn initialize_for_execution(&mut self) {
        self.finished_threads.clear();
        let tids = self.threads.iter().map(|t| t.tid).collect::<Vec<_>>();
        tids.iter().for_each(|tid| self.on_thread_changed(tid));
    }

    pub(crate) fn on_thread_changed(&mut self, tid: &ThreadId) {
        if let Some(LabelEnum::End(_)) = self.get_thr(tid).labels.last() {
            self.finished_threads.insert(*tid);
        } else {
            self.finished_threads.remove(tid);
        }
    }

    pub(crate) fn validate_replay_event(&self, actual: &LabelEnum) {
        let expected = &self.get_thr(&actual.thread()).labels[actual.index() as usize];
        Self::panic_if_err(expected.compare_for_replay(actual));
    }

    pub(crate) fn panic_if_err(res: Result<(), String>) {
        if let Err(e) = res {
            panic!(
                "Nondeterministic model. Checked programs must be deterministic; \
                 any nondeterminism should go through memforge::nondet().\n{}",
                e
            );
        }
    }

    /// Find the ThreadInfo structure for a thread, or panic with an error message.
    pub(crate) fn get_thr(&self, tid: &ThreadId) -> &ThreadInfo {
        self.get_thr_opt(tid).unwrap_or_else(|| {
            panic!(
                "Can't find thread {} in graph with thread ids {:?}",
                *tid,
                self.threads.iter().map(|t| t.tid).collect::<Vec<_>>()
            )
        })
    }

    pub(crate) fn get_thr_opt(&self, tid: &ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(usize::from(*tid))
    }

    pub(crate) fn get_thr_opt_mut(&mut self, tid: &ThreadId) -> Option<&mut ThreadInfo> {
        self.threads.get_mut(usize::from(*tid))
    }

    pub(crate) fn get_thr_mut(&mut self, tid: &ThreadId) -> &mut ThreadInfo {
        self.get_thr_opt_mut(tid).unwrap_or_else(|| {
            panic!("Can't find thread {}", *tid);
        })
    }

    // ====

    pub(crate) fn stamp(&self) -> usize {
        self.stamp
    }

    pub(crate) fn next_stamp(&mut self) -> usize {
        self.stamp += 1;
        self.stamp
    }

    pub(crate) fn add_new_thread(&mut self, tclab: TCreate) {
        assert!(self.get_thr_opt(&tclab.cid()).is_none());

        let tid = tclab.cid();
        let index: usize = tid.into();
        self.threads.insert(
            index,
            ThreadInfo {
                tid,
                tclab,
                labels: vec![],
            },
        );
    }

    pub(crate) fn thread_ids(&self) -> BTreeSet<ThreadId> {
        self.threads.iter().map(|t| t.tid).collect()
    }

    pub(crate) fn get_thread_tclab(&self, tid: ThreadId) -> TCreate {
        self.get_thr(&tid).tclab.clone()
    }

    /// Picks the thread id for a spawn at `pos`, identified across replays
    /// by the chain of spawn indices that led to it. A spawn the graph has
    /// already seen keeps its id; a new spawn gets an id above every
    /// existing one.
    pub(crate) fn tid_for_spawn(&self, pos: &Event, origination_vec: &[u32]) -> ThreadId {
        assert_eq!(origination_vec.last(), Some(&pos.index));

        let mut spawning_thread = main_thread_id();
        for (i, &event_idx) in origination_vec.iter().enumerate() {
            let is_last_spawn = i == origination_vec.len() - 1;
            if event_idx < self.thread_size(spawning_thread) as u32 {
                let spawn_pos = Event::new(spawning_thread, event_idx);
                let lab = self.label(spawn_pos);
                if let LabelEnum::TCreate(tclab) = lab {
                    let expected_origination_vec = &origination_vec[0..=i];
                    assert_eq!(expected_origination_vec, tclab.origination_vec());

                    if is_last_spawn {
                        return tclab.cid(); // Same id as the previous run.
                    }

                    spawning_thread = tclab.cid();
                } else {
                    let msg = format!("Expected spawn event at {:?} but have {:?}", spawn_pos, lab);
                    Self::panic_if_err(Result::Err(msg));
                }
            } else if !is_last_spawn {
                let msg = format!(
                    "Expected to find event at {} for thread {}",
                    event_idx, spawning_thread
                );
                Self::panic_if_err(Result::Err(msg));
            }
        }

        let max_id = self
            .threads
            .iter()
            .map(|t| t.tid.to_number())
            .max()
            .expect("Didn't expect zero threads!");
        construct_thread_id(max_id + 1)
    }

    pub(crate) fn thread_size(&self, t: ThreadId) -> usize {
        self.get_thr(&t).labels.len()
    }

    pub(crate) fn thread_last(&self, t: ThreadId) -> Option<&LabelEnum> {
        self.get_thr(&t).labels.last()
    }

    pub(crate) fn thread_first(&self, t: ThreadId) -> Option<&Begin> {
        self.get_thr(&t).labels.first().map(|lab| {
            if let LabelEnum::Begin(blab) = lab {
                blab
            } else {
                panic!("First event of {} is not Begin", t)
            }
        })
    }

    pub(crate) fn is_thread_blocked(&self, t: ThreadId) -> bool {
        matches!(self.thread_last(t), Some(LabelEnum::Block(_)))
    }

    pub(crate) fn is_thread_complete(&self, t: ThreadId) -> bool {
        self.finished_threads.contains(&t)
    }

    /// Add a label to the graph, giving it a new stamp if it does not have one.
    pub(crate) fn add_label(&mut self, lab: LabelEnum) -> Event {
        self.add(lab).pos()
    }

    fn add(&mut self, mut lab: LabelEnum) -> &LabelEnum {
        if !lab.stamped() {
            lab.set_stamp(self.next_stamp());
        }

        let pos = lab.pos();
        let existing_label_count = self.thread_size(lab.thread());

        match (lab.index() as usize).cmp(&existing_label_count) {
            Ordering::Greater => {
                panic!(
                    "Label index {} must be <= {}",
                    lab.index(),
                    existing_label_count
                );
            }
            Ordering::Equal => {
                self.get_thr_mut(&pos.thread).labels.push(lab);
            }
            Ordering::Less => {
                // Overwriting a label: a blocked read turning into a Block,
                // or a removed Block turning back into the retried
                // operation. The old label must not leave stale index
                // entries behind.
                let old = &self.get_thr(&pos.thread).labels[pos.index as usize];
                assert!(
                    matches!(old, LabelEnum::Block(_))
                        || matches!(lab, LabelEnum::Block(_)),
                    "Only Block labels may overwrite or be overwritten, found {} over {}",
                    lab,
                    old
                );
                self.get_thr_mut(&pos.thread).labels[pos.index as usize] = lab;
            }
        }
        self.on_thread_changed(&pos.thread);
        &self.get_thr(&pos.thread).labels[pos.index as usize]
    }

    pub(crate) fn contains(&self, e: Event) -> bool {
        self.get_thr_opt(&e.thread).is_some() && (e.index as usize) < self.thread_size(e.thread)
    }

    /// Retract the most recently added event of a thread, repairing the
    /// indices that referenced it.
    pub(crate) fn remove_last(&mut self, t: ThreadId) {
        let Some(lab) = self.get_thr(&t).labels.last() else {
            return;
        };
        let pos = lab.pos();
        match lab {
            LabelEnum::Read(_) => {
                self.remove_from_readers(pos);
                if let Some(rlab) = self.read_label(pos) {
                    let addr = rlab.addr();
                    if let Some(v) = self.reads.get_mut(&addr) {
                        v.retain(|&e| e != pos);
                    }
                }
            }
            LabelEnum::Write(wlab) => {
                assert!(
                    wlab.readers().is_empty(),
                    "removing a write that is still read"
                );
                let addr = wlab.addr();
                if let Some(v) = self.co.get_mut(&addr) {
                    v.retain(|&e| e != pos);
                }
            }
            LabelEnum::Malloc(mlab) => {
                self.allocs.remove(&mlab.addr());
            }
            LabelEnum::Free(flab) => {
                let addr = flab.addr();
                if let Some(info) = self.allocs.get_mut(&addr) {
                    info.free = None;
                }
            }
            _ => {}
        }
        self.get_thr_mut(&t).labels.pop();
        self.on_thread_changed(&t);
    }

    pub(crate) fn label(&self, e: Event) -> &LabelEnum {
        &self.get_thr(&e.thread).labels[e.index as usize]
    }

    pub(crate) fn label_opt(&self, e: Event) -> Option<&LabelEnum> {
        self.get_thr_opt(&e.thread)
            .and_then(|t| t.labels.get(e.index as usize))
    }

    pub(crate) fn label_mut(&mut self, e: Event) -> &mut LabelEnum {
        &mut self.get_thr_mut(&e.thread).labels[e.index as usize]
    }

    pub(crate) fn is_read(&self, e: Event) -> bool {
        matches!(self.label(e), LabelEnum::Read(_))
    }

    pub(crate) fn read_label(&self, e: Event) -> Option<&Read> {
        if let LabelEnum::Read(l) = self.label(e) {
            Some(l)
        } else {
            None
        }
    }

    pub(crate) fn read_label_mut(&mut self, e: Event) -> Option<&mut Read> {
        if let LabelEnum::Read(l) = self.label_mut(e) {
            Some(l)
        } else {
            None
        }
    }

    pub(crate) fn is_write(&self, e: Event) -> bool {
        matches!(self.label(e), LabelEnum::Write(_))
    }

    pub(crate) fn write_label(&self, e: Event) -> Option<&Write> {
        if let LabelEnum::Write(l) = self.label(e) {
            Some(l)
        } else {
            None
        }
    }

    pub(crate) fn write_label_mut(&mut self, e: Event) -> Option<&mut Write> {
        if let LabelEnum::Write(l) = self.label_mut(e) {
            Some(l)
        } else {
            None
        }
    }

    /// The value observed by the read at `e` through its current rf.
    pub(crate) fn val(&self, e: Event) -> Option<u64> {
        let rlab = self.read_label(e)?;
        let rf = rlab.rf()?;
        Some(self.write_label(rf).unwrap().val())
    }

    // ==== reads-from maintenance

    // Removes the read from its rf's readers
    fn remove_from_readers(&mut self, read: Event) {
        if let Some(old_rf) = self.read_label(read).and_then(|r| r.rf()) {
            self.write_label_mut(old_rf).unwrap().remove_reader(read);
        }
    }

    /// Change rf in-place, updating the writes' reader sets
    pub(crate) fn change_rf(&mut self, read: Event, write: Option<Event>) {
        assert!(self.is_read(read));
        assert!(write.is_none() || self.is_write(write.unwrap()));

        self.remove_from_readers(read);

        if let Some(new_rf) = write {
            self.write_label_mut(new_rf).unwrap().add_reader(read);
        }

        self.read_label_mut(read).unwrap().set_rf(write);
    }

    /// Cache a read in the per-address pool (no-op if the read turned into
    /// a Block).
    pub(crate) fn register_read(&mut self, read: &Event) {
        let Some(rlab) = self.read_label(*read) else {
            return;
        };
        let addr = rlab.addr();
        self.reads.entry(addr).or_default().push(*read);
    }

    /// Same-address reads, in increasing stamp order.
    pub(crate) fn reads_list(&self, addr: MemAddr) -> &[Event] {
        self.reads.get(&addr).map(|v| v.as_slice()).unwrap_or(&[])
    }

    // ==== coherence order

    /// The coherence order over the writes to `addr`.
    pub(crate) fn co_list(&self, addr: MemAddr) -> &[Event] {
        self.co.get(&addr).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Every address some write has touched.
    pub(crate) fn co_addrs(&self) -> impl Iterator<Item = MemAddr> + '_ {
        self.co.keys().copied()
    }

    /// Insert a write into its location's coherence order, right after
    /// `pred` (or coherence-first for `None`).
    pub(crate) fn insert_co_after(&mut self, write: Event, pred: Option<Event>) {
        let addr = self.write_label(write).unwrap().addr();
        let list = self.co.entry(addr).or_default();
        let at = match pred {
            None => 0,
            Some(p) => {
                list.iter()
                    .position(|&e| e == p)
                    .expect("co predecessor is not a write to this address")
                    + 1
            }
        };
        list.insert(at, write);
    }

    /// Move a write to a new coherence position.
    pub(crate) fn change_co(&mut self, write: Event, pred: Option<Event>) {
        let addr = self.write_label(write).unwrap().addr();
        self.co.get_mut(&addr).unwrap().retain(|&e| e != write);
        self.insert_co_after(write, pred);
    }

    pub(crate) fn co_index(&self, addr: MemAddr, write: Event) -> usize {
        self.co_list(addr)
            .iter()
            .position(|&e| e == write)
            .expect("write is not in its location's coherence order")
    }

    pub(crate) fn co_max(&self, addr: MemAddr) -> Option<Event> {
        self.co_list(addr).last().copied()
    }

    pub(crate) fn co_imm_pred(&self, addr: MemAddr, write: Event) -> Option<Event> {
        let i = self.co_index(addr, write);
        if i == 0 {
            None
        } else {
            Some(self.co_list(addr)[i - 1])
        }
    }

    pub(crate) fn co_imm_succ(&self, addr: MemAddr, write: Event) -> Option<Event> {
        let i = self.co_index(addr, write);
        self.co_list(addr).get(i + 1).copied()
    }

    /// The immediate from-read successor of a read: the first write
    /// coherence-after the write the read observes. (Further fr-successors
    /// are reachable through co.)
    pub(crate) fn fr_imm_succ(&self, read: Event) -> Option<Event> {
        let rlab = self.read_label(read)?;
        let rf = rlab.rf()?;
        self.co_imm_succ(rlab.addr(), rf)
    }

    /// Whether `r` is the read half of a *completed* RMW: an exclusive
    /// read whose paired write follows it in program order. A failed CAS
    /// has an exclusive read kind but no paired write, and does not
    /// consume its rf's exclusivity.
    pub(crate) fn is_rmw_reader(&self, r: Event) -> bool {
        self.read_label(r).is_some_and(|rlab| rlab.is_exclusive())
            && self
                .label_opt(r.next())
                .is_some_and(|lab| matches!(lab, LabelEnum::Write(w) if w.is_exclusive()))
    }

    /// Whether `write` already feeds an RMW through a reader other than
    /// `excluding`. At most one RMW may consume any given write.
    pub(crate) fn has_exclusive_reader(&self, write: Event, excluding: Option<Event>) -> bool {
        self.write_label(write)
            .unwrap()
            .readers()
            .iter()
            .any(|&r| Some(r) != excluding && self.is_rmw_reader(r))
    }

    // ==== allocations

    pub(crate) fn register_alloc(&mut self, malloc: Event, addr: MemAddr, size: u64, heap: bool) {
        self.allocs.insert(
            addr,
            AllocInfo {
                malloc,
                size,
                free: None,
                heap,
            },
        );
    }

    pub(crate) fn register_free(&mut self, free: Event, base: MemAddr) {
        self.allocs.get_mut(&base).unwrap().free = Some(free);
    }

    /// The allocation covering `addr`, if any.
    pub(crate) fn alloc_covering(&self, addr: MemAddr) -> Option<(MemAddr, &AllocInfo)> {
        self.allocs
            .range(..=addr)
            .next_back()
            .filter(|(base, info)| addr.0 < base.0 + info.size)
            .map(|(base, info)| (*base, info))
    }

    pub(crate) fn allocs(&self) -> impl Iterator<Item = (&MemAddr, &AllocInfo)> {
        self.allocs.iter()
    }

    /// The highest address any allocation covers; used to seed the address
    /// allocator when a graph is adopted from another worker.
    pub(crate) fn max_addr(&self) -> u64 {
        self.allocs
            .iter()
            .map(|(base, info)| base.0 + info.size - 1)
            .max()
            .unwrap_or(0)
    }

    // ==== views

    /// Vector clock with events stamp-{before or equal} the revisited read
    /// (inclusive) and the porf-prefix of the revisiting write (inclusive).
    // N.B. it doesn't include the revisited read's own rf dependency.
    pub(crate) fn revisit_view(&self, rev: &Revisit) -> VectorClock {
        let mut v = self.view_from_stamp(self.label(rev.pos).stamp());
        v.update(self.write_label(rev.rev).unwrap().porf());

        // v.update() may expose more TCreate labels than view_from_stamp
        // chose to; the corresponding Begin labels must come along or the
        // spawn structure of the restriction is broken.
        for thr in self.threads.iter() {
            if let Some(vc_limit_inclusive) = v.get(thr.tid) {
                for lab in thr.labels.iter().take(vc_limit_inclusive as usize + 1) {
                    if let LabelEnum::TCreate(tclab) = lab {
                        v.update_or_set(Event::new(tclab.cid(), 0));
                    }
                }
            }
        }

        v
    }

    /// Return a view with all the events up to the stamp (inclusive)
    pub(crate) fn view_from_stamp(&self, s: usize) -> VectorClock {
        let mut v = VectorClock::new();
        for thread in self.threads.iter() {
            // Labels are sorted by stamp. Find the last, if any, s.t. stamp <= s.
            let i = thread.labels.partition_point(|lab| lab.stamp() <= s);
            if i != 0 {
                v.update_or_set(thread.labels[i - 1].pos());
            }
        }
        v
    }

    /// Returns a VectorClock with the *full* porf view of pos,
    /// i.e. including the rf/TCreate/TEnd dependencies.
    pub(crate) fn porf(&self, pos: Event) -> VectorClock {
        let lab = self.label(pos);
        let mut porf = lab.cached_porf().clone();
        match lab {
            LabelEnum::Begin(blab) => {
                if let Some(parent) = blab.parent() {
                    porf.update(self.label(parent).cached_porf());
                }
            }
            LabelEnum::TJoin(jlab) => {
                porf.update(self.thread_last(jlab.cid()).unwrap().cached_porf());
            }
            LabelEnum::Read(rlab) => {
                if let Some(rf) = rlab.rf() {
                    porf.update(self.label(rf).cached_porf());
                }
            }
            _ => { /* Nothing more to do */ }
        };
        porf
    }

    // ==== restriction

    fn cut_to_view(&mut self, v: &VectorClock) {
        // Coherence order and read pool: drop events outside the view.
        self.co
            .values_mut()
            .for_each(|writes| writes.retain(|&e| v.contains(e)));
        self.co.retain(|_, vec| !vec.is_empty());

        self.reads
            .values_mut()
            .for_each(|vec| vec.retain(|&e| v.contains(e)));
        self.reads.retain(|_, vec| !vec.is_empty());

        // Readers: remove the deleted reads from kept writes' reader sets.
        let mut deleted_reads = vec![];
        for thread in self.threads.iter() {
            let j = thread.labels.partition_point(|lab| v.contains(lab.pos()));
            for lab in thread.labels[j..].iter() {
                if let LabelEnum::Read(rlab) = lab {
                    deleted_reads.push(rlab.pos());
                }
            }
        }
        for deleted in deleted_reads {
            self.remove_from_readers(deleted);
        }

        // Allocations: a deleted Malloc loses its entry, a deleted Free is
        // reset on its (kept) allocation.
        let mut deleted_mallocs = vec![];
        let mut deleted_frees = vec![];
        for thread in self.threads.iter() {
            let j = thread.labels.partition_point(|lab| v.contains(lab.pos()));
            for lab in thread.labels[j..].iter() {
                match lab {
                    LabelEnum::Malloc(mlab) => deleted_mallocs.push(mlab.addr()),
                    LabelEnum::Free(flab) => deleted_frees.push(flab.addr()),
                    _ => {}
                }
            }
        }
        for addr in deleted_mallocs {
            self.allocs.remove(&addr);
        }
        for addr in deleted_frees {
            if let Some(info) = self.allocs.get_mut(&addr) {
                info.free = None;
            }
        }

        // Erase all the threads not found in the vector clock.
        self.threads.retain(|t| v.get(t.tid).is_some());

        // Remove the labels from each thread which are not visible in the view.
        let tids = self.threads.iter().map(|t| t.tid).collect::<Vec<_>>();
        for tid in tids {
            let event_idx = v
                .get(tid)
                .expect("any thread not in the vector clock should already be erased")
                as usize
                + 1;
            let ind: usize = tid.into();
            self.threads[ind].labels.truncate(event_idx);
            self.on_thread_changed(&tid);
        }

        self.reassign_stamps();
        self.check_spawn_invariants();
    }

    /// Renumber all stamps to the dense range `[0, N)`, preserving
    /// insertion order. Stamps index the per-event memo tables of the
    /// consistency checker, so they must stay dense across restrictions.
    fn reassign_stamps(&mut self) {
        let mut all: Vec<Event> = self
            .threads
            .iter()
            .flat_map(|t| t.labels.iter().map(|l| l.pos()))
            .collect();
        all.sort_by_key(|&e| self.label(e).stamp());

        let count = all.len();
        for (new_stamp, e) in all.into_iter().enumerate() {
            self.label_mut(e).set_stamp(new_stamp);
        }
        self.stamp = count.saturating_sub(1);
    }

    pub(crate) fn cut_to_stamp(&mut self, s: usize) {
        let v = self.view_from_stamp(s);
        self.cut_to_view(&v);
    }

    pub(crate) fn copy_to_view(&self, v: &VectorClock) -> ExecutionGraph {
        // Clone, then restrict. Slower than a selective copy but it reuses
        // the subtle repair logic in cut_to_view.
        let mut other = self.clone();
        other.cut_to_view(v);
        other
    }

    fn check_spawn_invariants(&self) {
        // The spawn structure is represented three ways: TCreate labels,
        // Begin parents, and the per-thread tclab. They must agree.
        let child_thread_ids: BTreeSet<ThreadId> = self
            .thread_ids()
            .iter()
            .copied()
            .filter(|&tid| tid != main_thread_id())
            .collect();

        let mut threads_from_tcreate: BTreeMap<ThreadId, (ThreadId, usize)> = BTreeMap::new();
        for thread_info in self.threads.iter() {
            let parent_thread_id = thread_info.tid;
            for (event_idx, event) in thread_info.labels.iter().enumerate() {
                if let LabelEnum::TCreate(tc) = &event {
                    let child_thread_id = tc.cid();
                    assert!(!threads_from_tcreate.contains_key(&child_thread_id));
                    threads_from_tcreate.insert(child_thread_id, (parent_thread_id, event_idx));
                }
            }
        }

        let thread_ids_from_tcreate = threads_from_tcreate.keys().copied().collect::<Vec<_>>();
        let child_vec: Vec<ThreadId> = child_thread_ids.iter().copied().collect();
        assert_eq!(
            child_vec, thread_ids_from_tcreate,
            "threads and TCreate labels aren't consistent"
        );

        let mut threads_from_begin: BTreeMap<ThreadId, (ThreadId, usize)> = BTreeMap::new();
        for thread_info in self.threads.iter() {
            if thread_info.tid == main_thread_id() {
                continue;
            }
            let child_thread_id = thread_info.tid;
            if let Some(LabelEnum::Begin(blab)) = thread_info.labels.first() {
                if let Some(Event {
                    thread: parent_thread_id,
                    index: event_idx,
                }) = blab.parent()
                {
                    threads_from_begin
                        .insert(child_thread_id, (parent_thread_id, event_idx as usize));
                } else {
                    panic!("Every thread other than main must have a parent");
                }
            } else {
                panic!("First event must be Begin");
            }
        }

        assert_eq!(
            threads_from_begin, threads_from_tcreate,
            "begin and tcreate events are inconsistent"
        );

        let mut threads_from_thdinfo: BTreeMap<ThreadId, (ThreadId, usize)> = BTreeMap::new();
        for thread_info in self.threads.iter() {
            if thread_info.tid == main_thread_id() {
                continue;
            }
            let Event {
                thread: parent_thread_id,
                index: event_idx,
            } = thread_info.tclab.pos();
            threads_from_thdinfo.insert(thread_info.tid, (parent_thread_id, event_idx as usize));
        }

        assert_eq!(
            threads_from_tcreate, threads_from_thdinfo,
            "per-thread spawn info is inconsistent with the TCreate labels"
        );
    }

    /// Check the structural invariants the exploration relies on. Violations
    /// are engine bugs, not verification outcomes.
    pub(crate) fn validate(&self) {
        // rf containment and reader bidirectionality
        for thread in self.threads.iter() {
            for lab in thread.labels.iter() {
                if let LabelEnum::Read(rlab) = lab {
                    if let Some(rf) = rlab.rf() {
                        assert!(self.contains(rf), "rf of {} points outside the graph", lab);
                        let wlab = self.write_label(rf).expect("rf target is not a write");
                        assert!(
                            wlab.readers().contains(&rlab.pos()),
                            "reader set of {} is missing {}",
                            rf,
                            lab
                        );
                    }
                }
                if let LabelEnum::Write(wlab) = lab {
                    for &r in wlab.readers() {
                        assert!(self.contains(r));
                        assert_eq!(
                            self.read_label(r).and_then(|rl| rl.rf()),
                            Some(lab.pos()),
                            "reader {} of {} does not read from it",
                            r,
                            lab
                        );
                    }
                    let excl = wlab
                        .readers()
                        .iter()
                        .filter(|&&r| self.is_rmw_reader(r))
                        .count();
                    assert!(excl <= 1, "write {} has {} RMW readers", lab, excl);
                }
            }
        }

        // coherence totality: every write appears exactly once in its
        // location's order, and nothing else does
        let mut in_co = HashSet::new();
        for (addr, writes) in self.co.iter() {
            for (i, &w) in writes.iter().enumerate() {
                assert!(self.contains(w));
                let wlab = self.write_label(w).expect("co entry is not a write");
                assert_eq!(wlab.addr(), *addr);
                assert!(in_co.insert(w), "duplicate co entry {}", w);
                assert_eq!(
                    self.co_imm_pred(*addr, w),
                    if i == 0 { None } else { Some(writes[i - 1]) }
                );
                assert_eq!(self.co_imm_succ(*addr, w), writes.get(i + 1).copied());
            }
        }
        for thread in self.threads.iter() {
            for lab in thread.labels.iter() {
                if let LabelEnum::Write(_) = lab {
                    assert!(in_co.contains(&lab.pos()), "write {} is not in co", lab);
                }
            }
        }

        // stamp uniqueness and per-thread monotonicity. Stamps are dense
        // right after a restriction but a Block conversion (remove + re-add)
        // can leave holes in between; uniqueness and po-monotonicity are
        // what the memo tables and prefix computations actually rely on.
        let mut stamps: Vec<usize> = self
            .threads
            .iter()
            .flat_map(|t| t.labels.iter().map(|l| l.stamp()))
            .collect();
        stamps.sort_unstable();
        for w in stamps.windows(2) {
            assert!(w[0] < w[1], "duplicate stamp {}", w[0]);
        }
        assert!(
            stamps.last().is_none_or(|&s| s <= self.stamp),
            "label stamp exceeds the graph's stamp counter"
        );
        for thread in self.threads.iter() {
            for w in thread.labels.windows(2) {
                assert!(w[0].stamp() < w[1].stamp(), "stamps not monotone in po");
            }
        }

        self.check_spawn_invariants();
    }

    /// Creates a linearization of the execution graph. `pos`, when given,
    /// is the position of the error event and becomes the last node, which
    /// keeps the linearized counterexample minimal.
    pub(crate) fn top_sort(&self, pos: Option<Event>) -> REPLAY::LinearizedGraph {
        let maxs = if let Some(pos) = pos {
            vec![pos]
        } else {
            self.threads
                .iter()
                .map(|t| self.thread_last(t.tid).unwrap().pos())
                .collect()
        };

        let mut v = VectorClock::new();
        let mut sorted_graph = REPLAY::LinearizedGraph::new();

        for e in maxs {
            self.top_sort_util(&mut v, &mut sorted_graph, e);
        }

        sorted_graph
    }

    /// Recursive helper adding `e` and everything it depends on.
    fn top_sort_util(
        &self,
        view: &mut VectorClock,
        graph: &mut REPLAY::LinearizedGraph,
        e: Event,
    ) {
        if view.contains(e) {
            return;
        }

        let start_idx = view.get(e.thread).unwrap_or(0);
        view.update_or_set(e);

        for i in start_idx..=e.index {
            let ei = Event::new(e.thread, i);

            if let Some(rf) = self.read_label(ei).and_then(|r| r.rf()) {
                self.top_sort_util(view, graph, rf);
            }

            if let LabelEnum::TJoin(jlab) = self.label(ei) {
                self.top_sort_util(view, graph, self.thread_last(jlab.cid()).unwrap().pos());
            }

            if let LabelEnum::Begin(blab) = self.label(ei) {
                if let Some(parent) = blab.parent() {
                    self.top_sort_util(view, graph, parent);
                }
            }

            graph.insert_label(self.label(ei).clone());
        }
    }
}

impl Default for ExecutionGraph {
    fn default() -> Self {
        ExecutionGraph::new()
    }
}

impl std::fmt::Display for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Execution graph:")?;
        for thread_info in self.threads.iter() {
            let tid = thread_info.tid;
            match thread_info.tclab.name() {
                None => writeln!(f, "thread {}:", tid)?,
                Some(name) => writeln!(f, "thread \"{}\"[tid={}]:", name, tid)?,
            }
            for lab in thread_info.labels.iter() {
                writeln!(f, "\t{}", lab)?;
            }
        }
        for (addr, writes) in self.co.iter() {
            if writes.len() > 1 {
                write!(f, "co({}):", addr)?;
                for w in writes {
                    write!(f, " {}", w)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loc::MemOrdering;

    fn tid(t: u32) -> ThreadId {
        construct_thread_id(t)
    }

    // A two-thread graph: main spawns t1, both write and read `addr`.
    fn graph_with_two_writers(addr: MemAddr) -> ExecutionGraph {
        let mut g = ExecutionGraph::new();
        let t0 = main_thread_id();
        let t1 = tid(1);

        let create_pos = Event::new(t0, 1);
        let tclab = TCreate::new(create_pos, t1, None, None, vec![1]);
        g.add_label(LabelEnum::TCreate(tclab.clone()));
        g.add_new_thread(tclab);
        g.add_label(LabelEnum::Begin(Begin::new(
            Event::new(t1, 0),
            Some(create_pos),
            None,
        )));

        let w0 = Event::new(t0, 2);
        g.add_label(LabelEnum::Write(Write::new(
            w0,
            addr,
            MemOrdering::Relaxed,
            1,
            WriteKind::Plain,
        )));
        g.insert_co_after(w0, None);

        let w1 = Event::new(t1, 1);
        g.add_label(LabelEnum::Write(Write::new(
            w1,
            addr,
            MemOrdering::Relaxed,
            2,
            WriteKind::Plain,
        )));
        g.insert_co_after(w1, Some(w0));

        let r = Event::new(t0, 3);
        g.add_label(LabelEnum::Read(Read::new(
            r,
            addr,
            MemOrdering::Relaxed,
            ReadKind::Plain,
        )));
        g.register_read(&r);
        g.change_rf(r, Some(w1));

        g
    }

    #[test]
    fn invariants_hold_after_construction() {
        let addr = MemAddr(1);
        let g = graph_with_two_writers(addr);
        g.validate();
        assert_eq!(g.co_list(addr).len(), 2);
        assert_eq!(g.val(Event::new(main_thread_id(), 3)), Some(2));
    }

    #[test]
    fn change_rf_repairs_readers() {
        let addr = MemAddr(1);
        let mut g = graph_with_two_writers(addr);
        let r = Event::new(main_thread_id(), 3);
        let w0 = Event::new(main_thread_id(), 2);

        g.change_rf(r, Some(w0));
        g.validate();
        assert_eq!(g.val(r), Some(1));

        g.change_rf(r, None);
        g.validate();
        assert!(g
            .write_label(w0)
            .unwrap()
            .readers()
            .is_empty());
    }

    #[test]
    fn cut_to_stamp_keeps_stamps_dense() {
        let addr = MemAddr(1);
        let mut g = graph_with_two_writers(addr);
        // Cut right after t1's write (the read of main is dropped).
        let s = g.label(Event::new(tid(1), 1)).stamp();
        g.cut_to_stamp(s);
        g.validate();
        assert!(!g.contains(Event::new(main_thread_id(), 3)));
        assert_eq!(g.co_list(addr).len(), 2);
    }

    #[test]
    fn cut_to_stamp_restores_restriction() {
        let addr = MemAddr(1);
        let mut g = graph_with_two_writers(addr);
        let pre_threads = g.thread_ids();
        let s = g.label(Event::new(main_thread_id(), 2)).stamp();
        g.cut_to_stamp(s);
        g.validate();
        // t1's write and the read are gone; the spawn structure survives.
        assert_eq!(g.thread_ids(), pre_threads);
        assert_eq!(g.co_list(addr).len(), 1);
        assert!(!g.contains(Event::new(tid(1), 1)));
    }

    #[test]
    fn remove_last_repairs_co() {
        let addr = MemAddr(1);
        let mut g = graph_with_two_writers(addr);
        let r = Event::new(main_thread_id(), 3);
        g.change_rf(r, None);
        g.remove_last(main_thread_id());
        g.remove_last(tid(1));
        g.validate();
        assert_eq!(g.co_list(addr).len(), 1);
    }

    #[test]
    fn alloc_covering_respects_extents() {
        let mut g = ExecutionGraph::new();
        let m = Event::new(main_thread_id(), 1);
        g.add_label(LabelEnum::Malloc(Malloc::new(m, MemAddr(10), 3)));
        g.register_alloc(m, MemAddr(10), 3, true);
        assert!(g.alloc_covering(MemAddr(9)).is_none());
        assert!(g.alloc_covering(MemAddr(10)).is_some());
        assert!(g.alloc_covering(MemAddr(12)).is_some());
        assert!(g.alloc_covering(MemAddr(13)).is_none());
    }
}
