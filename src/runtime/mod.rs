//! The interpreter half of the engine.
//!
//! Checked threads run user closures on dedicated OS threads. Every visible
//! operation (memory access, spawn, join, blocking, nondet choice) is
//! issued to the driver through a rendezvous: the worker sends the
//! operation and parks until the driver replies. The driver runs on the
//! thread that called `verify` and resumes exactly one worker at a time, so
//! the target program executes single-threadedly, one operation per step,
//! under the driver's schedule.
//!
//! Re-running an execution (after a revisit restricted the graph) re-spawns
//! all workers and replays from scratch: operations that are already in the
//! graph are validated against the recorded labels and answered from them;
//! execution becomes "fresh" once a worker runs past its recorded prefix.
//!
//! Workers that are still parked when an execution ends (blocked threads,
//! or threads the restriction cut) are torn down by an abort sentinel that
//! unwinds their stack without running model-visible side effects.

pub(crate) mod failure;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::trace;

use crate::event::Event;
use crate::event_label::{BlockType, FaiOp};
use crate::loc::{MemAddr, MemOrdering};
use crate::runtime::failure::{panic_message, AbortToken};
use crate::thread::{main_thread_id, ThreadId};
use crate::trust::{Outcome, Trust};

/// A visible operation issued by a checked thread.
pub(crate) enum Op {
    Spawn {
        /// Taken by the session when it spawns the worker.
        main: Option<Box<dyn FnOnce() + Send + 'static>>,
        name: Option<String>,
        sym: Option<ThreadId>,
    },
    Join { tid: ThreadId },
    Load { addr: MemAddr, ordering: MemOrdering },
    Store { addr: MemAddr, ordering: MemOrdering, val: u64 },
    Cas { addr: MemAddr, ordering: MemOrdering, expected: u64, new: u64 },
    Fai { addr: MemAddr, ordering: MemOrdering, op: FaiOp, operand: u64 },
    Lock { addr: MemAddr },
    BarrierWait { addr: MemAddr },
    Fence { ordering: MemOrdering },
    Malloc { words: u64, heap: bool },
    Free { addr: MemAddr },
    /// User-level blocking: assume/assert/spin-loop. Terminal for the
    /// thread; the worker is never resumed.
    Block { btype: BlockType },
    Toss,
    Choice { range: RangeInclusive<u64> },
    Optional,
    MethodBegin { name: String },
    MethodEnd { name: String },
    End,
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Spawn { name, sym, .. } => {
                f.debug_struct("Spawn").field("name", name).field("sym", sym).finish()
            }
            Op::Join { tid } => f.debug_struct("Join").field("tid", tid).finish(),
            Op::Load { addr, ordering } => write!(f, "Load({}, {})", addr, ordering),
            Op::Store { addr, ordering, val } => write!(f, "Store({}, {}, {})", addr, ordering, val),
            Op::Cas { addr, expected, new, .. } => write!(f, "Cas({}, {}, {})", addr, expected, new),
            Op::Fai { addr, operand, .. } => write!(f, "Fai({}, {})", addr, operand),
            Op::Lock { addr } => write!(f, "Lock({})", addr),
            Op::BarrierWait { addr } => write!(f, "BarrierWait({})", addr),
            Op::Fence { ordering } => write!(f, "Fence({})", ordering),
            Op::Malloc { words, heap } => write!(f, "Malloc({}, heap={})", words, heap),
            Op::Free { addr } => write!(f, "Free({})", addr),
            Op::Block { btype } => write!(f, "Block({:?})", btype),
            Op::Toss => write!(f, "Toss"),
            Op::Choice { range } => write!(f, "Choice({:?})", range),
            Op::Optional => write!(f, "Optional"),
            Op::MethodBegin { name } => write!(f, "MethodBegin({})", name),
            Op::MethodEnd { name } => write!(f, "MethodEnd({})", name),
            Op::End => write!(f, "End"),
        }
    }
}

/// The driver's answer to an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Unit,
    Tid(ThreadId),
    Val(u64),
    Bool(bool),
    Addr(MemAddr),
}

enum DownMsg {
    Resume(Reply),
    Abort,
}

enum UpMsg {
    Op(ThreadId, Op),
    Panicked(ThreadId, String),
}

struct WorkerCtx {
    tid: ThreadId,
    up_tx: Sender<UpMsg>,
    down_rx: Receiver<DownMsg>,
    /// Set once the session abandoned this worker; later operations (from
    /// destructors running during the abort unwind) get dummy replies
    /// instead of panicking again, which would abort the process.
    aborted: Cell<bool>,
}

thread_local! {
    static CTX: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
}

/// Issue an operation to the driver and park until it replies.
pub(crate) fn issue(op: Op) -> Reply {
    CTX.with(|c| {
        let b = c.borrow();
        let ctx = b.as_ref().expect(
            "memforge operations are only valid inside verify/estimate/replay",
        );
        if ctx.aborted.get() {
            return abandoned_reply(&op);
        }
        if ctx.up_tx.send(UpMsg::Op(ctx.tid, op)).is_err() {
            // The session is gone (it panicked); unwind quietly.
            ctx.aborted.set(true);
            std::panic::panic_any(AbortToken);
        }
        match ctx.down_rx.recv() {
            Ok(DownMsg::Resume(r)) => r,
            _ => {
                ctx.aborted.set(true);
                std::panic::panic_any(AbortToken);
            }
        }
    })
}

/// A plausible reply for an operation issued while the worker is being
/// abandoned (e.g. a guard unlocking in a destructor during unwinding).
/// The values are never observed by a live execution.
fn abandoned_reply(op: &Op) -> Reply {
    match op {
        Op::Spawn { .. } => Reply::Tid(main_thread_id()),
        Op::Load { .. } | Op::Cas { .. } | Op::Fai { .. } => Reply::Val(0),
        Op::Malloc { .. } => Reply::Addr(MemAddr(0)),
        Op::Toss | Op::Optional => Reply::Bool(false),
        Op::Choice { range } => Reply::Val(*range.start()),
        _ => Reply::Unit,
    }
}

/// The id of the calling checked thread.
pub(crate) fn current_tid() -> ThreadId {
    CTX.with(|c| {
        c.borrow()
            .as_ref()
            .expect("not inside a checked thread")
            .tid
    })
}

enum Action {
    Process(Op),
    Deliver(Reply),
}

enum WorkerState {
    NotStarted,
    Ready(Action),
    Running,
    Done,
}

struct Worker {
    down_tx: Sender<DownMsg>,
    handle: Option<JoinHandle<()>>,
    state: WorkerState,
    /// Program-order index of the worker's next operation. Trails behind
    /// the graph during replay; equals the thread's size once execution is
    /// fresh.
    next_index: u32,
}

/// One execution's worth of workers plus the scheduling loop.
pub(crate) struct Session {
    up_tx: Sender<UpMsg>,
    up_rx: Receiver<UpMsg>,
    workers: BTreeMap<ThreadId, Worker>,
}

impl Session {
    /// Run the model once: from a fresh graph, or replaying the current
    /// restriction and continuing past it.
    pub(crate) fn run<F>(trust: &Rc<RefCell<Trust>>, f: &Arc<F>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (up_tx, up_rx) = channel();
        let mut session = Session {
            up_tx,
            up_rx,
            workers: BTreeMap::new(),
        };
        let f = Arc::clone(f);
        session.spawn_worker(main_thread_id(), Some("main".to_owned()), Box::new(move || f()));
        session.drive(trust);
        session.teardown();
    }

    fn spawn_worker(
        &mut self,
        tid: ThreadId,
        name: Option<String>,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) {
        let (down_tx, down_rx) = channel();
        let up_tx = self.up_tx.clone();
        let thread_name = name.unwrap_or_else(|| format!("memforge-{}", tid));
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_main(tid, f, up_tx, down_rx))
            .expect("could not spawn checked thread");
        self.workers.insert(
            tid,
            Worker {
                down_tx,
                handle: Some(handle),
                state: WorkerState::NotStarted,
                next_index: 1,
            },
        );
    }

    fn drive(&mut self, trust: &Rc<RefCell<Trust>>) {
        loop {
            let candidates: Vec<(ThreadId, u32)> = self
                .workers
                .iter()
                .filter(|(_, w)| {
                    matches!(w.state, WorkerState::NotStarted | WorkerState::Ready(_))
                })
                .map(|(&tid, w)| (tid, w.next_index))
                .collect();
            let Some(tid) = trust.borrow_mut().next_thread(&candidates) else {
                break;
            };
            self.step(trust, tid);
        }
    }

    fn step(&mut self, trust: &Rc<RefCell<Trust>>, tid: ThreadId) {
        let w = self
            .workers
            .get_mut(&tid)
            .unwrap_or_else(|| panic!("scheduled thread {} has no worker", tid));
        match std::mem::replace(&mut w.state, WorkerState::Running) {
            WorkerState::NotStarted => {
                let _ = w.down_tx.send(DownMsg::Resume(Reply::Unit));
                self.await_msg(trust);
            }
            WorkerState::Ready(Action::Deliver(reply)) => {
                let _ = w.down_tx.send(DownMsg::Resume(reply));
                self.await_msg(trust);
            }
            WorkerState::Ready(Action::Process(op)) => self.process(trust, tid, op),
            WorkerState::Running | WorkerState::Done => {
                panic!("scheduled thread {} is not schedulable", tid)
            }
        }
    }

    /// Hand one operation to the driver and act on the outcome.
    fn process(&mut self, trust: &Rc<RefCell<Trust>>, tid: ThreadId, mut op: Op) {
        let pos = Event::new(tid, self.workers[&tid].next_index);
        trace!("processing {:?} from {} at {}", op, tid, pos);

        // Spawn and End need session-side work; everything else is a plain
        // synchronous call into the driver.
        match op {
            Op::Spawn {
                ref mut main,
                ref name,
                sym,
            } => {
                let f = main.take().expect("spawn closure already taken");
                let ctid = trust.borrow_mut().handle_tcreate(pos, name.clone(), sym);
                self.spawn_worker(ctid, name.clone(), f);
                self.finish(
                    trust,
                    tid,
                    op,
                    Outcome::Continue {
                        reply: Reply::Tid(ctid),
                        next: pos.index + 1,
                    },
                );
            }
            Op::End => {
                trust.borrow_mut().handle_tend(pos);
                let w = self.workers.get_mut(&tid).unwrap();
                w.state = WorkerState::Done;
                // The worker exits right after this reply; nothing more to
                // wait for.
                let _ = w.down_tx.send(DownMsg::Resume(Reply::Unit));
            }
            _ => {
                let outcome = {
                    let mut t = trust.borrow_mut();
                    match &op {
                        Op::Join { tid: cid } => t.handle_tjoin(pos, *cid),
                        Op::Load { addr, ordering } => t.handle_load(pos, *addr, *ordering),
                        Op::Store { addr, ordering, val } => {
                            t.handle_store(pos, *addr, *ordering, *val)
                        }
                        Op::Cas { addr, ordering, expected, new } => {
                            t.handle_cas(pos, *addr, *ordering, *expected, *new)
                        }
                        Op::Fai { addr, ordering, op: fop, operand } => {
                            t.handle_fai(pos, *addr, *ordering, *fop, *operand)
                        }
                        Op::Lock { addr } => t.handle_lock(pos, *addr),
                        Op::BarrierWait { addr } => t.handle_barrier_wait(pos, *addr),
                        Op::Fence { ordering } => t.handle_fence(pos, *ordering),
                        Op::Malloc { words, heap } => t.handle_malloc(pos, *words, *heap),
                        Op::Free { addr } => t.handle_free(pos, *addr),
                        Op::Block { btype } => t.handle_block(pos, btype.clone()),
                        Op::Toss => t.handle_toss(pos),
                        Op::Choice { range } => t.handle_choice(pos, range.clone()),
                        Op::Optional => t.handle_optional(pos),
                        Op::MethodBegin { name } => t.handle_method_begin(pos, name.clone()),
                        Op::MethodEnd { name } => t.handle_method_end(pos, name.clone()),
                        Op::Spawn { .. } | Op::End => unreachable!(),
                    }
                };
                self.finish(trust, tid, op, outcome);
            }
        }
    }

    fn finish(&mut self, trust: &Rc<RefCell<Trust>>, tid: ThreadId, op: Op, outcome: Outcome) {
        let w = self.workers.get_mut(&tid).unwrap();
        match outcome {
            Outcome::Continue { reply, next } => {
                w.next_index = next;
                w.state = WorkerState::Running;
                let _ = w.down_tx.send(DownMsg::Resume(reply));
                self.await_msg(trust);
            }
            Outcome::Park => {
                // The operation is re-examined at the same position if the
                // scheduler ever unblocks the thread.
                w.state = WorkerState::Ready(Action::Process(op));
            }
            Outcome::ParkDeliver { reply, next } => {
                w.next_index = next;
                w.state = WorkerState::Ready(Action::Deliver(reply));
            }
        }
    }

    /// Wait for the one running worker to reach its next rendezvous.
    fn await_msg(&mut self, trust: &Rc<RefCell<Trust>>) {
        match self.up_rx.recv() {
            Ok(UpMsg::Op(tid, op)) => {
                self.workers.get_mut(&tid).unwrap().state =
                    WorkerState::Ready(Action::Process(op));
            }
            Ok(UpMsg::Panicked(tid, msg)) => {
                let pos = Event::new(tid, self.workers[&tid].next_index);
                self.workers.get_mut(&tid).unwrap().state = WorkerState::Done;
                trust.borrow_mut().handle_panic(pos, msg);
            }
            Err(_) => panic!("checked thread disappeared without a message"),
        }
    }

    /// Abort every unfinished worker and join all OS threads.
    fn teardown(mut self) {
        for w in self.workers.values() {
            if !matches!(w.state, WorkerState::Done) {
                let _ = w.down_tx.send(DownMsg::Abort);
            }
        }
        for w in self.workers.values_mut() {
            if let Some(handle) = w.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_main(
    tid: ThreadId,
    f: Box<dyn FnOnce() + Send + 'static>,
    up_tx: Sender<UpMsg>,
    down_rx: Receiver<DownMsg>,
) {
    CTX.with(|c| {
        *c.borrow_mut() = Some(WorkerCtx {
            tid,
            up_tx: up_tx.clone(),
            down_rx,
            aborted: Cell::new(false),
        });
    });

    // Wait for the start signal; the session may abort a thread that never
    // gets scheduled (e.g. spawned right before the execution blocked).
    let started = CTX.with(|c| {
        let b = c.borrow();
        let ctx = b.as_ref().unwrap();
        match ctx.down_rx.recv() {
            Ok(DownMsg::Resume(_)) => true,
            _ => {
                ctx.aborted.set(true);
                false
            }
        }
    });

    if started {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => {
                issue(Op::End);
            }
            Err(payload) => {
                if payload.downcast_ref::<AbortToken>().is_none() {
                    let _ = up_tx.send(UpMsg::Panicked(tid, panic_message(&*payload)));
                }
            }
        }
    }

    CTX.with(|c| *c.borrow_mut() = None);
}
