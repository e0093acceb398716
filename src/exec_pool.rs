//! Parallel exploration: a pool of workers, each owning a private driver
//! instance, fed from a shared queue of reconstructed backward-revisit
//! graphs.
//!
//! Ownership is strict: a graph is either being explored by exactly one
//! worker or sitting in the queue; handoff moves it, so two workers never
//! share mutable exploration state. The queue is bounded as backpressure:
//! when it is full, the producing driver keeps the branch and explores it
//! inline through its local revisit queue, so nothing is lost and nothing
//! blocks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::env;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::exec_graph::ExecutionGraph;
use crate::runtime::Session;
use crate::trust::Trust;
use crate::{Config, Stats};

#[derive(PartialEq, Debug)]
enum WorkerState {
    /// Created but not yet inside the worker loop.
    Created,
    /// Idle, waiting for the queue to fill.
    Waiting,
    /// Exploring a graph (and everything its local queue derives from it).
    Busy,
    /// Told to exit at the next loop iteration.
    Shutdown,
}

type LockableWorkerState = Arc<Mutex<WorkerState>>;

/// The backlog of graphs queued for distribution. `None` is the start
/// token: the worker that pops it explores from its own fresh graph.
type SharedWorkerDeque = Arc<Mutex<VecDeque<Option<ExecutionGraph>>>>;

type CondBlocker = Arc<Condvar>;

struct PoolWorker {
    thread_handle: Option<JoinHandle<()>>,
    worker_state: LockableWorkerState,
    thread_idx: usize,
    shared_queue: SharedWorkerDeque,
    loop_block_cond: CondBlocker,
    pool_can_drain: Arc<Mutex<bool>>,
    pool_exec_stats: Arc<Mutex<Stats>>,
    conf: Config,
    /// Executions are counted as they start so that max_iterations does
    /// not overshoot while the queue drains.
    exec_counter: Arc<Mutex<u64>>,
}

impl PoolWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        thread_idx: usize,
        shared_queue: SharedWorkerDeque,
        loop_block_cond: CondBlocker,
        pool_can_drain: Arc<Mutex<bool>>,
        pool_exec_stats: Arc<Mutex<Stats>>,
        conf: &Config,
        exec_counter: Arc<Mutex<u64>>,
    ) -> Self {
        debug!("created pool worker [{}]", thread_idx);
        Self {
            thread_handle: None,
            worker_state: Arc::new(Mutex::new(WorkerState::Created)),
            thread_idx,
            shared_queue,
            loop_block_cond,
            pool_can_drain,
            pool_exec_stats,
            conf: conf.clone(),
            exec_counter,
        }
    }

    fn start<F>(&mut self, exec_func: &Arc<F>)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let thread_idx = self.thread_idx;
        let worker_state = self.worker_state.clone();
        let shared_queue = self.shared_queue.clone();
        let loop_block_cond = self.loop_block_cond.clone();
        let exec_func = exec_func.clone();
        let pool_can_drain = self.pool_can_drain.clone();
        let pool_exec_stats = self.pool_exec_stats.clone();
        let conf = self.conf.clone();
        let exec_counter = self.exec_counter.clone();

        let thread_handle = std::thread::Builder::new()
            .name(format!("exec-pool-{}", self.thread_idx))
            .spawn(move || {
                worker_loop(
                    thread_idx,
                    worker_state,
                    shared_queue,
                    loop_block_cond,
                    pool_can_drain,
                    pool_exec_stats,
                    exec_func,
                    conf,
                    exec_counter,
                )
            })
            .expect("could not spawn pool worker thread");

        self.thread_handle = Some(thread_handle);
        trace!("started worker thread {}", self.thread_idx);
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<F>(
    thread_idx: usize,
    worker_state: LockableWorkerState,
    shared_queue: SharedWorkerDeque,
    loop_block_cond: CondBlocker,
    pool_can_drain: Arc<Mutex<bool>>,
    pool_exec_stats: Arc<Mutex<Stats>>,
    exec_func: Arc<F>,
    conf: Config,
    exec_counter: Arc<Mutex<u64>>,
) where
    F: Fn() + Send + Sync + 'static,
{
    let wait_timeout = Duration::from_millis(250);
    let max_iterations = conf.max_iterations;

    // One private driver per worker, alive across all the graphs the
    // worker adopts.
    let mut trust = Trust::new(conf, false);
    trust.set_parallel_queues((shared_queue.clone(), loop_block_cond.clone()));
    let trust = Rc::new(RefCell::new(trust));

    loop {
        if *worker_state.lock().expect("lock worker state") == WorkerState::Shutdown {
            break;
        }

        if shared_queue.lock().expect("lock shared queue").is_empty() {
            *worker_state.lock().expect("lock worker state") = WorkerState::Waiting;
            let _ = loop_block_cond
                .wait_timeout(
                    shared_queue.lock().expect("lock shared queue"),
                    wait_timeout,
                )
                .expect("wait_timeout failed");
        }

        let next_eg = shared_queue.lock().expect("lock shared queue").pop_front();
        let Some(next_eg) = next_eg else {
            trace!("[{}] nothing to do", thread_idx);
            continue;
        };

        *worker_state.lock().expect("lock worker state") = WorkerState::Busy;

        // A queued graph is adopted; the start token explores from the
        // worker's own fresh graph.
        if let Some(eg) = next_eg {
            trace!("[{}] working on a handed-over graph", thread_idx);
            trust.borrow_mut().reset_execution_graph(eg);
        } else {
            trace!("[{}] working on a fresh graph", thread_idx);
        }

        loop {
            if let Some(limit) = max_iterations {
                let count = {
                    let mut c = exec_counter.lock().expect("lock exec counter");
                    *c += 1;
                    *c
                };
                if count > limit {
                    break;
                }
            }

            trust.borrow_mut().begin_execution();
            Session::run(&trust, &exec_func);
            *pool_can_drain.lock().expect("lock can_drain") = true;
            if trust.borrow_mut().complete_execution() {
                break;
            }
        }

        trace!("[{}] done working", thread_idx);
    }

    debug!("[{}] worker shut down", thread_idx);
    let stats = trust.borrow().stats();
    pool_exec_stats.lock().expect("lock stats").add(&stats);
}

/// A fixed-size pool of driver instances sharing a bounded work queue.
pub(crate) struct ExecutionPool {
    worker_vec: Vec<PoolWorker>,
    work_deque: SharedWorkerDeque,
    loop_block_cond: CondBlocker,
    can_drain: Arc<Mutex<bool>>,
    exec_stats: Arc<Mutex<Stats>>,
    is_shutdown: bool,
}

impl ExecutionPool {
    /// Upper bound on the shared queue. When the queue is full, drivers
    /// keep their backward revisits local, which bounds memory without
    /// losing or blocking anything.
    pub(crate) const MAX_QUEUE_SIZE: usize = 100;

    pub(crate) fn new(conf: &Config) -> Self {
        let work_deque = Arc::new(Mutex::new(VecDeque::new()));
        let loop_block_cond = Arc::new(Condvar::new());
        let exec_stats = Arc::new(Mutex::new(Stats::default()));
        let can_drain = Arc::new(Mutex::new(false));
        let exec_counter = Arc::new(Mutex::new(0));

        let worker_count: usize = if let Some(n) = conf.parallel_workers {
            n
        } else if let Ok(n) = env::var("MEMFORGE_PARALLEL_WORKERS") {
            n.parse().unwrap()
        } else {
            num_cpus::get()
        };
        debug!("using an execution pool with {} workers", worker_count);

        let worker_vec: Vec<PoolWorker> = (0..worker_count)
            .map(|idx| {
                PoolWorker::new(
                    idx,
                    work_deque.clone(),
                    loop_block_cond.clone(),
                    can_drain.clone(),
                    exec_stats.clone(),
                    conf,
                    exec_counter.clone(),
                )
            })
            .collect();

        Self {
            worker_vec,
            work_deque,
            loop_block_cond,
            exec_stats,
            can_drain,
            is_shutdown: false,
        }
    }

    pub(crate) fn explore<F>(&mut self, exec_func: &Arc<F>) -> Stats
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.worker_vec.iter_mut().for_each(|w| w.start(exec_func));

        debug!("enqueuing the start token");
        self.enqueue(None);

        debug!("draining and shutting down");
        self.drain_and_shutdown();

        self.exec_stats.lock().expect("lock stats").clone()
    }

    fn enqueue(&mut self, eg: Option<ExecutionGraph>) {
        assert!(!self.is_shutdown, "enqueue after shutdown");
        let mut work_deque = self.work_deque.lock().expect("lock work deque");
        work_deque.push_back(eg);
        trace!("pushed work, queue size now {}", work_deque.len());
        self.loop_block_cond.notify_one();
    }

    /// Block until the first execution completed, the queue is empty, and
    /// no worker is busy; then shut everything down.
    fn drain_and_shutdown(&mut self) -> bool {
        loop {
            sleep(Duration::from_millis(250));

            if !*self.can_drain.lock().expect("lock can_drain") {
                debug!("can_drain not set yet");
                continue;
            }

            let depth = self.work_deque.lock().expect("lock work deque").len();
            if depth > 0 {
                trace!("draining, deque depth still {}", depth);
                continue;
            }

            let busy = self.worker_vec.iter().any(|w| {
                *w.worker_state.lock().expect("lock worker state") == WorkerState::Busy
            });
            if busy {
                debug!("workers still finishing");
                continue;
            }

            debug!("queue drained");
            break;
        }

        self.shutdown_now()
    }

    /// Tell every worker to exit and join them. Returns whether all
    /// workers joined cleanly.
    fn shutdown_now(&mut self) -> bool {
        self.is_shutdown = true;
        let mut threads_joined = 0;

        self.worker_vec.iter_mut().for_each(|w| {
            *w.worker_state.lock().expect("lock worker state") = WorkerState::Shutdown;
        });

        loop {
            self.worker_vec.iter_mut().for_each(|w| {
                if let Some(handle) = &w.thread_handle {
                    if handle.is_finished() {
                        let handle = w.thread_handle.take().unwrap();
                        handle.join().expect("couldn't join worker thread");
                        trace!("[{}] joined", w.thread_idx);
                        threads_joined += 1;
                    }
                }
            });

            if self.worker_vec.iter().all(|w| w.thread_handle.is_none()) {
                break;
            }
        }

        threads_joined == self.worker_vec.len()
    }
}
