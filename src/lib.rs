//! memforge: stateless model checking for concurrent Rust code under weak
//! memory models.
//!
//! A model is an ordinary closure that spawns checked threads
//! ([`thread::spawn`]) and communicates through the checked cells in
//! [`sync`]. [`verify`] runs the closure repeatedly, enumerating every
//! execution the chosen memory model admits (each distinct combination of
//! reads-from and coherence choices exactly once), and checks each one for
//! data races, memory-safety violations, assertion failures, and liveness
//! violations.
//!
//! ```no_run
//! use memforge::{sync::Atomic, thread, Config, MemOrdering::*};
//!
//! let stats = memforge::verify(Config::builder().build(), || {
//!     let x = Atomic::new(0);
//!     let h = thread::spawn(move || {
//!         x.store(1, Relaxed);
//!     });
//!     let _ = x.load(Relaxed);
//!     h.join();
//! });
//! assert_eq!(stats.execs, 2);
//! ```

mod bound;
mod cons;
mod errors;
mod event;
mod event_label;
mod exec_graph;
mod exec_pool;
mod indexed_map;
pub mod loc;
mod relation;
mod replay;
mod revisit;
mod runtime;
mod symmetry;
pub mod sync;
mod telemetry;
pub mod thread;
mod trust;
mod vector_clock;

pub use errors::{ErrorDetails, VerificationError, EINTERNAL, EUSER, EVERIFY};
pub use loc::{MemAddr, MemOrdering};

use std::cell::RefCell;
use std::ops::{Range, RangeInclusive};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::event_label::BlockType;
use crate::exec_pool::ExecutionPool;
use crate::replay::ReplayInformation;
use crate::runtime::{issue, Op, Reply, Session};
use crate::telemetry::Welford;
use crate::trust::Trust;

/// memforge exploration statistics.
#[derive(Default, Clone, Debug)]
pub struct Stats {
    /// Complete executions explored.
    pub execs: usize,
    /// Blocked executions explored (failed assumes, deadlocks, spin loops).
    pub blocked: usize,
    /// Branches abandoned by pruning (bound exceeded, model-inconsistent);
    /// aggregate only, never reported individually.
    pub moot: usize,
    /// Hard violations found.
    pub errors: Vec<ErrorDetails>,
    /// Soft violations found, deduplicated by kind and position.
    pub warnings: Vec<ErrorDetails>,
}

impl Stats {
    pub(crate) fn add(&mut self, rhs: &Stats) {
        self.execs += rhs.execs;
        self.blocked += rhs.blocked;
        self.moot += rhs.moot;
        self.errors.extend(rhs.errors.iter().cloned());
        self.warnings.extend(rhs.warnings.iter().cloned());
    }
}

/// The memory-consistency models memforge can check against.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub enum MemoryModel {
    /// Sequential consistency.
    Sc,
    /// Total store order (x86-like store buffering).
    Tso,
    /// Release/acquire only.
    Ra,
    /// The repaired C/C++11 model.
    #[default]
    Rc11,
    /// IMM. Accepted as a model name; the operation boundary exposes no
    /// syntactic dependencies, so dependency edges are approximated by
    /// program order and checking coincides with RC11.
    Imm,
}

/// Available scheduling policies.
///
/// These have no effect on the number of executions explored; they are
/// mostly useful for debugging.
#[derive(PartialEq, Eq, Default, Clone, Copy, Serialize, Deserialize, Debug)]
pub enum SchedulePolicy {
    /// left-to-right (default)
    #[default]
    LTR,
    /// arbitrary (seeded)
    Arbitrary,
}

/// How the schedule bound is measured.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum BoundType {
    /// Involuntary context switches.
    Context,
    /// Round-robin scheduling rounds.
    Round,
}

/// Available modes. Not set directly by the user; chosen by the entry
/// point ([`verify`] vs [`estimate_execs`]).
#[derive(PartialEq, Clone, Copy, Serialize, Deserialize, Debug)]
pub(crate) enum ExplorationMode {
    Verification,
    Estimation,
}

/// memforge configuration options.
///
/// Use the [`ConfigBuilder`] class to construct a `Config` struct.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub(crate) mode: ExplorationMode,
    pub(crate) model: MemoryModel,
    pub(crate) schedule_policy: SchedulePolicy,
    pub(crate) seed: u64,
    pub(crate) verbose: usize,
    pub(crate) symmetry: bool,
    pub(crate) bam: bool,
    pub(crate) check_liveness: bool,
    pub(crate) warnings_as_errors: bool,
    pub(crate) keep_going_after_error: bool,
    pub(crate) max_iterations: Option<u64>,
    pub(crate) progress_report: usize,
    pub(crate) thread_threshold: u32,
    pub(crate) bound: Option<(BoundType, u32)>,
    pub(crate) dot_file: Option<String>,
    pub(crate) error_trace_file: Option<String>,
    pub(crate) parallel: bool,
    pub(crate) parallel_workers: Option<usize>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Builds a [`Config`] struct.
pub struct ConfigBuilder(Config);

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder(Config {
            mode: ExplorationMode::Verification,
            model: MemoryModel::default(),
            schedule_policy: SchedulePolicy::LTR,
            seed: OsRng.next_u64(),
            verbose: 0,
            symmetry: false,
            bam: true,
            check_liveness: false,
            warnings_as_errors: false,
            keep_going_after_error: false,
            max_iterations: None,
            progress_report: 0,
            thread_threshold: 1000,
            bound: None,
            dot_file: None,
            error_trace_file: None,
            parallel: false,
            parallel_workers: None,
        })
    }

    /// Checks whether the current config is valid and returns it if it
    /// is. Exits with a configuration error otherwise.
    fn check_valid(self) -> Self {
        if self.0.symmetry && self.0.schedule_policy == SchedulePolicy::Arbitrary {
            eprintln!("symmetry reduction can only be used with LTR");
            std::process::exit(EUSER);
        }
        if self.0.parallel && self.0.dot_file.is_some() {
            eprintln!("DOT output is not supported with parallel exploration");
            std::process::exit(EUSER);
        }
        self
    }

    /// Determines the running mode: exhaustive verification or Monte
    /// Carlo estimation. Set by the top-level routines, not by users.
    #[allow(dead_code)]
    pub(crate) fn with_mode(mut self, m: ExplorationMode) -> Self {
        self.0.mode = m;
        self
    }

    /// Specifies the memory-consistency model to check against.
    pub fn with_model(mut self, m: MemoryModel) -> Self {
        self.0.model = m;
        self
    }

    /// Specifies the scheduling policy.
    pub fn with_policy(mut self, p: SchedulePolicy) -> Self {
        self.0.schedule_policy = p;
        self
    }

    /// Seeds the random number generator. Affects the schedule under
    /// [`SchedulePolicy::Arbitrary`] and the samples drawn in estimation
    /// mode; exploration results never depend on it.
    pub fn with_seed(mut self, s: u64) -> Self {
        self.0.seed = s;
        self
    }

    /// Controls how much output is printed to `stdout`:
    /// 0 = sparse, 1 = print every complete execution's graph,
    /// 2 = also print blocked executions, 3 = also trace revisits.
    pub fn with_verbose(mut self, v: usize) -> Self {
        self.0.verbose = v;
        self
    }

    /// Enables symmetry reduction for threads spawned with
    /// [`thread::spawn_symmetric`]. Unordered write-write races become
    /// hard errors while this is on (the reduction is unsound in their
    /// presence).
    pub fn with_symmetry(mut self, s: bool) -> Self {
        self.0.symmetry = s;
        self
    }

    /// Enables barrier-aware reduction (on by default): barrier arrivals
    /// take a single coherence placement and generate no revisits.
    pub fn with_bam(mut self, b: bool) -> Self {
        self.0.bam = b;
        self
    }

    /// Reports blocked executions in which every unfinished thread sits
    /// in a spin loop as liveness violations.
    pub fn with_check_liveness(mut self, b: bool) -> Self {
        self.0.check_liveness = b;
        self
    }

    /// Whether to treat warnings as actual errors.
    pub fn with_warnings_as_errors(mut self, b: bool) -> Self {
        self.0.warnings_as_errors = b;
        self
    }

    /// Allow the exploration to continue even after a violation has been
    /// discovered. Works with `memforge::assert` and the engine's own
    /// checks; a `std::assert!` in model code still panics.
    pub fn with_keep_going_after_error(mut self, b: bool) -> Self {
        self.0.keep_going_after_error = b;
        self
    }

    /// Specifies an upper bound on the number of executions.
    pub fn with_max_iterations(mut self, n: u64) -> Self {
        self.0.max_iterations = Some(n);
        self
    }

    /// Prints a progress report message after every `n` executions.
    ///
    /// Without this option an adaptive cadence is used, reporting after
    /// 1, 2, 3, ..., 10, 20, 30, ..., 100, 200, 300, etc.
    pub fn with_progress_report(mut self, n: usize) -> Self {
        self.0.progress_report = n;
        self
    }

    /// Specifies the thread size above which memforge warns about
    /// (seemingly) unbounded models.
    pub fn with_thread_threshold(mut self, s: u32) -> Self {
        self.0.thread_threshold = s;
        self
    }

    /// Bounds the schedules explored: executions exceeding `n` (context
    /// switches or rounds, per `ty`) are discarded without being counted
    /// or reported.
    pub fn with_bound(mut self, ty: BoundType, n: u32) -> Self {
        self.0.bound = Some((ty, n));
        self
    }

    /// Writes the causal prefix of an error (or the last printed graph)
    /// to this file in DOT format.
    pub fn with_dot_out(mut self, filename: &str) -> Self {
        self.0.dot_file = Some(filename.to_string());
        self
    }

    /// If a counterexample is detected, a trace is written to this file.
    /// The trace allows you to replay the execution by calling
    /// `replay(model, "/path/to/error/trace")` with the same
    /// function/closure that generated the counterexample.
    pub fn with_error_trace(mut self, filename: &str) -> Self {
        self.0.error_trace_file = Some(filename.to_string());
        self
    }

    /// Enables parallel exploration. By default the number of system
    /// cores is used as the worker count unless `with_parallel_workers`
    /// sets a value or `MEMFORGE_PARALLEL_WORKERS` is set.
    pub fn with_parallel(mut self, use_parallel: bool) -> Self {
        self.0.parallel = use_parallel;
        self
    }

    /// Sets the max number of parallel workers. Requires
    /// `with_parallel(true)`.
    pub fn with_parallel_workers(mut self, max_workers: usize) -> Self {
        self.0.parallel_workers = Some(max_workers);
        self
    }

    /// Consumes the builder and produces the [`Config`].
    pub fn build(self) -> Config {
        self.check_valid().0
    }
}

/// Model checker API.
///
/// Verifies `f` under the options specified in `conf`. `f` acts as the
/// main thread and may spawn other threads.
pub fn verify<F>(conf: Config, f: F) -> Stats
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    if conf.parallel {
        ExecutionPool::new(&conf).explore(&f)
    } else {
        let trust = Rc::new(RefCell::new(Trust::new(conf, false)));
        explore(&trust, &f);
        let stats = trust.borrow().stats();
        stats
    }
}

/// Model checker API.
///
/// Replays `f` against the counterexample trace in `error_file`,
/// reproducing the recorded violation step by step.
pub fn replay<F>(f: F, error_file: &str)
where
    F: Fn() + Send + Sync + 'static,
{
    let replay_str = std::fs::read_to_string(error_file).unwrap();
    let replay_info: ReplayInformation = serde_json::from_str(&replay_str).unwrap();

    let trust = Rc::new(RefCell::new(Trust::new(replay_info.config(), true)));
    trust.borrow_mut().load_replay_information(replay_info);

    info!("sorted error graph:");
    info!("{}", trust.borrow().sorted_error_graph_printout());

    let f = Arc::new(f);
    explore(&trust, &f);
}

const ESTIMATION_MIN_SAMPLES: u64 = 20;
const ESTIMATION_DEVIATION: f64 = 0.05;

/// Estimates the number of executions the model needs in order to be
/// verified. The return value can be `inf` when the estimate does not fit
/// an `f64`.
pub fn estimate_execs<F>(f: F) -> f64
where
    F: Fn() + Send + Sync + 'static,
{
    estimate_execs_with_samples(f, 1000)
}

/// Same as [`estimate_execs`] but with a user-defined sample budget.
/// Sampling stops early once the relative deviation of the estimate
/// falls below a threshold.
pub fn estimate_execs_with_samples<F>(f: F, samples: u64) -> f64
where
    F: Fn() + Send + Sync + 'static,
{
    assert!(samples > 0);
    estimate_execs_with_config(Config::builder().build(), f, samples)
}

/// [`estimate_execs`] with explicit configuration; the configured seed
/// makes the estimate reproducible.
pub fn estimate_execs_with_config<F>(mut config: Config, f: F, samples: u64) -> f64
where
    F: Fn() + Send + Sync + 'static,
{
    assert!(samples > 0);
    config.mode = ExplorationMode::Estimation;
    config.parallel = false;

    let f = Arc::new(f);
    let base_seed = config.seed;
    let mut estimate = Welford::new();
    let mut nb_executions = 0;

    for i in 0..samples {
        let mut sample_config = config.clone();
        sample_config.seed = base_seed.wrapping_add(i);
        let trust = Rc::new(RefCell::new(Trust::new(sample_config, false)));
        explore(&trust, &f);
        estimate.push(trust.borrow().execs_est());
        let stats = trust.borrow().stats();
        nb_executions += stats.execs + stats.blocked;

        if estimate.count() >= ESTIMATION_MIN_SAMPLES
            && estimate.rel_std_err() < ESTIMATION_DEVIATION
        {
            break;
        }
    }

    info!(
        "estimation ran {} executions over {} samples",
        nb_executions,
        estimate.count()
    );
    estimate.mean()
}

/// One full exploration: run the model, backtrack through the revisit
/// queue, repeat until the search space is exhausted.
fn explore<F>(trust: &Rc<RefCell<Trust>>, f: &Arc<F>)
where
    F: Fn() + Send + Sync + 'static,
{
    trust.borrow_mut().started_at = Instant::now();
    loop {
        trust.borrow_mut().begin_execution();
        Session::run(trust, f);
        if trust.borrow_mut().complete_execution() {
            break;
        }
    }
}

/// Blocks (stops) the exploration if `cond` is `false`.
///
/// The purpose of `assume!(x)` is to tell memforge that the current
/// execution should not be explored any more if `x` is false. The
/// execution is counted as blocked, and the search continues with the
/// remaining ones.
///
/// This is useful when the creator of the model knows something the
/// engine does not. For example, an order-insensitive accumulation over
/// values read from several threads can assume the values arrive in
/// increasing order, collapsing the symmetric interleavings into one.
#[macro_export]
macro_rules! assume {
    ($bool:expr) => {
        $crate::assume_impl($bool, Some((stringify!($bool), file!(), line!())));
    };
}

// Used by the macro `assume!`. Not intended to be invoked directly.
#[doc(hidden)]
pub fn assume_impl(cond: bool, macro_info: Option<(&str, &str, u32)>) {
    if cond {
        return;
    }
    if let Some((descr, file, line)) = macro_info {
        info!(
            "this execution is ending because `assume!({})` is false at {}:{}",
            descr, file, line
        );
    }
    issue(Op::Block {
        btype: BlockType::Assume,
    });
}

/// memforge's wrapper for an assertion. It behaves like `assert!` but
/// allows the underlying model checker to continue exploration after a
/// violation when `keep_going_after_error` is set.
///
/// You can have both `std::assert!` and memforge's `assert` in a model;
/// the system one panics on failure and always halts the run.
pub fn assert(cond: bool) {
    if cond {
        return;
    }
    issue(Op::Block {
        btype: BlockType::Assert,
    });
}

/// Evaluates `cond` once; if it does not hold, blocks the thread as a
/// spin loop that made no progress.
///
/// This is the spin-loop idiom of checked code: instead of re-running the
/// loop body, the execution where the condition never becomes true is
/// explored exactly once (as a blocked execution), and the executions
/// where another thread's write makes it true are explored through that
/// write's revisits. With `with_check_liveness`, executions in which every
/// unfinished thread spins are reported as liveness violations.
pub fn spin_until<F: FnMut() -> bool>(mut cond: F) {
    if cond() {
        return;
    }
    issue(Op::Block {
        btype: BlockType::Spinloop,
    });
}

/// Models a nondeterministic boolean choice; both outcomes are explored.
pub fn nondet() -> bool {
    match issue(Op::Toss) {
        Reply::Bool(b) => b,
        r => panic!("unexpected reply {:?} to nondet", r),
    }
}

/// Nondeterministic choice over a range; every value is explored.
pub trait Nondet<T> {
    fn nondet(&self) -> T;
}

impl Nondet<u64> for RangeInclusive<u64> {
    fn nondet(&self) -> u64 {
        if self.start() > self.end() {
            panic!("range {:?} is not well-formed", self);
        }
        match issue(Op::Choice {
            range: self.clone(),
        }) {
            Reply::Val(v) => v,
            r => panic!("unexpected reply {:?} to nondet", r),
        }
    }
}

impl Nondet<u64> for Range<u64> {
    fn nondet(&self) -> u64 {
        if self.start >= self.end {
            panic!("range {:?} is not well-formed", self);
        }
        (self.start..=self.end - 1).nondet()
    }
}

/// An optional block: `f` is skipped by default, and the execution where
/// it runs is explored as a separate branch. Returns `f`'s result when
/// the block was entered.
pub fn optional<T>(f: impl FnOnce() -> T) -> Option<T> {
    match issue(Op::Optional) {
        Reply::Bool(true) => Some(f()),
        Reply::Bool(false) => None,
        r => panic!("unexpected reply {:?} to optional", r),
    }
}

/// Wraps `f` between method begin/end markers. The markers are structural:
/// they delimit a logical operation for downstream consumers of the
/// execution graph (e.g. linearizability checking) and have no effect on
/// exploration.
pub fn method<T>(name: &str, f: impl FnOnce() -> T) -> T {
    issue(Op::MethodBegin {
        name: name.to_owned(),
    });
    let ret = f();
    issue(Op::MethodEnd {
        name: name.to_owned(),
    });
    ret
}
