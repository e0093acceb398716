//! memforge's replacement for [`std::thread`].
//!
//! Threads spawned through this module are *checked* threads: every visible
//! operation they perform is routed through the exploration engine, and the
//! closure is re-executed from scratch for every explored execution.

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize, Serializer};

use crate::runtime::{self, Op, Reply};

/// A unique identifier for a checked thread.
// Thread ids are opaque: a thread may compare its id with others for
// equality, but programs must not branch on the numeric value. Symmetry
// reduction relies on thread ids being swappable (see `symmetry.rs`), which
// breaks down if a model orders its threads by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ThreadId {
    opaque_id: u32,
}

impl Serialize for ThreadId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("t{}", self.opaque_id))
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("t{}", self.opaque_id))
    }
}

pub struct ThreadIdFromStrError {
    msg: String,
}

impl Display for ThreadIdFromStrError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

impl TryFrom<String> for ThreadId {
    type Error = ThreadIdFromStrError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if let Some(num) = s.strip_prefix('t') {
            match num.parse::<u32>() {
                Ok(tid) => Ok(ThreadId { opaque_id: tid }),
                Err(_) => Err(ThreadIdFromStrError {
                    msg: format!("Can't parse {} as a number", &s),
                }),
            }
        } else {
            Err(ThreadIdFromStrError {
                msg: format!("`{}` should begin with `t`", &s),
            })
        }
    }
}

/// Construct a ThreadId from a raw integer.
///
/// Intended for trace tooling only: models should treat ids as opaque and
/// never guess the id the engine will assign next. (During backtracking, a
/// thread spawned from the same source location can receive a fresh id if
/// the scheduling prefix leading to the spawn differs.)
pub fn construct_thread_id(numeric_id: u32) -> ThreadId {
    ThreadId {
        opaque_id: numeric_id,
    }
}

impl From<ThreadId> for u32 {
    fn from(tid: ThreadId) -> Self {
        tid.opaque_id
    }
}

impl From<ThreadId> for usize {
    fn from(tid: ThreadId) -> Self {
        tid.opaque_id as usize
    }
}

impl ThreadId {
    pub(crate) fn to_number(self) -> u32 {
        self.opaque_id
    }
}

/// Returns the main thread's id.
pub fn main_thread_id() -> ThreadId {
    ThreadId { opaque_id: 0 }
}

// Ord is needed so thread ids can key the ordered sets the engine iterates
// deterministically. See the note on the struct about models misusing it.
impl PartialOrd for ThreadId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ThreadId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.opaque_id.cmp(&other.opaque_id)
    }
}

/// Handle to a checked thread, returned by [`spawn`].
pub struct JoinHandle {
    tid: ThreadId,
}

impl JoinHandle {
    /// The spawned thread's id.
    pub fn id(&self) -> ThreadId {
        self.tid
    }

    /// Waits for the thread to finish.
    ///
    /// Blocks the calling thread (in the checked sense: the scheduler will
    /// not run it again) until the target thread's `End` event is in the
    /// graph.
    pub fn join(self) {
        match runtime::issue(Op::Join { tid: self.tid }) {
            Reply::Unit => {}
            r => panic!("unexpected reply {:?} to join", r),
        }
    }
}

/// Spawns a new checked thread.
pub fn spawn<F>(f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(Box::new(f), None, None)
}

/// Spawns a new checked thread with a name used in graph printouts.
pub fn spawn_named<F>(f: F, name: &str) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(Box::new(f), Some(name.to_owned()), None)
}

/// Spawns a new checked thread declared symmetric to `tid`.
///
/// The spawned thread must run the same code as `tid` (up to thread-id
/// renaming); the engine uses the declaration to prune permutation-symmetric
/// executions when symmetry reduction is enabled.
pub fn spawn_symmetric<F>(f: F, tid: ThreadId) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(Box::new(f), None, Some(tid))
}

fn spawn_inner(
    f: Box<dyn FnOnce() + Send + 'static>,
    name: Option<String>,
    sym: Option<ThreadId>,
) -> JoinHandle {
    match runtime::issue(Op::Spawn {
        main: Some(f),
        name,
        sym,
    }) {
        Reply::Tid(tid) => JoinHandle { tid },
        r => panic!("unexpected reply {:?} to spawn", r),
    }
}

/// Returns the id of the calling checked thread.
pub fn current_id() -> ThreadId {
    runtime::current_tid()
}
