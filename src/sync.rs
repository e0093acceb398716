//! Checked shared-memory primitives.
//!
//! Cells created through this module live in the engine's abstract memory:
//! every access becomes an event in the execution graph, explored under the
//! configured memory model. Cell handles are plain copies of the underlying
//! address, so they can be moved or copied freely into spawned closures.
//!
//! The low-level `malloc`/`free`/`load`/`store` functions expose raw
//! word-granular memory for models that manage allocations themselves;
//! the cells are the safe sugar on top.

use crate::event_label::FaiOp;
use crate::loc::{MemAddr, MemOrdering};
use crate::runtime::{issue, Op, Reply};

fn expect_unit(r: Reply) {
    match r {
        Reply::Unit => {}
        r => panic!("unexpected reply {:?}", r),
    }
}

fn expect_val(r: Reply) -> u64 {
    match r {
        Reply::Val(v) => v,
        r => panic!("unexpected reply {:?}", r),
    }
}

/// Allocates `words` fresh words of checked heap memory.
///
/// Heap allocations participate in the unfreed-memory check; use the cell
/// types for static-like variables.
pub fn malloc(words: u64) -> MemAddr {
    match issue(Op::Malloc { words, heap: true }) {
        Reply::Addr(a) => a,
        r => panic!("unexpected reply {:?}", r),
    }
}

/// Frees an allocation made with [`malloc`]. `addr` must be the base
/// address the allocation returned.
pub fn free(addr: MemAddr) {
    expect_unit(issue(Op::Free { addr }));
}

/// Reads a word of checked memory.
pub fn load(addr: MemAddr, ordering: MemOrdering) -> u64 {
    expect_val(issue(Op::Load { addr, ordering }))
}

/// Writes a word of checked memory.
pub fn store(addr: MemAddr, ordering: MemOrdering, val: u64) {
    expect_unit(issue(Op::Store { addr, ordering, val }));
}

/// Issues a memory fence.
pub fn fence(ordering: MemOrdering) {
    expect_unit(issue(Op::Fence { ordering }));
}

fn alloc_cell(init: u64, ordering: MemOrdering) -> MemAddr {
    let addr = match issue(Op::Malloc { words: 1, heap: false }) {
        Reply::Addr(a) => a,
        r => panic!("unexpected reply {:?}", r),
    };
    store(addr, ordering, init);
    addr
}

/// A word-sized atomic variable.
#[derive(Clone, Copy, Debug)]
pub struct Atomic {
    addr: MemAddr,
}

impl Atomic {
    /// Creates (and initializes) a new atomic cell.
    pub fn new(init: u64) -> Self {
        Self {
            addr: alloc_cell(init, MemOrdering::Relaxed),
        }
    }

    pub fn load(&self, ordering: MemOrdering) -> u64 {
        assert!(ordering.is_atomic(), "use Shared for non-atomic accesses");
        load(self.addr, ordering)
    }

    pub fn store(&self, val: u64, ordering: MemOrdering) {
        assert!(ordering.is_atomic(), "use Shared for non-atomic accesses");
        store(self.addr, ordering, val)
    }

    /// Atomic compare-and-swap. Returns `Ok(previous)` when the exchange
    /// took place and `Err(actual)` otherwise.
    pub fn compare_exchange(
        &self,
        expected: u64,
        new: u64,
        ordering: MemOrdering,
    ) -> Result<u64, u64> {
        let old = expect_val(issue(Op::Cas {
            addr: self.addr,
            ordering,
            expected,
            new,
        }));
        if old == expected {
            Ok(old)
        } else {
            Err(old)
        }
    }

    /// Atomically adds, returning the previous value.
    pub fn fetch_add(&self, operand: u64, ordering: MemOrdering) -> u64 {
        self.fai(FaiOp::Add, operand, ordering)
    }

    /// Atomically subtracts, returning the previous value.
    pub fn fetch_sub(&self, operand: u64, ordering: MemOrdering) -> u64 {
        self.fai(FaiOp::Sub, operand, ordering)
    }

    /// Atomically replaces the value, returning the previous one.
    pub fn swap(&self, val: u64, ordering: MemOrdering) -> u64 {
        self.fai(FaiOp::Xchg, val, ordering)
    }

    fn fai(&self, op: FaiOp, operand: u64, ordering: MemOrdering) -> u64 {
        expect_val(issue(Op::Fai {
            addr: self.addr,
            ordering,
            op,
            operand,
        }))
    }
}

/// A word-sized plain (non-atomic) variable. Unsynchronized concurrent
/// accesses to it are data races and are reported as such.
#[derive(Clone, Copy, Debug)]
pub struct Shared {
    addr: MemAddr,
}

impl Shared {
    pub fn new(init: u64) -> Self {
        Self {
            addr: alloc_cell(init, MemOrdering::NotAtomic),
        }
    }

    pub fn load(&self) -> u64 {
        load(self.addr, MemOrdering::NotAtomic)
    }

    pub fn store(&self, val: u64) {
        store(self.addr, MemOrdering::NotAtomic, val)
    }
}

/// A checked mutex over a word of state (0 = free, 1 = held).
///
/// Acquisition is an exclusive read that blocks while the lock is held;
/// the engine wakes the waiter in place when an unlock shows up, and
/// explores the alternative acquisition orders through revisits.
#[derive(Clone, Copy, Debug)]
pub struct Mutex {
    addr: MemAddr,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            addr: alloc_cell(0, MemOrdering::Relaxed),
        }
    }

    /// Acquires the mutex, blocking the checked thread until it is free.
    pub fn lock(&self) -> MutexGuard {
        expect_unit(issue(Op::Lock { addr: self.addr }));
        MutexGuard { mutex: *self }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the mutex on drop.
pub struct MutexGuard {
    mutex: Mutex,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        store(self.mutex.addr, MemOrdering::Release, 0);
    }
}

/// A single-use barrier for a fixed number of threads.
///
/// Arrivals decrement the counter; each arrival blocks until the counter
/// reaches zero. Calling [`Barrier::wait`] more than `n` times in total
/// blocks the extra callers.
#[derive(Clone, Copy, Debug)]
pub struct Barrier {
    addr: MemAddr,
}

impl Barrier {
    pub fn new(n: u64) -> Self {
        assert!(n > 0, "a barrier needs at least one participant");
        Self {
            addr: alloc_cell(n, MemOrdering::Relaxed),
        }
    }

    /// Arrives at the barrier and waits for everyone else.
    pub fn wait(&self) {
        expect_unit(issue(Op::BarrierWait { addr: self.addr }));
    }
}
