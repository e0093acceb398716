//! Memory locations and access orderings.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt::{self, Display};

/// An abstract, word-granular memory address.
///
/// Every address is introduced by a `Malloc` event; an allocation of `n`
/// words covers the addresses `base .. base + n`. Address 0 is never handed
/// out.
// Serialized as the string "a<n>" so that address-keyed maps survive the
// JSON round trip of counterexample traces (JSON objects need string keys).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct MemAddr(pub(crate) u64);

impl MemAddr {
    pub(crate) fn plus(self, words: u64) -> MemAddr {
        MemAddr(self.0 + words)
    }
}

impl Serialize for MemAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("a{}", self.0))
    }
}

impl TryFrom<String> for MemAddr {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.strip_prefix('a')
            .and_then(|num| num.parse::<u64>().ok())
            .map(MemAddr)
            .ok_or_else(|| format!("`{}` is not a memory address", s))
    }
}

impl Display for MemAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Hands out fresh addresses within one exploration branch.
///
/// Allocation is deterministic given the order of `Malloc` events, so a
/// branch adopted from another worker can rebuild the allocator from its
/// graph (see `ExecutionGraph::max_addr`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AddrAllocator {
    next: u64,
}

impl Default for AddrAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddrAllocator {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    pub(crate) fn fresh(&mut self, words: u64) -> MemAddr {
        assert!(words > 0, "zero-sized allocation");
        let base = self.next;
        self.next += words;
        MemAddr(base)
    }

    /// Make sure no future allocation collides with addresses at or below
    /// `floor`.
    pub(crate) fn seed_above(&mut self, floor: u64) {
        if self.next <= floor {
            self.next = floor + 1;
        }
    }
}

/// Memory access orderings, mirroring the C11 ones plus `NotAtomic`.
///
/// `NotAtomic` accesses participate in race detection; the rest participate
/// in the memory model's synchronization rules.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemOrdering {
    NotAtomic,
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

impl MemOrdering {
    pub(crate) fn is_atomic(self) -> bool {
        !matches!(self, MemOrdering::NotAtomic)
    }

    pub(crate) fn at_least_acquire(self) -> bool {
        matches!(
            self,
            MemOrdering::Acquire | MemOrdering::AcqRel | MemOrdering::SeqCst
        )
    }

    pub(crate) fn at_least_release(self) -> bool {
        matches!(
            self,
            MemOrdering::Release | MemOrdering::AcqRel | MemOrdering::SeqCst
        )
    }

    pub(crate) fn is_sc(self) -> bool {
        matches!(self, MemOrdering::SeqCst)
    }
}

impl Display for MemOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemOrdering::NotAtomic => "na",
            MemOrdering::Relaxed => "rlx",
            MemOrdering::Acquire => "acq",
            MemOrdering::Release => "rel",
            MemOrdering::AcqRel => "ar",
            MemOrdering::SeqCst => "sc",
        };
        f.write_str(s)
    }
}
