//! Verification outcome taxonomy and process exit codes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::Event;

/// Exit code for user-facing configuration or input errors.
pub const EUSER: i32 = 17;
/// Exit code for internal invariant violations (bugs in the engine).
pub const EINTERNAL: i32 = 7;
/// Exit code used when verification found a violation.
pub const EVERIFY: i32 = 42;

/// The property violations the checker can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationError {
    /// Conflicting accesses, at least one non-atomic, unordered by
    /// happens-before.
    RaceNotAtomic,
    /// Two atomic writes to the same location unordered by happens-before.
    /// Soft by default; fatal under symmetry reduction, which is unsound in
    /// the presence of unordered racing writes.
    WWRace,
    /// Access to an address no allocation covers.
    AccessNonMalloc,
    /// Access to memory whose allocation has been freed.
    AccessFreed,
    /// Second free of the same allocation.
    DoubleFree,
    /// A read with no write to read from.
    UninitializedMem,
    /// A failed `memforge::assert` in the model.
    AssertionFailure,
    /// A panic in model code.
    Panic,
    /// A blocked execution in which every unfinished thread sits in a spin
    /// loop no other thread can exit it from.
    Liveness,
    /// An allocation never freed in a complete execution.
    UnfreedMemory,
}

impl VerificationError {
    /// Hard errors halt the whole verification run (unless the user opted
    /// into continuing); soft ones are recorded as warnings.
    pub fn is_hard(&self) -> bool {
        !matches!(
            self,
            VerificationError::WWRace
                | VerificationError::Liveness
                | VerificationError::UnfreedMemory
        )
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationError::RaceNotAtomic => "non-atomic race",
            VerificationError::WWRace => "unordered write-write race",
            VerificationError::AccessNonMalloc => "access to non-allocated memory",
            VerificationError::AccessFreed => "access to freed memory",
            VerificationError::DoubleFree => "double free",
            VerificationError::UninitializedMem => "read from uninitialized memory",
            VerificationError::AssertionFailure => "assertion failure",
            VerificationError::Panic => "panic in model code",
            VerificationError::Liveness => "liveness violation",
            VerificationError::UnfreedMemory => "allocation never freed",
        };
        f.write_str(s)
    }
}

/// A reported violation: what happened, where, and (for races) the other
/// event involved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub pos: Event,
    pub kind: VerificationError,
    pub msg: String,
    /// The conflicting event, for race-shaped errors.
    pub racy: Option<Event>,
}

impl ErrorDetails {
    pub(crate) fn new(pos: Event, kind: VerificationError, msg: String) -> Self {
        Self {
            pos,
            kind,
            msg,
            racy: None,
        }
    }

    pub(crate) fn with_racy(mut self, racy: Event) -> Self {
        self.racy = Some(racy);
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.pos, self.msg)?;
        if let Some(racy) = self.racy {
            write!(f, " (conflicts with {})", racy)?;
        }
        Ok(())
    }
}
