//! Revisiting utilities

use serde::{Deserialize, Serialize};

use crate::event::Event;
use std::fmt::Debug;

/// The alternative continuations the engine can queue for later exploration.
///
/// Forward revisits re-decide a choice made for the most recently added
/// event and only need the graph cut back to that event's stamp. A backward
/// revisit changes the rf of an *earlier* read to a *later-added* write and
/// needs the graph restricted to the revisit's causal view first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum RevisitEnum {
    /// Alternative rf for a read: `pos` re-reads from `rev`.
    ReadForward(Revisit),
    /// Alternative coherence placement for a write: `pos` goes right after
    /// `rev` in its location's coherence order.
    WriteForward(Revisit),
    /// An existing read `pos` re-reads the later-added write `rev`.
    Backward(Revisit),
    /// Expand the optional block at `pos`.
    OptionalForward(Event),
    /// Re-run the nondet choice at `pos` with its next value.
    RerunForward(Event),
}

impl RevisitEnum {
    pub(crate) fn new_read_forward(pos: Event, rf: Event) -> Self {
        RevisitEnum::ReadForward(Revisit { pos, rev: rf })
    }

    pub(crate) fn new_write_forward(pos: Event, co_pred: Event) -> Self {
        RevisitEnum::WriteForward(Revisit { pos, rev: co_pred })
    }

    pub(crate) fn new_backward(read: Event, write: Event) -> Self {
        RevisitEnum::Backward(Revisit {
            pos: read,
            rev: write,
        })
    }
}

/// A (position, placement) pair: the event whose rf or co choice changes,
/// and the event realizing the new choice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct Revisit {
    pub(crate) pos: Event,
    pub(crate) rev: Event,
}

impl Revisit {
    pub(crate) fn new(pos: Event, rev: Event) -> Self {
        Self { pos, rev }
    }
}
