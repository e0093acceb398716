//! Counterexample persistence and deterministic replay.
//!
//! When verification finds a violation, the erroring graph is linearized
//! (topologically sorted along po ∪ rf ∪ create/join), bundled with the
//! driver state and configuration, and written as JSON. `memforge::replay`
//! loads the bundle and re-executes the model with the linearization
//! driving the scheduler, reproducing the violation step by step.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::errors::ErrorDetails;
use crate::event::Event;
use crate::event_label::LabelEnum;
use crate::thread::ThreadId;
use crate::trust::TrustState;
use crate::Config;

/// A linearization of an execution graph: the labels in a total order
/// compatible with the causal order. The set of positions guards against
/// duplicate insertion while the graph walk visits shared prefixes.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct LinearizedGraph {
    label_order: VecDeque<LabelEnum>,
    labels: HashSet<Event>,
}

impl LinearizedGraph {
    pub(crate) fn new() -> Self {
        LinearizedGraph {
            label_order: VecDeque::new(),
            labels: HashSet::new(),
        }
    }

    pub(crate) fn insert_label(&mut self, label: LabelEnum) {
        if !self.labels.contains(&label.pos()) {
            self.labels.insert(label.pos());
            self.label_order.push_back(label);
        }
    }

    /// The next label to schedule. `current_event` is returned unchanged
    /// while it is still being replayed; Begin/End markers are skipped (they
    /// are replayed implicitly when a thread starts or finishes).
    fn next_label(&mut self, current_event: Option<LabelEnum>) -> Option<LabelEnum> {
        if current_event.is_some() {
            return current_event;
        }
        match self.label_order.pop_front() {
            None => {
                info!("end of counterexample trace");
                None
            }
            Some(label) => match label {
                LabelEnum::Begin(_) | LabelEnum::End(_) => self.next_label(None),
                _ => {
                    info!("replaying {}", label);
                    Some(label)
                }
            },
        }
    }
}

impl std::fmt::Display for LinearizedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for label in self.label_order.iter() {
            writeln!(f, "{}", label)?;
        }
        Ok(())
    }
}

/// Everything needed to reproduce an erroring execution.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct ReplayInformation {
    sorted_error_graph: Option<LinearizedGraph>,
    /// The driver state at the time of the error.
    error_state: Option<TrustState>,
    /// Only the first error of a run is recorded.
    error_found: bool,
    /// The label currently being replayed; a thread is scheduled until the
    /// current label has been consumed.
    current_event: Option<LabelEnum>,
    replay_mode: bool,
    config: Config,
    /// The violation the trace reproduces, re-reported at the end of the
    /// replayed execution.
    error: Option<ErrorDetails>,
}

impl ReplayInformation {
    pub(crate) fn new(config: Config, replay_mode: bool) -> Self {
        ReplayInformation {
            sorted_error_graph: None,
            error_state: None,
            error_found: false,
            current_event: None,
            replay_mode,
            config,
            error: None,
        }
    }

    pub(crate) fn create(
        sorted_error_graph: LinearizedGraph,
        error_state: TrustState,
        config: Config,
        error: ErrorDetails,
    ) -> Self {
        ReplayInformation {
            sorted_error_graph: Some(sorted_error_graph),
            error_state: Some(error_state),
            error_found: true,
            current_event: None,
            replay_mode: true,
            config,
            error: Some(error),
        }
    }

    pub(crate) fn error(&self) -> Option<&ErrorDetails> {
        self.error.as_ref()
    }

    pub(crate) fn extract_error_state(&mut self) -> TrustState {
        self.error_state.take().expect("no error state recorded")
    }

    pub(crate) fn error_found(&self) -> bool {
        self.error_found
    }

    pub(crate) fn sorted_error_graph(&self) -> &LinearizedGraph {
        self.sorted_error_graph.as_ref().unwrap()
    }

    pub(crate) fn replay_mode(&self) -> bool {
        self.replay_mode
    }

    /// Mark the event at `pos` replayed. Usually `pos` is the current
    /// event; an RMW replays its whole label bundle (read, write, possibly
    /// a barrier Block) in one step, so consumption may run ahead of the
    /// scheduler by pulling the next label eagerly.
    pub(crate) fn consume(&mut self, pos: Event) -> Result<(), String> {
        if self.current_event.is_none() {
            self.next_thread();
        }
        match self.current_event.take() {
            // Trace exhausted; events past the linearization need no
            // bookkeeping.
            None => Ok(()),
            Some(cur) if cur.pos() == pos => Ok(()),
            Some(cur) => {
                let err = format!(
                    "executing {} instead of the counterexample's {}",
                    pos,
                    cur.pos()
                );
                self.current_event = Some(cur);
                Err(err)
            }
        }
    }

    /// The thread the scheduler must run next, per the linearization.
    pub(crate) fn next_thread(&mut self) -> Option<ThreadId> {
        let next_label = self
            .sorted_error_graph
            .as_mut()
            .expect("not in replay mode")
            .next_label(self.current_event.clone());

        match next_label {
            None => {
                self.current_event = None;
                None
            }
            Some(label) => {
                let tid = label.thread();
                self.current_event = Some(label);
                Some(tid)
            }
        }
    }

    pub(crate) fn config(&self) -> Config {
        self.config.clone()
    }
}
