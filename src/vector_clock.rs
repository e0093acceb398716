use crate::thread::{construct_thread_id, ThreadId};
use crate::{event::Event, indexed_map::IndexedMap};
use std::cmp;

use serde::{Deserialize, Serialize};

/// A sparse per-thread clock describing a set of events closed under
/// program order: thread `t` is "in" the clock up to (and including) the
/// stored index.
///
/// A thread that is absent from the clock contributes no events; a thread
/// stored with index 0 contributes only its `Begin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VectorClock {
    clock: IndexedMap<u32>,
}

impl VectorClock {
    pub(crate) fn new() -> Self {
        Self {
            clock: IndexedMap::new(),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ThreadId, u32)> + '_ {
        self.clock
            .entries()
            .map(|(tid, &idx)| (construct_thread_id(tid as u32), idx))
    }

    pub(crate) fn get(&self, t: ThreadId) -> Option<u32> {
        self.clock.get(usize::from(t)).copied()
    }

    /// Populate the thread with index 0.
    pub(crate) fn set_tid(&mut self, tid: ThreadId) {
        self.clock.insert(usize::from(tid), 0);
    }

    /// Whether the view contains the event.
    pub(crate) fn contains(&self, e: Event) -> bool {
        self.get(e.thread).is_some_and(|i| e.index <= i)
    }

    /// Unchecked update (assumes the thread is already present).
    pub(crate) fn update_idx(&mut self, e: Event) {
        self.clock[usize::from(e.thread)] = e.index;
    }

    /// Update, populating the thread if it is missing.
    pub(crate) fn update_or_set(&mut self, e: Event) {
        self.advance(usize::from(e.thread), e.index);
    }

    /// Pointwise maximum with another clock.
    pub(crate) fn update(&mut self, other: &Self) {
        for (tid, &other_val) in other.clock.entries() {
            self.advance(tid, other_val);
        }
    }

    fn advance(&mut self, tid: usize, ind: u32) {
        let new_val: u32 = cmp::max(*self.clock.get(tid).unwrap_or(&0), ind);
        self.clock.insert(tid, new_val);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::thread::construct_thread_id;

    fn tid(t: u32) -> ThreadId {
        construct_thread_id(t)
    }

    /// -1 marks a thread that is absent from the clock.
    fn clock(value: &[i32]) -> VectorClock {
        let mut c = VectorClock::new();
        for (t, &idx) in value.iter().enumerate() {
            if idx >= 0 {
                c.update_or_set(Event::new(tid(t as u32), idx as u32));
            }
        }
        c
    }

    #[test]
    fn vector_clock() {
        let mut v1 = clock(&[1, 0, 2, 0]);
        v1.update_or_set(Event::new(tid(1), 3));
        v1.update_or_set(Event::new(tid(5), 5));
        assert_eq!(v1, clock(&[1, 3, 2, 0, -1, 5]));

        let mut v1 = clock(&[1]);
        v1.update_or_set(Event::new(tid(3), 1));
        assert!(v1.contains(Event::new(tid(3), 1)));
        assert!(!v1.contains(Event::new(tid(2), 1)));

        let mut v1 = clock(&[1, -1, 2]);
        let v2 = clock(&[2, -1, 1, 5]);
        v1.update(&v2);
        assert_eq!(v1, clock(&[2, -1, 2, 5]));
    }

    #[test]
    fn vector_clock_is_sparse() {
        let mut c = clock(&[100]);
        c.update_or_set(Event::new(tid(2), 1));
        assert_eq!(None, c.get(tid(1)));
        assert_eq!(c, clock(&[100, -1, 1]));
    }

    #[test]
    fn vector_clock_is_serializable() {
        let c = clock(&[1, 2, 3]);
        let str = serde_json::to_string_pretty(&c).unwrap();
        let c2: VectorClock = serde_json::from_str(&str).unwrap();
        assert_eq!(c, c2);
    }
}
