use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A map from small dense indices to values, backed by a vector of options.
///
/// Thread ids index both the graph's per-thread storage and vector clocks,
/// and they stay dense in practice, so a vector beats a hash map here.
/// Erased entries leave holes rather than shifting later indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexedMap<T>(Vec<Option<T>>);

impl<T> IndexedMap<T> {
    pub(crate) fn new() -> Self {
        IndexedMap(Vec::new())
    }

    pub(crate) fn new_with_first(first: T) -> Self {
        IndexedMap(vec![Some(first)])
    }

    pub(crate) fn insert(&mut self, ind: usize, value: T) {
        if self.0.len() <= ind {
            self.0.resize_with(ind + 1, Default::default);
        }
        self.0[ind] = Some(value);
    }

    pub(crate) fn get(&self, ind: usize) -> Option<&T> {
        self.0.get(ind).and_then(|v| v.as_ref())
    }

    pub(crate) fn get_mut(&mut self, ind: usize) -> Option<&mut T> {
        self.0.get_mut(ind).and_then(|v| v.as_mut())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter().filter_map(|v| v.as_ref())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut().filter_map(|v| v.as_mut())
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (usize, &T)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
    }

    /// Drop every entry for which the predicate fails, then trim trailing holes.
    pub(crate) fn retain<F: FnMut(&T) -> bool>(&mut self, mut f: F) {
        for slot in &mut self.0 {
            if let Some(v) = slot {
                if !f(v) {
                    *slot = None;
                }
            }
        }
        let trailing = self.0.iter().rev().take_while(|e| e.is_none()).count();
        self.0.truncate(self.0.len() - trailing);
    }
}

// Unchecked indexing: the caller asserts the entry is populated.
impl<T> Index<usize> for IndexedMap<T> {
    type Output = T;
    fn index(&self, i: usize) -> &T {
        self.0[i].as_ref().unwrap()
    }
}

impl<T> IndexMut<usize> for IndexedMap<T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        self.0[i].as_mut().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_and_retain() {
        let mut m: IndexedMap<u32> = IndexedMap::new();
        m.insert(0, 10);
        m.insert(3, 13);
        assert_eq!(m.get(1), None);
        assert_eq!(m.iter().copied().collect::<Vec<_>>(), vec![10, 13]);
        assert_eq!(m.entries().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 3]);

        m.retain(|&v| v == 10);
        assert_eq!(m.get(3), None);
        assert_eq!(m.get(0), Some(&10));
    }
}
