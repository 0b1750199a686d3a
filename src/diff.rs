//! Symmetric set difference, shared by directory-watch and tailer
//! reconciliation.

use std::collections::HashSet;
use std::hash::Hash;

/// The two halves of a symmetric difference between an `old` and a `new` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// Present in `new`, absent from `old`.
    pub added: Vec<T>,
    /// Present in `old`, absent from `new`.
    pub removed: Vec<T>,
}

impl<T> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes which items `new` adds to and removes from `old`.
///
/// Accepts anything iterable on the `old` side so that map keys can be fed in
/// directly.
pub fn diff<'a, T, I>(old: I, new: &'a HashSet<T>) -> SetDiff<T>
where
    T: Eq + Hash + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let old: HashSet<&T> = old.into_iter().collect();

    let added = new
        .iter()
        .filter(|item| !old.contains(item))
        .cloned()
        .collect();
    let removed = old
        .into_iter()
        .filter(|item| !new.contains(*item))
        .cloned()
        .collect();

    SetDiff { added, removed }
}
