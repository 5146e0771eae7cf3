//! Ascending size-class table mapping block sizes to pool chains.

use core::ptr;

use crate::config::SizeClasses;
use crate::engine::pool::PoolHeader;
use crate::utils::WORD_SIZE;

/// One size class: a block size and the head of its pool chain.
///
/// The head is only dereferenced by the engine while it holds the lock;
/// the table itself treats it as opaque.
pub(crate) struct SizeClass {
    pub(crate) size: usize,
    pub(crate) head: *mut PoolHeader,
}

/// Strictly ascending array of size classes.
pub(crate) struct SizeClassTable {
    classes: Vec<SizeClass>,
    /// Largest size the table may grow a class for; `None` in fixed mode.
    growth_ceiling: Option<usize>,
}

impl SizeClassTable {
    /// Builds the table from a validated configuration.
    pub(crate) fn new(classes: &SizeClasses) -> Self {
        match classes {
            SizeClasses::Fixed(sizes) => Self {
                classes: sizes
                    .iter()
                    .map(|&size| SizeClass {
                        size: size.max(WORD_SIZE),
                        head: ptr::null_mut(),
                    })
                    .collect(),
                growth_ceiling: None,
            },
            SizeClasses::Dynamic { growth_ceiling } => Self {
                classes: Vec::new(),
                growth_ceiling: Some(*growth_ceiling),
            },
        }
    }

    /// Index of the smallest class that can serve `size`.
    ///
    /// In dynamic mode a missing class is inserted (size clamped to at
    /// least one machine word) via one bounded insertion-sort step,
    /// preserving ascending order. Returns `None` when the request is too
    /// large for any class, present or permissible: the caller falls back
    /// to the heap backend.
    pub(crate) fn find_or_grow(&mut self, size: usize) -> Option<usize> {
        let idx = self.classes.partition_point(|c| c.size < size);
        if idx < self.classes.len() {
            return Some(idx);
        }

        let ceiling = self.growth_ceiling?;
        if size > ceiling {
            return None;
        }

        let clamped = size.max(WORD_SIZE);
        let pos = self.classes.partition_point(|c| c.size < clamped);
        if pos < self.classes.len() && self.classes[pos].size == clamped {
            return Some(pos);
        }
        tracing::debug!(size = clamped, "growing size-class table");
        self.classes.insert(
            pos,
            SizeClass {
                size: clamped,
                head: ptr::null_mut(),
            },
        );
        Some(pos)
    }

    /// Index of the smallest class that can serve `size`, never growing
    /// the table.
    pub(crate) fn find(&self, size: usize) -> Option<usize> {
        let idx = self.classes.partition_point(|c| c.size < size);
        (idx < self.classes.len()).then_some(idx)
    }

    /// Index of the class with exactly `class_size`, if present.
    ///
    /// Used on the deallocation path, where the owning pool already names
    /// its class; classes are never removed, so the lookup cannot miss for
    /// a live pool.
    pub(crate) fn index_of(&self, class_size: usize) -> Option<usize> {
        self.classes
            .binary_search_by_key(&class_size, |c| c.size)
            .ok()
    }

    pub(crate) fn get(&self, idx: usize) -> &SizeClass {
        &self.classes[idx]
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut SizeClass {
        &mut self.classes[idx]
    }

    /// Largest configured class size, or zero for an empty dynamic table.
    #[cfg(test)]
    pub(crate) fn largest(&self) -> usize {
        self.classes.last().map_or(0, |c| c.size)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }

    #[cfg(test)]
    pub(crate) fn sizes(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.size).collect()
    }
}
